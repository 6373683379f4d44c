//! Render loop and rendering surfaces
//!
//! The render loop runs on its own thread. It polls the [`FrameExchange`]
//! at a fixed interval, hands frames it has not seen yet to a
//! [`FrameSurface`], and turns an exit key into a shutdown request.

use crate::media::{Frame, FrameExchange, PixelFormat};
use crate::shutdown::Shutdown;
use crate::signaling::KeyPress;
use crate::{Error, Result};
use image::{ImageFormat, RgbImage};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Minimum time between two snapshot writes
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Where decoded frames end up
pub trait FrameSurface: Send {
    fn present(&mut self, frame: &Frame) -> Result<()>;

    /// Wait up to `timeout` for a key press
    fn wait_key(&mut self, timeout: Duration) -> Option<KeyPress>;

    fn close(&mut self);
}

/// Poll `exchange` until shutdown or an exit key; returns frames presented
pub fn run_render_loop(
    exchange: &FrameExchange,
    surface: &mut dyn FrameSurface,
    interval: Duration,
    shutdown: &Shutdown,
) -> u64 {
    let mut last_sequence = 0u64;
    let mut presented = 0u64;

    info!("Render loop started, polling every {:?}", interval);
    while !shutdown.is_triggered() {
        if let Some(frame) = exchange.take_latest() {
            if frame.sequence != last_sequence {
                last_sequence = frame.sequence;
                match surface.present(&frame) {
                    Ok(()) => presented += 1,
                    Err(e) if e.is_fatal() => {
                        error!("Surface is unusable: {}", e);
                        shutdown.trigger();
                    }
                    Err(e) => warn!("Failed to present frame {}: {}", frame.sequence, e),
                }
            }
        }

        if let Some(key) = surface.wait_key(interval) {
            if key.is_quit() {
                info!("Exit key {:?} pressed", key);
                shutdown.trigger();
            }
        }
    }

    surface.close();
    info!("Render loop stopped after {} frames", presented);
    presented
}

/// Surface without a window
///
/// Logs what it presents and optionally keeps a PNG snapshot of the newest
/// frame on disk. Exit keys come from the console reader.
pub struct HeadlessSurface {
    keys: Receiver<KeyPress>,
    snapshot_path: Option<PathBuf>,
    last_snapshot: Option<Instant>,
    presented: u64,
    last_size: Option<(u32, u32)>,
}

impl HeadlessSurface {
    pub fn new(keys: Receiver<KeyPress>) -> Self {
        Self {
            keys,
            snapshot_path: None,
            last_snapshot: None,
            presented: 0,
            last_size: None,
        }
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    fn write_snapshot(&mut self, frame: &Frame) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if self
            .last_snapshot
            .is_some_and(|at| at.elapsed() < SNAPSHOT_INTERVAL)
        {
            return Ok(());
        }

        let image = bgr_to_image(frame)?;
        image
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| Error::RenderError(format!("snapshot {}: {}", path.display(), e)))?;
        self.last_snapshot = Some(Instant::now());
        debug!("Snapshot of frame {} written to {}", frame.sequence, path.display());
        Ok(())
    }
}

impl FrameSurface for HeadlessSurface {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.presented += 1;
        let size = (frame.width, frame.height);
        if self.last_size != Some(size) {
            info!("Presenting {}x{} video", frame.width, frame.height);
            self.last_size = Some(size);
        }
        self.write_snapshot(frame)
    }

    fn wait_key(&mut self, timeout: Duration) -> Option<KeyPress> {
        match self.keys.recv_timeout(timeout) {
            Ok(key) => Some(key),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                None
            }
        }
    }

    fn close(&mut self) {
        debug!("Headless surface closed after {} frames", self.presented);
    }
}

/// Packed BGR frame to an RGB image without stride padding
pub fn bgr_to_image(frame: &Frame) -> Result<RgbImage> {
    if frame.format != PixelFormat::Bgr24 {
        return Err(Error::RenderError(format!(
            "cannot render {} frames",
            frame.format.name()
        )));
    }

    let mut rgb = Vec::with_capacity(frame.width as usize * frame.height as usize * 3);
    for y in 0..frame.height {
        let row = frame
            .row(y)
            .ok_or_else(|| Error::RenderError(format!("frame {} truncated at row {}", frame.sequence, y)))?;
        for px in row.chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }

    RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| Error::RenderError("frame size mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Records presented sequence numbers and replays scripted keys
    struct ScriptedSurface {
        exchange: FrameExchange,
        presented: Vec<u64>,
        ticks: u32,
        closed: bool,
    }

    impl FrameSurface for ScriptedSurface {
        fn present(&mut self, frame: &Frame) -> Result<()> {
            self.presented.push(frame.sequence);
            Ok(())
        }

        fn wait_key(&mut self, _timeout: Duration) -> Option<KeyPress> {
            self.ticks += 1;
            match self.ticks {
                // Nothing new on tick 2, a new frame before tick 3
                2 => {
                    self.exchange.publish(Frame::bgr(1, 1, vec![0, 0, 0]));
                    None
                }
                4 => Some(KeyPress::Char('x')),
                5 => Some(KeyPress::Escape),
                _ => None,
            }
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn test_loop_presents_each_frame_once_and_quits() {
        let exchange = FrameExchange::new();
        exchange.publish(Frame::bgr(1, 1, vec![1, 2, 3]));
        let mut surface = ScriptedSurface {
            exchange: exchange.clone(),
            presented: Vec::new(),
            ticks: 0,
            closed: false,
        };
        let shutdown = Shutdown::new();

        let count = run_render_loop(&exchange, &mut surface, Duration::from_millis(1), &shutdown);

        assert_eq!(count, 2);
        assert_eq!(surface.presented, vec![1, 2]);
        assert_eq!(surface.ticks, 5);
        assert!(surface.closed);
        assert!(shutdown.is_triggered());
    }

    /// Fails every present with the error `fail` builds
    struct FailingSurface {
        exchange: FrameExchange,
        fail: fn() -> Error,
        attempts: u32,
    }

    impl FrameSurface for FailingSurface {
        fn present(&mut self, _frame: &Frame) -> Result<()> {
            self.attempts += 1;
            Err((self.fail)())
        }

        fn wait_key(&mut self, _timeout: Duration) -> Option<KeyPress> {
            if self.attempts >= 3 {
                return Some(KeyPress::Char('q'));
            }
            self.exchange.publish(Frame::bgr(1, 1, vec![0, 0, 0]));
            None
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_fatal_surface_error_stops_loop() {
        let run = |fail: fn() -> Error| {
            let exchange = FrameExchange::new();
            exchange.publish(Frame::bgr(1, 1, vec![1, 2, 3]));
            let mut surface = FailingSurface {
                exchange: exchange.clone(),
                fail,
                attempts: 0,
            };
            let shutdown = Shutdown::new();
            run_render_loop(&exchange, &mut surface, Duration::from_millis(1), &shutdown);
            assert!(shutdown.is_triggered());
            surface.attempts
        };

        assert_eq!(run(|| Error::PipelineConstruction("window lost".to_string())), 1);
        // Recoverable errors keep the loop going until the exit key
        assert_eq!(run(|| Error::RenderError("snapshot".to_string())), 3);
    }

    #[test]
    fn test_loop_exits_when_already_shut_down() {
        let exchange = FrameExchange::new();
        let (_tx, rx) = mpsc::channel();
        let mut surface = HeadlessSurface::new(rx);
        let shutdown = Shutdown::new();
        shutdown.trigger();

        assert_eq!(
            run_render_loop(&exchange, &mut surface, Duration::from_millis(1), &shutdown),
            0
        );
    }

    #[test]
    fn test_headless_wait_key() {
        let (tx, rx) = mpsc::channel();
        let mut surface = HeadlessSurface::new(rx);
        tx.send(KeyPress::Char('q')).unwrap();

        assert_eq!(surface.wait_key(Duration::from_millis(1)), Some(KeyPress::Char('q')));
        assert_eq!(surface.wait_key(Duration::from_millis(1)), None);
        drop(tx);
        assert_eq!(surface.wait_key(Duration::from_millis(1)), None);
    }

    #[test]
    fn test_bgr_to_image_swaps_channels() {
        let mut frame = Frame::bgr(1, 2, vec![1, 2, 3, 0, 4, 5, 6, 0]);
        frame.stride = 4;
        let image = bgr_to_image(&frame).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [3, 2, 1]);
        assert_eq!(image.get_pixel(0, 1).0, [6, 5, 4]);

        frame.format = PixelFormat::I420;
        assert!(bgr_to_image(&frame).is_err());
    }

    #[test]
    fn test_snapshot_is_written_and_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.png");
        let (_tx, rx) = mpsc::channel();
        let mut surface = HeadlessSurface::new(rx).with_snapshot(&path);

        surface.present(&Frame::bgr(2, 1, vec![255, 0, 0, 0, 0, 255])).unwrap();
        let written = image::open(&path).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (2, 1));
        assert_eq!(written.get_pixel(0, 0).0, [0, 0, 255]);

        // Second frame within the interval leaves the file alone
        surface.present(&Frame::bgr(1, 1, vec![0, 0, 0])).unwrap();
        assert_eq!(image::open(&path).unwrap().to_rgb8().dimensions(), (2, 1));
    }
}
