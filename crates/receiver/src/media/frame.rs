//! Decoded frames and the single-slot exchange handing them to the renderer

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pixel layouts flowing through the conversion stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0 (Y, U, V planes), decoder output
    I420,
    /// Packed 8-bit RGB
    Rgb24,
    /// Packed 8-bit BGR, what the frame sink delivers
    Bgr24,
}

impl PixelFormat {
    /// Caps-style format name
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "I420",
            PixelFormat::Rgb24 => "RGB",
            PixelFormat::Bgr24 => "BGR",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "I420" => Some(PixelFormat::I420),
            "RGB" => Some(PixelFormat::Rgb24),
            "BGR" => Some(PixelFormat::Bgr24),
            _ => None,
        }
    }

    /// Bytes per pixel for packed formats
    pub fn packed_bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::I420 => None,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
        }
    }

    /// Minimum buffer length for a frame with the given geometry
    pub fn frame_len(&self, width: usize, height: usize, stride: usize) -> usize {
        match self {
            PixelFormat::I420 => {
                let chroma = width.div_ceil(2) * height.div_ceil(2);
                width * height + 2 * chroma
            }
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => stride * height,
        }
    }
}

/// A decoded video frame owned by the consumer
///
/// Pixel bytes are reference counted; cloning a frame never copies pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: usize,
    pub format: PixelFormat,
    pub pts: Option<Duration>,
    /// Assigned by [`FrameExchange::publish`], starts at 1
    pub sequence: u64,
    pub data: Bytes,
}

impl Frame {
    /// Packed BGR frame with a compact stride
    pub fn bgr(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            stride: width as usize * 3,
            format: PixelFormat::Bgr24,
            pts: None,
            sequence: 0,
            data: data.into(),
        }
    }

    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Row `y` without stride padding
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let bpp = self.format.packed_bytes_per_pixel()?;
        let start = y as usize * self.stride;
        self.data.get(start..start + self.width as usize * bpp)
    }
}

/// Newest-wins hand-off between the media pipeline and the render loop
///
/// The slot is overwritten on every publish and read without being cleared,
/// so a slow consumer only ever sees the latest frame.
#[derive(Debug, Clone, Default)]
pub struct FrameExchange {
    slot: Arc<Mutex<Option<Frame>>>,
    published: Arc<AtomicU64>,
}

impl FrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame`, replacing whatever was there; returns its sequence number
    pub fn publish(&self, mut frame: Frame) -> u64 {
        let sequence = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        frame.sequence = sequence;
        *self.slot.lock() = Some(frame);
        sequence
    }

    /// Copy of the newest frame, `None` until the first publish
    pub fn take_latest(&self) -> Option<Frame> {
        self.slot.lock().clone()
    }

    /// Number of frames published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_exchange() {
        let exchange = FrameExchange::new();
        assert!(exchange.take_latest().is_none());
        assert_eq!(exchange.published(), 0);
    }

    #[test]
    fn test_newest_wins() {
        let exchange = FrameExchange::new();
        exchange.publish(Frame::bgr(1, 1, vec![1, 1, 1]));
        exchange.publish(Frame::bgr(1, 1, vec![2, 2, 2]));

        let latest = exchange.take_latest().unwrap();
        assert_eq!(latest.data.as_ref(), &[2, 2, 2]);
        assert_eq!(latest.sequence, 2);

        // Reading does not clear the slot
        assert_eq!(exchange.take_latest().unwrap().sequence, 2);
    }

    #[test]
    fn test_concurrent_publishers() {
        let exchange = FrameExchange::new();
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let exchange = exchange.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        exchange.publish(Frame::bgr(2, 1, vec![i; 6]));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let latest = exchange.take_latest().unwrap();
        assert_eq!(exchange.published(), 400);
        // Never a torn frame
        assert!(latest.data.iter().all(|&b| b == latest.data[0]));
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(PixelFormat::I420.frame_len(4, 2, 4), 8 + 2 * 2);
        assert_eq!(PixelFormat::I420.frame_len(3, 3, 3), 9 + 2 * 4);
        assert_eq!(PixelFormat::Bgr24.frame_len(4, 2, 16), 32);
    }

    #[test]
    fn test_row_access() {
        let mut frame = Frame::bgr(1, 2, vec![1, 2, 3, 0, 4, 5, 6, 0]);
        frame.stride = 4;
        assert_eq!(frame.row(1).unwrap(), &[4, 5, 6]);
        assert!(frame.row(2).is_none());
    }

    #[test]
    fn test_format_names() {
        assert_eq!(PixelFormat::from_name("bgr"), Some(PixelFormat::Bgr24));
        assert_eq!(PixelFormat::I420.name(), "I420");
        assert!(PixelFormat::from_name("NV12").is_none());
    }
}
