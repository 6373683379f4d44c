//! Frame sink delivery: maps decoded samples into frames and publishes them

use super::frame::{Frame, FrameExchange, PixelFormat};
use super::graph::{Sample, SampleHandler};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Producer side of the [`FrameExchange`]
///
/// Only packed BGR samples are accepted; pixels are copied out of the
/// graph's buffer into a compact frame before publishing.
#[derive(Debug)]
pub struct FrameProducer {
    exchange: FrameExchange,
    log_interval: u64,
    delivered: AtomicU64,
}

impl FrameProducer {
    pub fn new(exchange: FrameExchange, log_interval: u64) -> Self {
        Self {
            exchange,
            log_interval,
            delivered: AtomicU64::new(0),
        }
    }

    /// Map, copy and publish one sample
    pub fn deliver(&self, sample: Sample<'_>) -> Result<()> {
        let frame = map_bgr(&sample)?;
        let (width, height) = (frame.width, frame.height);
        self.exchange.publish(frame);

        let count = self.delivered.fetch_add(1, Ordering::Relaxed);
        if self.log_interval > 0 && count % self.log_interval == 0 {
            let ts = sample.pts.map(|p| p.as_secs_f64()).unwrap_or(-1.0);
            info!("Frame {}x{} ts={:.3}s", width, height, ts);
        }
        Ok(())
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Callback for [`super::graph::FrameSinkSettings`]
    pub fn sample_handler(self: &Arc<Self>) -> SampleHandler {
        let producer = Arc::clone(self);
        Arc::new(move |sample| {
            producer.deliver(sample).inspect_err(|e| {
                debug!("Dropping frame: {}", e);
            })
        })
    }
}

fn map_bgr(sample: &Sample<'_>) -> Result<Frame> {
    let desc = sample.descriptor;

    if desc.format != Some(PixelFormat::Bgr24) {
        return Err(Error::FrameMapping(format!(
            "expected BGR, got {}",
            desc.format.map(|f| f.name()).unwrap_or("unknown")
        )));
    }

    let (width, height) = match (desc.width, desc.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(Error::FrameMapping(format!(
                "missing or empty dimensions in {}",
                desc
            )))
        }
    };

    let row_len = width as usize * 3;
    let stride = desc.stride.unwrap_or(row_len);
    if stride < row_len {
        return Err(Error::FrameMapping(format!(
            "stride {} shorter than row of {} bytes",
            stride, row_len
        )));
    }

    let needed = stride * (height as usize - 1) + row_len;
    if sample.data.len() < needed {
        return Err(Error::FrameMapping(format!(
            "buffer holds {} bytes, {}x{} needs {}",
            sample.data.len(),
            width,
            height,
            needed
        )));
    }

    let mut pixels = Vec::with_capacity(row_len * height as usize);
    for row in sample.data.chunks(stride).take(height as usize) {
        pixels.extend_from_slice(&row[..row_len]);
    }

    let mut frame = Frame::bgr(width, height, pixels);
    frame.pts = sample.pts;
    Ok(frame)
}
