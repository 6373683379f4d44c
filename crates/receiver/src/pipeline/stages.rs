//! Stage behaviours: what each stage kind does with a buffer

use super::convert::{i420_to_bgr, rgb_to_bgr, scale_nearest};
use super::pad::{MediaBuffer, PushResult};
use super::StageContext;
use crate::media::{FrameSinkSettings, PixelFormat, Sample, ScaleTarget, StreamDescriptor};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Processing logic run by a stage task for every input buffer
#[async_trait]
pub trait StageBehavior: Send {
    async fn process(&mut self, buffer: MediaBuffer, ctx: &StageContext) -> Result<()>;
}

fn forwarded(result: PushResult, ctx: &StageContext) {
    if result != PushResult::Delivered {
        trace!("{} output: {:?}", ctx.stage(), result);
    }
}

/// Bounded buffering; the bound is the stage's input capacity
#[derive(Debug, Default)]
pub struct QueueStage;

#[async_trait]
impl StageBehavior for QueueStage {
    async fn process(&mut self, buffer: MediaBuffer, ctx: &StageContext) -> Result<()> {
        forwarded(ctx.push(buffer).await, ctx);
        Ok(())
    }
}

/// Remembers the output caps derived from the last input caps
#[derive(Debug, Default)]
struct CapsCache {
    last: Option<(Arc<StreamDescriptor>, Arc<StreamDescriptor>)>,
}

impl CapsCache {
    fn get_or_insert(
        &mut self,
        input: &Arc<StreamDescriptor>,
        derive: impl FnOnce(&StreamDescriptor) -> StreamDescriptor,
    ) -> Arc<StreamDescriptor> {
        match &self.last {
            Some((seen, out)) if **seen == **input => Arc::clone(out),
            _ => {
                let out = Arc::new(derive(input));
                self.last = Some((Arc::clone(input), Arc::clone(&out)));
                out
            }
        }
    }
}

fn geometry(caps: &StreamDescriptor) -> Result<(usize, usize, PixelFormat)> {
    match (caps.width, caps.height, caps.format) {
        (Some(w), Some(h), Some(f)) if w > 0 && h > 0 => Ok((w as usize, h as usize, f)),
        _ => Err(Error::StageError(format!("incomplete raw video caps: {}", caps))),
    }
}

/// Converts raw video to packed BGR
#[derive(Debug, Default)]
pub struct ConvertStage {
    caps: CapsCache,
}

#[async_trait]
impl StageBehavior for ConvertStage {
    async fn process(&mut self, buffer: MediaBuffer, ctx: &StageContext) -> Result<()> {
        let (width, height, format) = geometry(&buffer.caps)?;
        let stride = buffer.caps.stride.unwrap_or(width * 3);

        let data = match format {
            PixelFormat::Bgr24 => {
                forwarded(ctx.push(buffer).await, ctx);
                return Ok(());
            }
            PixelFormat::Rgb24 => rgb_to_bgr(&buffer.data, width, height, stride)?,
            PixelFormat::I420 => i420_to_bgr(&buffer.data, width, height)?,
        };

        let caps = self.caps.get_or_insert(&buffer.caps, |_| {
            StreamDescriptor::raw_video(PixelFormat::Bgr24, width as u32, height as u32)
        });
        let out = MediaBuffer::new(data, caps).with_pts(buffer.pts);
        forwarded(ctx.push(out).await, ctx);
        Ok(())
    }
}

/// Resizes packed frames to a fixed size, or passes them through
#[derive(Debug)]
pub struct ScaleStage {
    target: ScaleTarget,
    caps: CapsCache,
}

impl ScaleStage {
    pub fn new(target: ScaleTarget) -> Self {
        Self {
            target,
            caps: CapsCache::default(),
        }
    }
}

#[async_trait]
impl StageBehavior for ScaleStage {
    async fn process(&mut self, buffer: MediaBuffer, ctx: &StageContext) -> Result<()> {
        let ScaleTarget::Fixed {
            width: tw,
            height: th,
        } = self.target
        else {
            forwarded(ctx.push(buffer).await, ctx);
            return Ok(());
        };

        let (width, height, format) = geometry(&buffer.caps)?;
        if (width, height) == (tw as usize, th as usize) {
            forwarded(ctx.push(buffer).await, ctx);
            return Ok(());
        }

        let bpp = format.packed_bytes_per_pixel().ok_or_else(|| {
            Error::StageError(format!("cannot scale planar {}", format.name()))
        })?;
        let stride = buffer.caps.stride.unwrap_or(width * bpp);
        let data = scale_nearest(&buffer.data, width, height, stride, tw as usize, th as usize)?;

        let caps = self
            .caps
            .get_or_insert(&buffer.caps, |_| StreamDescriptor::raw_video(format, tw, th));
        forwarded(ctx.push(MediaBuffer::new(data, caps).with_pts(buffer.pts)).await, ctx);
        Ok(())
    }
}

/// Only lets buffers of one pixel format through
#[derive(Debug)]
pub struct CapsFilterStage {
    format: PixelFormat,
}

impl CapsFilterStage {
    pub fn new(format: PixelFormat) -> Self {
        Self { format }
    }
}

#[async_trait]
impl StageBehavior for CapsFilterStage {
    async fn process(&mut self, buffer: MediaBuffer, ctx: &StageContext) -> Result<()> {
        if !buffer.caps.is_video() || buffer.caps.format != Some(self.format) {
            return Err(Error::StageError(format!(
                "not negotiated: expected {} got {}",
                self.format.name(),
                buffer.caps
            )));
        }
        forwarded(ctx.push(buffer).await, ctx);
        Ok(())
    }
}

/// Terminal stage invoking the sample callback
pub struct FrameSinkStage {
    settings: FrameSinkSettings,
    clock_base: Option<(Instant, Duration)>,
}

impl FrameSinkStage {
    pub fn new(settings: FrameSinkSettings) -> Self {
        Self {
            settings,
            clock_base: None,
        }
    }

    async fn wait_for_pts(&mut self, pts: Duration) {
        let (start, first) = *self.clock_base.get_or_insert((Instant::now(), pts));
        let due = start + pts.saturating_sub(first);
        tokio::time::sleep_until(due).await;
    }
}

#[async_trait]
impl StageBehavior for FrameSinkStage {
    async fn process(&mut self, buffer: MediaBuffer, _ctx: &StageContext) -> Result<()> {
        if self.settings.sync {
            if let Some(pts) = buffer.pts {
                self.wait_for_pts(pts).await;
            }
        }

        if !self.settings.emit_signals {
            return Ok(());
        }

        (self.settings.on_sample)(Sample {
            descriptor: &buffer.caps,
            data: &buffer.data,
            pts: buffer.pts,
        })
    }
}
