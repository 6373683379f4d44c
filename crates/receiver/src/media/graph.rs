//! Media graph capability set
//!
//! The builder only ever talks to the graph through [`MediaGraph`]; the
//! in-process [`crate::pipeline::Pipeline`] is one implementation, tests use
//! mocks.

use super::frame::PixelFormat;
use crate::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Handle to a stage created in a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u64);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// Handle to a dynamically exposed output pad (engine stream or decoder output)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PadId(pub u64);

impl fmt::Display for PadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pad#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Unknown,
}

impl MediaKind {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            _ => MediaKind::Unknown,
        }
    }
}

/// Media type prefix of RTP streams coming out of the engine
pub const RTP_MEDIA_TYPE: &str = "application/x-rtp";
/// Media type of decoded video
pub const RAW_VIDEO_MEDIA_TYPE: &str = "video/x-raw";

/// Format of the data flowing out of a pad
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Structure name, e.g. `application/x-rtp` or `video/x-raw`
    pub media_type: String,
    pub media: MediaKind,
    pub encoding_name: Option<String>,
    pub payload_type: Option<u8>,
    pub clock_rate: Option<u32>,
    pub format: Option<PixelFormat>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Bytes per row of the first plane
    pub stride: Option<usize>,
}

impl StreamDescriptor {
    /// RTP stream as exposed by the engine
    pub fn rtp(media: MediaKind, encoding_name: &str, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            media_type: RTP_MEDIA_TYPE.to_string(),
            media,
            encoding_name: Some(encoding_name.to_ascii_uppercase()),
            payload_type: Some(payload_type),
            clock_rate: Some(clock_rate),
            format: None,
            width: None,
            height: None,
            stride: None,
        }
    }

    /// Decoded video with a compact stride
    pub fn raw_video(format: PixelFormat, width: u32, height: u32) -> Self {
        let stride = format
            .packed_bytes_per_pixel()
            .map(|bpp| width as usize * bpp)
            .unwrap_or(width as usize);
        Self {
            media_type: RAW_VIDEO_MEDIA_TYPE.to_string(),
            media: MediaKind::Video,
            encoding_name: None,
            payload_type: None,
            clock_rate: None,
            format: Some(format),
            width: Some(width),
            height: Some(height),
            stride: Some(stride),
        }
    }

    /// Any other media type (used for audio and odd pads)
    pub fn other(media_type: &str, media: MediaKind) -> Self {
        Self {
            media_type: media_type.to_string(),
            media,
            encoding_name: None,
            payload_type: None,
            clock_rate: None,
            format: None,
            width: None,
            height: None,
            stride: None,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = Some(stride);
        self
    }

    pub fn is_rtp(&self) -> bool {
        self.media_type.starts_with(RTP_MEDIA_TYPE)
    }

    pub fn is_video(&self) -> bool {
        self.media_type.starts_with("video/")
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media_type)?;
        if let Some(enc) = &self.encoding_name {
            write!(f, ", encoding-name={}", enc)?;
        }
        if let Some(pt) = self.payload_type {
            write!(f, ", payload={}", pt)?;
        }
        if let Some(format) = self.format {
            write!(f, ", format={}", format.name())?;
        }
        if let (Some(w), Some(h)) = (self.width, self.height) {
            write!(f, ", width={}, height={}", w, h)?;
        }
        Ok(())
    }
}

/// Output geometry of the scaling stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleTarget {
    #[default]
    Passthrough,
    Fixed { width: u32, height: u32 },
}

/// A decoded buffer handed to the frame sink callback
///
/// The data borrows the graph's buffer; the callback copies what it keeps.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub descriptor: &'a StreamDescriptor,
    pub data: &'a [u8],
    pub pts: Option<Duration>,
}

pub type SampleHandler = Arc<dyn Fn(Sample<'_>) -> Result<()> + Send + Sync>;

pub type PadAddedHandler = Arc<dyn Fn(PadId, StreamDescriptor) + Send + Sync>;

/// Frame sink behaviour
#[derive(Clone)]
pub struct FrameSinkSettings {
    /// Invoke `on_sample` for every buffer
    pub emit_signals: bool,
    /// Hold buffers until their presentation time
    pub sync: bool,
    /// Input capacity in buffers
    pub max_buffers: usize,
    /// Drop new buffers instead of blocking when full
    pub drop: bool,
    pub on_sample: SampleHandler,
}

impl FrameSinkSettings {
    /// Latest-frame-only sink: notify, no clock sync, one buffer, leaky
    pub fn latest_only(on_sample: SampleHandler) -> Self {
        Self {
            emit_signals: true,
            sync: false,
            max_buffers: 1,
            drop: true,
            on_sample,
        }
    }
}

impl fmt::Debug for FrameSinkSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSinkSettings")
            .field("emit_signals", &self.emit_signals)
            .field("sync", &self.sync)
            .field("max_buffers", &self.max_buffers)
            .field("drop", &self.drop)
            .finish_non_exhaustive()
    }
}

/// Stage kinds the builder creates
#[derive(Debug, Clone)]
pub enum StageKind {
    /// Bounded buffering
    Queue { max_buffers: usize },
    /// Format-detecting depayloader + decoder, exposes output pads dynamically
    DecodeBin,
    /// Pixel format conversion
    VideoConvert,
    VideoScale(ScaleTarget),
    /// Only lets the given pixel format through
    CapsFilter(PixelFormat),
    FrameSink(FrameSinkSettings),
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Queue { .. } => "queue",
            StageKind::DecodeBin => "decodebin",
            StageKind::VideoConvert => "videoconvert",
            StageKind::VideoScale(_) => "videoscale",
            StageKind::CapsFilter(_) => "capsfilter",
            StageKind::FrameSink(_) => "framesink",
        }
    }
}

/// Graph primitives needed to grow decode branches at runtime
///
/// Methods are synchronous so they can be called from engine callbacks.
pub trait MediaGraph: Send + Sync {
    /// Create a detached stage
    fn create_stage(&self, kind: StageKind) -> Result<StageId>;

    /// Add a stage to the running graph
    fn attach(&self, stage: StageId) -> Result<()>;

    /// Link `upstream`'s output to `downstream`'s input
    fn link(&self, upstream: StageId, downstream: StageId) -> Result<()>;

    /// Link a dynamic pad to a stage input
    fn link_pad(&self, pad: PadId, stage: StageId) -> Result<()>;

    /// Bring a stage to the graph's running state
    fn sync_with_graph(&self, stage: StageId) -> Result<()>;

    /// Stop and remove a stage; unknown ids are ignored
    fn discard(&self, stage: StageId);

    /// Call `handler` whenever `stage` exposes a new output pad
    fn on_output_pad_added(&self, stage: StageId, handler: PadAddedHandler) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_descriptor() {
        let desc = StreamDescriptor::rtp(MediaKind::Video, "vp8", 96, 90000);
        assert!(desc.is_rtp());
        assert!(!desc.is_video());
        assert_eq!(desc.encoding_name.as_deref(), Some("VP8"));
        assert_eq!(
            desc.to_string(),
            "application/x-rtp, encoding-name=VP8, payload=96"
        );
    }

    #[test]
    fn test_raw_video_descriptor() {
        let desc = StreamDescriptor::raw_video(PixelFormat::Bgr24, 640, 480);
        assert!(desc.is_video());
        assert!(!desc.is_rtp());
        assert_eq!(desc.stride, Some(1920));

        let i420 = StreamDescriptor::raw_video(PixelFormat::I420, 640, 480);
        assert_eq!(i420.stride, Some(640));
    }

    #[test]
    fn test_audio_is_not_video() {
        let desc = StreamDescriptor::other("audio/x-raw", MediaKind::Audio);
        assert!(!desc.is_video());
        assert!(!desc.is_rtp());
    }

    #[test]
    fn test_latest_only_sink() {
        let settings = FrameSinkSettings::latest_only(Arc::new(|_| Ok(())));
        assert!(settings.emit_signals);
        assert!(!settings.sync);
        assert_eq!(settings.max_buffers, 1);
        assert!(settings.drop);
    }
}
