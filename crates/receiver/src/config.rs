//! Configuration types for the WebRTC receiver

use crate::sdp::CandidateFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Main configuration for the receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// STUN server URI (`stun:` or `stuns:` scheme)
    pub stun_server: String,

    /// Codec offered on the recv-only video transceiver (default: VP8)
    pub video_codec: VideoCodec,

    /// RTP payload type for the offered codec (default: 96)
    pub payload_type: u8,

    /// RTP clock rate for the offered codec (default: 90000)
    pub clock_rate: u32,

    /// Candidate shapes removed from offers and answers
    pub candidate_filter: CandidateFilter,

    /// How many pasted answers are accepted before giving up (default: 3)
    pub max_answer_attempts: u32,

    /// Render loop polling interval in milliseconds (default: 10)
    pub render_interval_ms: u64,

    /// Log one delivered frame out of this many (default: 60)
    pub frame_log_interval: u64,

    /// Interval between key frame requests in milliseconds, 0 disables (default: 3000)
    pub keyframe_request_interval_ms: u64,

    /// Capacity of the buffering stage in front of each decoder (default: 200)
    pub queue_capacity: usize,

    /// Fixed output size for the scaling stage; passthrough when unset
    pub output_size: Option<VideoSize>,

    /// Write a PNG snapshot of the newest frame to this path
    pub snapshot_path: Option<PathBuf>,
}

/// Video codecs the receiver can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    /// VP8 (WebRTC mandatory-to-implement, default)
    VP8,
    /// H.264 constrained baseline
    H264,
}

impl VideoCodec {
    /// Engine MIME type
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::H264 => "video/H264",
        }
    }

    /// RTP encoding name as it appears in `a=rtpmap`
    pub fn encoding_name(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "VP8",
            VideoCodec::H264 => "H264",
        }
    }

    /// `a=fmtp` parameters offered for this codec
    pub fn fmtp_line(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "",
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
        }
    }
}

impl FromStr for VideoCodec {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vp8" => Ok(VideoCodec::VP8),
            "h264" | "avc" => Ok(VideoCodec::H264),
            other => Err(crate::Error::InvalidConfig(format!(
                "unsupported video codec '{}', expected vp8 or h264",
                other
            ))),
        }
    }
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSize {
    pub width: u32,
    pub height: u32,
}

impl FromStr for VideoSize {
    type Err = crate::Error;

    /// Parse `WIDTHxHEIGHT`
    fn from_str(s: &str) -> crate::Result<Self> {
        let invalid = || crate::Error::InvalidConfig(format!("invalid size '{}', expected WxH", s));
        let (w, h) = s.split_once(['x', 'X']).ok_or_else(invalid)?;
        Ok(Self {
            width: w.trim().parse().map_err(|_| invalid())?,
            height: h.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            video_codec: VideoCodec::VP8,
            payload_type: 96,
            clock_rate: 90000,
            candidate_filter: CandidateFilter::default(),
            max_answer_attempts: 3,
            render_interval_ms: 10,
            frame_log_interval: 60,
            keyframe_request_interval_ms: 3000,
            queue_capacity: 200,
            output_size: None,
            snapshot_path: None,
        }
    }
}

impl ReceiverConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_server` does not use the `stun:` or `stuns:` scheme
    /// - `payload_type` is outside the dynamic range 96-127
    /// - `max_answer_attempts` is 0
    /// - `render_interval_ms` is not in range 1-1000
    /// - `queue_capacity` is 0
    /// - `output_size` has a zero dimension
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.stun_server.starts_with("stun:") && !self.stun_server.starts_with("stuns:") {
            return Err(Error::InvalidConfig(format!(
                "stun_server must start with stun: or stuns:, got {}",
                self.stun_server
            )));
        }

        if !(96..=127).contains(&self.payload_type) {
            return Err(Error::InvalidConfig(format!(
                "payload_type must be in range 96-127, got {}",
                self.payload_type
            )));
        }

        if self.clock_rate == 0 {
            return Err(Error::InvalidConfig("clock_rate must be non-zero".to_string()));
        }

        if self.max_answer_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_answer_attempts must be at least 1".to_string(),
            ));
        }

        if self.render_interval_ms == 0 || self.render_interval_ms > 1000 {
            return Err(Error::InvalidConfig(format!(
                "render_interval_ms must be in range 1-1000, got {}",
                self.render_interval_ms
            )));
        }

        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be non-zero".to_string()));
        }

        if let Some(size) = self.output_size {
            if size.width == 0 || size.height == 0 {
                return Err(Error::InvalidConfig(format!(
                    "output_size must be non-zero, got {}x{}",
                    size.width, size.height
                )));
            }
        }

        Ok(())
    }

    /// Set the STUN server, accepting the `stun://host:port` form as well
    pub fn with_stun_server(mut self, uri: &str) -> Self {
        self.stun_server = normalize_stun_uri(uri);
        self
    }

    pub fn with_candidate_filter(mut self, filter: CandidateFilter) -> Self {
        self.candidate_filter = filter;
        self
    }

    pub fn with_video_codec(mut self, codec: VideoCodec) -> Self {
        self.video_codec = codec;
        self
    }

    pub fn with_output_size(mut self, width: u32, height: u32) -> Self {
        self.output_size = Some(VideoSize { width, height });
        self
    }

    /// Apply `WEBRTC_RECV_*` environment overrides
    pub fn apply_env(self) -> crate::Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        use crate::Error;

        fn parse<T: FromStr>(key: &str, value: &str) -> crate::Result<T> {
            value.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{} has an invalid value '{}'", key, value))
            })
        }

        fn parse_flag(key: &str, value: &str) -> crate::Result<bool> {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::InvalidConfig(format!(
                    "{} has an invalid value '{}'",
                    key, value
                ))),
            }
        }

        if let Some(v) = var("WEBRTC_RECV_VIDEO_CODEC") {
            self.video_codec = v.parse()?;
        }
        if let Some(v) = var("WEBRTC_RECV_PAYLOAD_TYPE") {
            self.payload_type = parse("WEBRTC_RECV_PAYLOAD_TYPE", &v)?;
        }
        if let Some(v) = var("WEBRTC_RECV_DROP_HOST_CANDIDATES") {
            self.candidate_filter.drop_host = parse_flag("WEBRTC_RECV_DROP_HOST_CANDIDATES", &v)?;
        }
        if let Some(v) = var("WEBRTC_RECV_MAX_ANSWER_ATTEMPTS") {
            self.max_answer_attempts = parse("WEBRTC_RECV_MAX_ANSWER_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("WEBRTC_RECV_RENDER_INTERVAL_MS") {
            self.render_interval_ms = parse("WEBRTC_RECV_RENDER_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("WEBRTC_RECV_KEYFRAME_INTERVAL_MS") {
            self.keyframe_request_interval_ms = parse("WEBRTC_RECV_KEYFRAME_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("WEBRTC_RECV_OUTPUT_SIZE") {
            self.output_size = Some(v.parse()?);
        }
        if let Some(v) = var("WEBRTC_RECV_SNAPSHOT") {
            self.snapshot_path = Some(PathBuf::from(v));
        }

        Ok(self)
    }
}

/// Turn `stun://host:port` into `stun:host:port`; other forms pass through
pub fn normalize_stun_uri(uri: &str) -> String {
    let uri = uri.trim();
    for scheme in ["stuns", "stun"] {
        if let Some(rest) = uri.strip_prefix(scheme).and_then(|r| r.strip_prefix("://")) {
            return format!("{}:{}", scheme, rest);
        }
    }
    uri.to_string()
}
