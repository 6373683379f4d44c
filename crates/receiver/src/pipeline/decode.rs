//! Format-detecting decode stage and decoder backends
//!
//! The stage looks at the caps of the first buffer it sees. Raw video is
//! passed straight through; RTP is depacketized into access units with a
//! webrtc-rs sample builder and handed to a [`VideoDecoderBackend`] chosen by
//! encoding name. The output pad is exposed once the first frame exists, at
//! which point its format is known.

use super::pad::{MediaBuffer, PushResult, SrcPad};
use super::stages::StageBehavior;
use super::StageContext;
use crate::media::{PixelFormat, StreamDescriptor};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

/// Packets a sample builder may hold back waiting for late arrivals
const MAX_LATE_PACKETS: u16 = 128;

/// A decoded picture
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: usize,
    pub data: Bytes,
}

/// Codec-specific decoding of one access unit
pub trait VideoDecoderBackend: Send {
    /// Decode a complete access unit; `None` while the decoder is still buffering
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<DecodedFrame>>;

    /// Encoding name handled by this backend
    fn codec_name(&self) -> &str;
}

pub type DecoderFactory = Arc<dyn Fn() -> Result<Box<dyn VideoDecoderBackend>> + Send + Sync>;

/// Encoding name to decoder backend mapping
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    factories: HashMap<String, DecoderFactory>,
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("DecoderRegistry").field("codecs", &names).finish()
    }
}

impl DecoderRegistry {
    /// Registry without any backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend compiled into this build
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "h264")]
        registry.register(
            "H264",
            Arc::new(|| -> Result<Box<dyn VideoDecoderBackend>> {
                Ok(Box::new(openh264_backend::OpenH264Decoder::new()?))
            }),
        );

        #[cfg(feature = "ffmpeg")]
        for name in ["VP8", "H264"] {
            if registry.supports(name) {
                continue;
            }
            registry.register(
                name,
                Arc::new(move || -> Result<Box<dyn VideoDecoderBackend>> {
                    Ok(Box::new(ffmpeg_backend::FfmpegDecoder::new(name)?))
                }),
            );
        }

        registry
    }

    /// Register (or replace) the backend for an encoding name
    pub fn register(&mut self, encoding_name: &str, factory: DecoderFactory) {
        self.factories
            .insert(encoding_name.to_ascii_uppercase(), factory);
    }

    pub fn supports(&self, encoding_name: &str) -> bool {
        self.factories
            .contains_key(&encoding_name.to_ascii_uppercase())
    }

    /// Fail with a construction error unless `encoding_name` can be decoded
    pub fn require(&self, encoding_name: &str) -> Result<()> {
        if self.supports(encoding_name) {
            return Ok(());
        }
        Err(Error::PipelineConstruction(format!(
            "no {} decoder in this build (available: {:?}); enable the `ffmpeg` or `h264` feature or negotiate a supported codec",
            encoding_name,
            self.codecs()
        )))
    }

    /// Instantiate a backend; `None` when nothing is registered for the name
    pub fn create(&self, encoding_name: &str) -> Option<Result<Box<dyn VideoDecoderBackend>>> {
        self.factories
            .get(&encoding_name.to_ascii_uppercase())
            .map(|factory| factory())
    }

    pub fn codecs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// RTP to access unit reassembly for the supported payload formats
enum Depacketizer {
    Vp8(SampleBuilder<Vp8Packet>),
    H264(SampleBuilder<H264Packet>),
}

impl Depacketizer {
    fn for_encoding(encoding_name: &str, clock_rate: u32) -> Option<Self> {
        match encoding_name.to_ascii_uppercase().as_str() {
            "VP8" => Some(Depacketizer::Vp8(SampleBuilder::new(
                MAX_LATE_PACKETS,
                Vp8Packet::default(),
                clock_rate,
            ))),
            "H264" => Some(Depacketizer::H264(SampleBuilder::new(
                MAX_LATE_PACKETS,
                H264Packet::default(),
                clock_rate,
            ))),
            _ => None,
        }
    }

    fn push(&mut self, packet: Packet) {
        match self {
            Depacketizer::Vp8(b) => b.push(packet),
            Depacketizer::H264(b) => b.push(packet),
        }
    }

    fn pop(&mut self) -> Option<Sample> {
        match self {
            Depacketizer::Vp8(b) => b.pop(),
            Depacketizer::H264(b) => b.pop(),
        }
    }
}

/// Decoding chain built from the first RTP buffer's caps
struct RtpChain {
    depacketizer: Depacketizer,
    decoder: Arc<Mutex<Box<dyn VideoDecoderBackend>>>,
    clock_rate: u32,
    first_timestamp: Option<u32>,
}

enum DecodeState {
    /// Nothing seen yet
    Typefind,
    Passthrough,
    Rtp(Box<RtpChain>),
    /// No depacketizer or decoder for the stream, buffers are discarded
    Unsupported,
}

/// The `decodebin` stage
pub struct DecodeStage {
    registry: Arc<DecoderRegistry>,
    state: DecodeState,
    output: Option<Arc<SrcPad>>,
    decoded: u64,
}

impl DecodeStage {
    pub fn new(registry: Arc<DecoderRegistry>) -> Self {
        Self {
            registry,
            state: DecodeState::Typefind,
            output: None,
            decoded: 0,
        }
    }

    fn typefind(&self, caps: &StreamDescriptor) -> DecodeState {
        if caps.is_video() {
            debug!("Raw video input, passing through");
            return DecodeState::Passthrough;
        }

        let encoding = match (caps.is_rtp(), caps.encoding_name.as_deref()) {
            (true, Some(name)) => name,
            _ => {
                warn!("No decoder for {}", caps);
                return DecodeState::Unsupported;
            }
        };
        let clock_rate = caps.clock_rate.unwrap_or(90000);

        let Some(depacketizer) = Depacketizer::for_encoding(encoding, clock_rate) else {
            warn!("No depacketizer for {} RTP", encoding);
            return DecodeState::Unsupported;
        };

        match self.registry.create(encoding) {
            Some(Ok(decoder)) => {
                info!("Decoding {} with {}", encoding, decoder.codec_name());
                DecodeState::Rtp(Box::new(RtpChain {
                    depacketizer,
                    decoder: Arc::new(Mutex::new(decoder)),
                    clock_rate,
                    first_timestamp: None,
                }))
            }
            Some(Err(e)) => {
                warn!("Failed to create {} decoder: {}", encoding, e);
                DecodeState::Unsupported
            }
            None => {
                warn!(
                    "No {} decoder available (built with: {:?})",
                    encoding,
                    self.registry.codecs()
                );
                DecodeState::Unsupported
            }
        }
    }

    /// Push downstream, exposing the output pad first if needed
    async fn emit(&mut self, buffer: MediaBuffer, ctx: &StageContext) -> Result<()> {
        if self.output.is_none() {
            let pad = ctx
                .expose_pad(buffer.caps.as_ref().clone())
                .ok_or_else(|| Error::StageError("graph is gone".to_string()))?;
            self.output = Some(pad);
        }

        if let Some(pad) = &self.output {
            let result = pad.push(buffer).await;
            if result != PushResult::Delivered {
                trace!("decodebin output: {:?}", result);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StageBehavior for DecodeStage {
    async fn process(&mut self, buffer: MediaBuffer, ctx: &StageContext) -> Result<()> {
        if matches!(self.state, DecodeState::Typefind) {
            self.state = self.typefind(&buffer.caps);
        }

        if matches!(self.state, DecodeState::Passthrough) {
            return self.emit(buffer, ctx).await;
        }
        let DecodeState::Rtp(chain) = &mut self.state else {
            return Ok(());
        };

        let mut raw = buffer.data.clone();
        let packet = Packet::unmarshal(&mut raw)
            .map_err(|e| Error::DecodeError(format!("bad RTP packet: {}", e)))?;
        chain.depacketizer.push(packet);

        let mut samples = Vec::new();
        while let Some(sample) = chain.depacketizer.pop() {
            let first = *chain.first_timestamp.get_or_insert(sample.packet_timestamp);
            let ticks = sample.packet_timestamp.wrapping_sub(first) as u64;
            let pts = Duration::from_nanos(ticks * 1_000_000_000 / chain.clock_rate.max(1) as u64);
            samples.push((sample.data, pts, Arc::clone(&chain.decoder)));
        }

        for (access_unit, pts, decoder) in samples {
            let decoded = tokio::task::spawn_blocking(move || decoder.lock().decode(&access_unit))
                .await
                .map_err(|e| Error::DecodeError(e.to_string()))?;

            match decoded {
                Ok(Some(frame)) => {
                    self.decoded += 1;
                    if self.decoded == 1 {
                        info!(
                            "First frame decoded: {}x{} {}",
                            frame.width,
                            frame.height,
                            frame.format.name()
                        );
                    }
                    let caps = StreamDescriptor::raw_video(frame.format, frame.width, frame.height)
                        .with_stride(frame.stride);
                    let out = MediaBuffer::new(frame.data, Arc::new(caps)).with_pts(Some(pts));
                    self.emit(out, ctx).await?;
                }
                Ok(None) => {}
                Err(e) => warn!("Dropped undecodable access unit: {}", e),
            }
        }

        Ok(())
    }
}

/// Copy strided planes into one compact I420 buffer
pub fn pack_i420(
    width: usize,
    height: usize,
    (y, y_stride): (&[u8], usize),
    (u, u_stride): (&[u8], usize),
    (v, v_stride): (&[u8], usize),
) -> Result<Bytes> {
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    let mut out = BytesMut::with_capacity(width * height + 2 * cw * ch);

    for (plane, stride, w, h) in [
        (y, y_stride, width, height),
        (u, u_stride, cw, ch),
        (v, v_stride, cw, ch),
    ] {
        if stride < w || plane.len() < stride * h.saturating_sub(1) + w {
            return Err(Error::DecodeError(format!(
                "plane of {} bytes (stride {}) too short for {}x{}",
                plane.len(),
                stride,
                w,
                h
            )));
        }
        for row in plane.chunks(stride).take(h) {
            out.extend_from_slice(&row[..w]);
        }
    }

    Ok(out.freeze())
}

#[cfg(feature = "h264")]
mod openh264_backend {
    use super::{pack_i420, DecodedFrame, VideoDecoderBackend};
    use crate::media::PixelFormat;
    use crate::{Error, Result};
    use openh264::decoder::Decoder;
    use openh264::formats::YUVSource;

    /// H.264 (Annex B) decoding through OpenH264
    pub struct OpenH264Decoder {
        decoder: Decoder,
    }

    impl OpenH264Decoder {
        pub fn new() -> Result<Self> {
            let decoder = Decoder::new()
                .map_err(|e| Error::DecodeError(format!("OpenH264 init failed: {}", e)))?;
            Ok(Self { decoder })
        }
    }

    impl VideoDecoderBackend for OpenH264Decoder {
        fn decode(&mut self, access_unit: &[u8]) -> Result<Option<DecodedFrame>> {
            let Some(yuv) = self
                .decoder
                .decode(access_unit)
                .map_err(|e| Error::DecodeError(e.to_string()))?
            else {
                return Ok(None);
            };

            let (width, height) = yuv.dimensions();
            let (ys, us, vs) = yuv.strides();
            let data = pack_i420(width, height, (yuv.y(), ys), (yuv.u(), us), (yuv.v(), vs))?;

            Ok(Some(DecodedFrame {
                format: PixelFormat::I420,
                width: width as u32,
                height: height as u32,
                stride: width,
                data,
            }))
        }

        fn codec_name(&self) -> &str {
            "openh264"
        }
    }
}

/// libavcodec pixel formats laid out exactly like I420
#[cfg_attr(not(feature = "ffmpeg"), allow(dead_code))]
fn is_i420_layout(format_name: &str) -> bool {
    matches!(format_name, "yuv420p" | "yuvj420p")
}

/// Pull frames until the decoder is empty; keeps the newest, counts the rest
#[cfg_attr(not(feature = "ffmpeg"), allow(dead_code))]
fn drain_newest<T, E>(
    mut take: impl FnMut() -> std::result::Result<Option<T>, E>,
) -> std::result::Result<(Option<T>, usize), E> {
    let mut newest = None;
    let mut superseded = 0;
    while let Some(frame) = take()? {
        if newest.replace(frame).is_some() {
            superseded += 1;
        }
    }
    Ok((newest, superseded))
}

#[cfg(feature = "ffmpeg")]
mod ffmpeg_backend {
    use super::{drain_newest, is_i420_layout, pack_i420, DecodedFrame, VideoDecoderBackend};
    use crate::media::PixelFormat;
    use crate::{Error, Result};
    use ac_ffmpeg::codec::video::frame::get_pixel_format;
    use ac_ffmpeg::codec::video::{VideoDecoder, VideoFrame, VideoFrameScaler};
    use ac_ffmpeg::codec::Decoder;
    use ac_ffmpeg::packet::PacketMut;
    use tracing::{debug, info};

    /// Converter into yuv420p for one source format and size
    struct Conversion {
        source: (&'static str, usize, usize),
        scaler: VideoFrameScaler,
    }

    /// libavcodec decoding; non-I420 output is converted to yuv420p
    pub struct FfmpegDecoder {
        decoder: VideoDecoder,
        conversion: Option<Conversion>,
        name: String,
    }

    impl FfmpegDecoder {
        pub fn new(encoding_name: &str) -> Result<Self> {
            let codec = encoding_name.to_ascii_lowercase();
            let decoder = VideoDecoder::builder(&codec)
                .and_then(|b| b.build())
                .map_err(|e| Error::DecodeError(format!("FFmpeg {} decoder: {}", codec, e)))?;
            Ok(Self {
                decoder,
                conversion: None,
                name: format!("ffmpeg-{}", codec),
            })
        }

        fn to_i420(&mut self, frame: VideoFrame) -> Result<VideoFrame> {
            let format = frame.pixel_format().name();
            if is_i420_layout(format) {
                return Ok(frame);
            }

            let source = (format, frame.width(), frame.height());
            if self.conversion.as_ref().map(|c| c.source) != Some(source) {
                info!("Converting decoded {} {}x{} to yuv420p", format, source.1, source.2);
                let scaler = VideoFrameScaler::builder()
                    .source_pixel_format(frame.pixel_format())
                    .source_width(source.1)
                    .source_height(source.2)
                    .target_pixel_format(get_pixel_format("yuv420p"))
                    .target_width(source.1)
                    .target_height(source.2)
                    .build()
                    .map_err(|e| Error::DecodeError(format!("{} converter: {}", format, e)))?;
                self.conversion = Some(Conversion { source, scaler });
            }

            match self.conversion.as_mut() {
                Some(conversion) => conversion
                    .scaler
                    .scale(&frame)
                    .map_err(|e| Error::DecodeError(format!("{} conversion: {}", format, e))),
                None => Err(Error::DecodeError(format!("no converter for {}", format))),
            }
        }
    }

    impl VideoDecoderBackend for FfmpegDecoder {
        fn decode(&mut self, access_unit: &[u8]) -> Result<Option<DecodedFrame>> {
            let mut packet = PacketMut::new(access_unit.len());
            packet.data_mut().copy_from_slice(access_unit);
            self.decoder
                .push(packet.freeze())
                .map_err(|e| Error::DecodeError(e.to_string()))?;

            let decoder = &mut self.decoder;
            let (newest, superseded) =
                drain_newest(|| decoder.take()).map_err(|e| Error::DecodeError(e.to_string()))?;
            if superseded > 0 {
                debug!("{} skipped {} superseded frames", self.name, superseded);
            }
            let Some(frame) = newest else {
                return Ok(None);
            };

            let frame = self.to_i420(frame)?;
            let planes = frame.planes();
            if planes.len() < 3 {
                return Err(Error::DecodeError(format!(
                    "expected planar yuv420p, got {} planes",
                    planes.len()
                )));
            }
            let (width, height) = (frame.width(), frame.height());
            let plane = |i: usize| (planes[i].data(), planes[i].line_size());
            let data = pack_i420(width, height, plane(0), plane(1), plane(2))?;

            Ok(Some(DecodedFrame {
                format: PixelFormat::I420,
                width: width as u32,
                height: height as u32,
                stride: width,
                data,
            }))
        }

        fn codec_name(&self) -> &str {
            &self.name
        }
    }
}
