//! Branches built on the real stage graph, from source pad to FrameExchange

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::Marshal;
use webrtc_receiver::media::{
    BranchOptions, BranchOutcome, FrameExchange, FrameProducer, MediaGraph, MediaGraphBuilder,
    MediaKind, PixelFormat, ScaleTarget, StreamDescriptor,
};
use webrtc_receiver::pipeline::decode::{
    DecodedFrame, DecoderFactory, DecoderRegistry, VideoDecoderBackend,
};
use webrtc_receiver::pipeline::pad::MediaBuffer;
use webrtc_receiver::{Frame, Pipeline, Result};

/// Turns every access unit into a mid-grey 4x2 I420 picture
struct GreyDecoder;

impl VideoDecoderBackend for GreyDecoder {
    fn decode(&mut self, _access_unit: &[u8]) -> Result<Option<DecodedFrame>> {
        let mut data = vec![126u8; 8];
        data.extend_from_slice(&[128; 4]);
        Ok(Some(DecodedFrame {
            format: PixelFormat::I420,
            width: 4,
            height: 2,
            stride: 4,
            data: Bytes::from(data),
        }))
    }

    fn codec_name(&self) -> &str {
        "grey"
    }
}

fn grey_registry() -> DecoderRegistry {
    let factory: DecoderFactory =
        Arc::new(|| -> Result<Box<dyn VideoDecoderBackend>> { Ok(Box::new(GreyDecoder)) });
    let mut registry = DecoderRegistry::new();
    registry.register("VP8", factory);
    registry
}

struct Harness {
    pipeline: Pipeline,
    builder: MediaGraphBuilder,
    exchange: FrameExchange,
}

fn harness(registry: DecoderRegistry, options: BranchOptions) -> Harness {
    let pipeline = Pipeline::with_decoders(registry).unwrap();
    let exchange = FrameExchange::new();
    let producer = Arc::new(FrameProducer::new(exchange.clone(), 60));
    let builder = MediaGraphBuilder::new(
        Arc::new(pipeline.clone()) as Arc<dyn MediaGraph>,
        producer.sample_handler(),
        options,
    );
    pipeline.play();
    Harness {
        pipeline,
        builder,
        exchange,
    }
}

async fn wait_for_frame(exchange: &FrameExchange) -> Frame {
    for _ in 0..200 {
        if let Some(frame) = exchange.take_latest() {
            return frame;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no frame reached the exchange");
}

fn vp8_packet(sequence_number: u16, timestamp: u32) -> Bytes {
    Packet {
        header: Header {
            version: 2,
            marker: true,
            payload_type: 96,
            sequence_number,
            timestamp,
            ssrc: 0x1234_5678,
            ..Default::default()
        },
        // VP8 payload descriptor with the start-of-partition bit, then payload
        payload: Bytes::from_static(&[0x10, 0x9d, 0x01, 0x2a, 0x00, 0x00]),
    }
    .marshal()
    .unwrap()
}

#[tokio::test]
async fn test_raw_video_reaches_exchange_as_bgr() {
    let h = harness(DecoderRegistry::new(), BranchOptions::default());
    let caps = StreamDescriptor::raw_video(PixelFormat::I420, 2, 2);
    let (pad_id, pad) = h.pipeline.add_source_pad(caps.clone());

    assert_eq!(h.builder.on_elementary_stream(pad_id, &caps), BranchOutcome::Built);
    assert_eq!(
        h.pipeline.stage_names(),
        vec!["videoconvert", "videoscale", "capsfilter", "framesink"]
    );

    // White I420
    pad.push(MediaBuffer::new(vec![235, 235, 235, 235, 128, 128], Arc::clone(pad.caps())))
        .await;

    let frame = wait_for_frame(&h.exchange).await;
    assert_eq!((frame.width, frame.height), (2, 2));
    assert_eq!(frame.format, PixelFormat::Bgr24);
    assert_eq!(frame.stride, 6);
    assert!(frame.data.iter().all(|&b| b == 255));
}

#[tokio::test]
async fn test_fixed_output_size_is_applied() {
    let options = BranchOptions {
        scale: ScaleTarget::Fixed {
            width: 4,
            height: 4,
        },
        ..BranchOptions::default()
    };
    let h = harness(DecoderRegistry::new(), options);
    let caps = StreamDescriptor::raw_video(PixelFormat::Bgr24, 2, 2);
    let (pad_id, pad) = h.pipeline.add_source_pad(caps.clone());
    h.builder.on_elementary_stream(pad_id, &caps);

    pad.push(MediaBuffer::new(vec![7u8; 12], Arc::clone(pad.caps()))).await;

    let frame = wait_for_frame(&h.exchange).await;
    assert_eq!((frame.width, frame.height), (4, 4));
    assert_eq!(frame.data.len(), 4 * 4 * 3);
}

#[tokio::test]
async fn test_rtp_stream_is_decoded_through_both_stages() {
    let h = harness(grey_registry(), BranchOptions::default());
    let caps = StreamDescriptor::rtp(MediaKind::Video, "VP8", 96, 90000);
    let (pad_id, pad) = h.pipeline.add_source_pad(caps.clone());

    assert_eq!(h.builder.on_inbound_stream(pad_id, &caps), BranchOutcome::Built);
    assert_eq!(h.pipeline.stage_names(), vec!["queue", "decodebin"]);

    for i in 0..4u16 {
        let packet = vp8_packet(1000 + i, 3000 * i as u32);
        pad.push(MediaBuffer::new(packet, Arc::clone(pad.caps()))).await;
    }

    let frame = wait_for_frame(&h.exchange).await;
    assert_eq!((frame.width, frame.height), (4, 2));
    assert_eq!(frame.format, PixelFormat::Bgr24);

    // Stage B ran off the decoder's pad
    assert_eq!(h.builder.built_branches(), 2);
    assert_eq!(h.pipeline.stage_count(), 6);
}

#[tokio::test]
async fn test_non_rtp_and_non_video_pads_are_ignored() {
    let h = harness(DecoderRegistry::new(), BranchOptions::default());

    let raw = StreamDescriptor::raw_video(PixelFormat::I420, 2, 2);
    assert_eq!(h.builder.on_inbound_stream(pcm_pad(&h), &raw), BranchOutcome::Ignored);

    let audio = StreamDescriptor::other("audio/x-raw", MediaKind::Audio);
    assert_eq!(h.builder.on_elementary_stream(pcm_pad(&h), &audio), BranchOutcome::Ignored);
    assert_eq!(h.pipeline.stage_count(), 0);
}

#[tokio::test]
async fn test_second_branch_on_linked_pad_is_abandoned() {
    let h = harness(DecoderRegistry::new(), BranchOptions::default());
    let caps = StreamDescriptor::rtp(MediaKind::Video, "VP8", 96, 90000);
    let (pad_id, _pad) = h.pipeline.add_source_pad(caps.clone());

    assert_eq!(h.builder.on_inbound_stream(pad_id, &caps), BranchOutcome::Built);
    assert_eq!(h.builder.on_inbound_stream(pad_id, &caps), BranchOutcome::Abandoned);

    // The failed branch left nothing behind; the first one is intact
    assert_eq!(h.pipeline.stage_count(), 2);
    assert_eq!(h.builder.abandoned_branches(), 1);

    let (other_id, _other) = h.pipeline.add_source_pad(caps.clone());
    assert_eq!(h.builder.on_inbound_stream(other_id, &caps), BranchOutcome::Built);
    assert_eq!(h.pipeline.stage_count(), 4);
}

fn pcm_pad(h: &Harness) -> webrtc_receiver::media::PadId {
    h.pipeline
        .add_source_pad(StreamDescriptor::other("audio/x-raw", MediaKind::Audio))
        .0
}
