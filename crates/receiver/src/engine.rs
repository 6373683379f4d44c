//! webrtc-rs engine adapter
//!
//! Owns the peer connection. Engine callbacks never touch the signaling
//! controller directly: they are translated into [`SignalingEvent`]s and
//! queued on the session channel. Remote tracks are fed into the stage graph
//! through source pads, one per track.

use crate::config::ReceiverConfig;
use crate::media::{BranchOutcome, MediaGraphBuilder, MediaKind, StreamDescriptor};
use crate::pipeline::pad::{MediaBuffer, PushResult, SrcPad};
use crate::pipeline::Pipeline;
use crate::sdp::SessionDescription;
use crate::shutdown::Shutdown;
use crate::signaling::{IceGatheringState, SessionHandle, SignalingEngine, SignalingEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

/// Peer connection plus the glue into the session queue and stage graph
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    session: SessionHandle,
    handle: Handle,
    /// Last offer created by the engine, applied verbatim as local description
    pending_offer: Arc<Mutex<Option<RTCSessionDescription>>>,
}

impl WebRtcEngine {
    /// Build the peer connection and install its handlers
    ///
    /// Only the configured video codec is registered, so the offer carries a
    /// single payload type.
    pub async fn new(
        config: &ReceiverConfig,
        session: SessionHandle,
        pipeline: Pipeline,
        builder: MediaGraphBuilder,
        shutdown: Shutdown,
    ) -> Result<Self> {
        info!(
            "Creating peer connection: codec={}, payload_type={}, stun={}",
            config.video_codec.encoding_name(),
            config.payload_type,
            config.stun_server
        );

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(video_codec_parameters(config), RTPCodecType::Video)
            .map_err(|e| Error::PipelineConstruction(format!("Failed to register codec: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::PipelineConstruction(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![config.stun_server.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PipelineConstruction(format!("Failed to create peer connection: {}", e))
        })?);

        let negotiation_session = session.clone();
        pc.on_negotiation_needed(Box::new(move || {
            debug!("Negotiation needed");
            negotiation_session.engine_event(SignalingEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let gathering_session = session.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            debug!("ICE gathering state: {}", state);
            let mapped = match state {
                RTCIceGathererState::New => Some(IceGatheringState::New),
                RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
                RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
                _ => None,
            };
            if let Some(mapped) = mapped {
                gathering_session.engine_event(SignalingEvent::IceGatheringStateChanged(mapped));
            }
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            match state {
                RTCPeerConnectionState::Connected => info!("Peer connection established"),
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                    warn!("Peer connection {}", state)
                }
                _ => info!("Peer connection state: {}", state),
            }
            Box::pin(async {})
        }));

        let tracks = TrackIngest {
            pc: Arc::downgrade(&pc),
            pipeline,
            builder,
            shutdown,
            keyframe_interval: Duration::from_millis(config.keyframe_request_interval_ms),
        };
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            tracks.attach(track);
            Box::pin(async {})
        }));

        Ok(Self {
            pc,
            session,
            handle: Handle::current(),
            pending_offer: Arc::new(Mutex::new(None)),
        })
    }

    /// Add the receive-only video transceiver; triggers negotiation
    pub async fn start(&self) -> Result<()> {
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| Error::PipelineConstruction(format!("Failed to add transceiver: {}", e)))?;
        info!("Receive-only video transceiver added");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close peer connection: {}", e)))?;
        info!("Peer connection closed");
        Ok(())
    }
}

#[async_trait]
impl SignalingEngine for WebRtcEngine {
    fn request_offer(&self) -> Result<()> {
        let pc = Arc::clone(&self.pc);
        let session = self.session.clone();
        let pending = Arc::clone(&self.pending_offer);

        self.handle.spawn(async move {
            let event = match pc.create_offer(None).await {
                Ok(offer) => match SessionDescription::offer(offer.sdp.clone()) {
                    Ok(desc) => {
                        *pending.lock() = Some(offer);
                        SignalingEvent::OfferCreated(desc)
                    }
                    Err(e) => SignalingEvent::OfferFailed(e.to_string()),
                },
                Err(e) => SignalingEvent::OfferFailed(e.to_string()),
            };
            session.engine_event(event);
        });
        Ok(())
    }

    fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let created = self
            .pending_offer
            .lock()
            .take()
            .filter(|offer| offer.sdp == desc.as_str());
        let offer = match created {
            Some(offer) => offer,
            None => RTCSessionDescription::offer(desc.into_text())
                .map_err(|e| Error::SdpError(format!("Invalid local offer: {}", e)))?,
        };

        let pc = Arc::clone(&self.pc);
        let session = self.session.clone();
        self.handle.spawn(async move {
            let event = match pc.set_local_description(offer).await {
                Ok(()) => SignalingEvent::LocalDescriptionSet,
                Err(e) => SignalingEvent::DescriptionFailed {
                    remote: false,
                    reason: e.to_string(),
                },
            };
            session.engine_event(event);
        });
        Ok(())
    }

    fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let answer = RTCSessionDescription::answer(desc.into_text())
            .map_err(|e| Error::SdpError(format!("Invalid answer: {}", e)))?;

        let pc = Arc::clone(&self.pc);
        let session = self.session.clone();
        self.handle.spawn(async move {
            let event = match pc.set_remote_description(answer).await {
                Ok(()) => SignalingEvent::RemoteDescriptionSet,
                Err(e) => SignalingEvent::DescriptionFailed {
                    remote: true,
                    reason: e.to_string(),
                },
            };
            session.engine_event(event);
        });
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let local = self.pc.local_description().await?;
        match SessionDescription::offer(local.sdp) {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!("Engine produced an unusable local description: {}", e);
                None
            }
        }
    }
}

fn video_codec_parameters(config: &ReceiverConfig) -> RTCRtpCodecParameters {
    let feedback = [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect();

    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: config.video_codec.mime_type().to_owned(),
            clock_rate: config.clock_rate,
            channels: 0,
            sdp_fmtp_line: config.video_codec.fmtp_line().to_owned(),
            rtcp_feedback: feedback,
        },
        payload_type: config.payload_type,
        ..Default::default()
    }
}

/// Descriptor for a remote track, as announced on its source pad
pub fn track_descriptor(
    kind: RTPCodecType,
    mime_type: &str,
    payload_type: u8,
    clock_rate: u32,
) -> StreamDescriptor {
    let encoding = mime_type.rsplit('/').next().unwrap_or(mime_type);
    StreamDescriptor::rtp(
        MediaKind::from_name(&kind.to_string()),
        encoding,
        payload_type,
        clock_rate,
    )
}

/// What the reader does with a remote track once its branch was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackRouting {
    /// Push RTP into the branch; video also gets periodic key frame requests
    Forward { keyframes: bool },
    /// No branch consumes the track; read and discard so the receiver drains
    Drain,
}

impl TrackRouting {
    fn for_branch(outcome: BranchOutcome, media: MediaKind) -> Self {
        match outcome {
            BranchOutcome::Built => TrackRouting::Forward {
                keyframes: media == MediaKind::Video,
            },
            BranchOutcome::Ignored | BranchOutcome::Abandoned => TrackRouting::Drain,
        }
    }
}

/// Everything `on_track` needs to wire a remote track into the graph
struct TrackIngest {
    pc: Weak<RTCPeerConnection>,
    pipeline: Pipeline,
    builder: MediaGraphBuilder,
    shutdown: Shutdown,
    keyframe_interval: Duration,
}

impl TrackIngest {
    fn attach(&self, track: Arc<TrackRemote>) {
        let codec = track.codec();
        let desc = track_descriptor(
            track.kind(),
            &codec.capability.mime_type,
            track.payload_type(),
            codec.capability.clock_rate,
        );
        info!("Remote track ssrc={} {}", track.ssrc(), desc);

        let (pad_id, pad) = self.pipeline.add_source_pad(desc.clone());
        let outcome = self.builder.on_inbound_stream(pad_id, &desc);
        let shutdown = self.shutdown.clone();

        match TrackRouting::for_branch(outcome, desc.media) {
            TrackRouting::Forward { keyframes } => {
                let pipeline = self.pipeline.clone();
                let pli_target = keyframes.then(|| self.pc.clone());
                let interval = self.keyframe_interval;
                tokio::spawn(async move {
                    read_track(track, pad, pli_target, interval, shutdown).await;
                    pipeline.remove_pad(pad_id);
                });
            }
            TrackRouting::Drain => {
                self.pipeline.remove_pad(pad_id);
                debug!("Draining ssrc={} without a branch ({:?})", track.ssrc(), outcome);
                tokio::spawn(drain_track(track, shutdown));
            }
        }
    }
}

/// Forward RTP from `track` into `pad` until the track ends or shutdown
///
/// Video tracks also get a picture loss indication every `interval` so a
/// decoder joining mid-stream gets a key frame.
async fn read_track(
    track: Arc<TrackRemote>,
    pad: Arc<SrcPad>,
    pli_target: Option<Weak<RTCPeerConnection>>,
    interval: Duration,
    shutdown: Shutdown,
) {
    let ssrc = track.ssrc();
    let caps = Arc::clone(pad.caps());
    let mut keyframes = (!interval.is_zero() && pli_target.is_some())
        .then(|| tokio::time::interval(interval));
    let mut packets = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tick(&mut keyframes) => {
                let Some(pc) = pli_target.as_ref().and_then(Weak::upgrade) else {
                    break;
                };
                let pli = PictureLossIndication { sender_ssrc: 0, media_ssrc: ssrc };
                if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                    debug!("PLI for ssrc={} failed: {}", ssrc, e);
                }
            }
            read = track.read_rtp() => {
                let packet = match read {
                    Ok((packet, _)) => packet,
                    Err(e) => {
                        info!("Track ssrc={} ended after {} packets: {}", ssrc, packets, e);
                        break;
                    }
                };
                let data = match packet.marshal() {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Failed to marshal RTP packet: {}", e);
                        continue;
                    }
                };
                packets += 1;
                let pushed = pad.push(MediaBuffer::new(data, Arc::clone(&caps))).await;
                if pushed == PushResult::Flushing {
                    debug!("Branch for ssrc={} is gone", ssrc);
                }
            }
        }
    }
}

/// Read and discard RTP from a track nothing consumes
async fn drain_track(track: Arc<TrackRemote>, shutdown: Shutdown) {
    let ssrc = track.ssrc();
    let mut discarded = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            read = track.read_rtp() => match read {
                Ok(_) => discarded += 1,
                Err(e) => {
                    debug!("Drained track ssrc={} ended after {} packets: {}", ssrc, discarded, e);
                    break;
                }
            },
        }
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoCodec;
    use crate::media::BranchOptions;
    use crate::pipeline::decode::DecoderRegistry;
    use crate::signaling::SessionMessage;

    #[test]
    fn test_track_descriptor() {
        let desc = track_descriptor(RTPCodecType::Video, "video/VP8", 96, 90000);
        assert!(desc.is_rtp());
        assert_eq!(desc.media, MediaKind::Video);
        assert_eq!(desc.encoding_name.as_deref(), Some("VP8"));
        assert_eq!(desc.payload_type, Some(96));

        let audio = track_descriptor(RTPCodecType::Audio, "audio/opus", 111, 48000);
        assert_eq!(audio.media, MediaKind::Audio);
        assert_eq!(audio.encoding_name.as_deref(), Some("OPUS"));
    }

    #[test]
    fn test_only_built_branches_are_fed() {
        assert_eq!(
            TrackRouting::for_branch(BranchOutcome::Built, MediaKind::Video),
            TrackRouting::Forward { keyframes: true }
        );
        assert_eq!(
            TrackRouting::for_branch(BranchOutcome::Built, MediaKind::Audio),
            TrackRouting::Forward { keyframes: false }
        );
        for outcome in [BranchOutcome::Ignored, BranchOutcome::Abandoned] {
            assert_eq!(
                TrackRouting::for_branch(outcome, MediaKind::Video),
                TrackRouting::Drain
            );
        }
    }

    #[test]
    fn test_codec_parameters_follow_config() {
        let config = ReceiverConfig::default().with_video_codec(VideoCodec::H264);
        let params = video_codec_parameters(&config);
        assert_eq!(params.capability.mime_type, "video/H264");
        assert_eq!(params.payload_type, 96);
        assert!(params.capability.sdp_fmtp_line.contains("packetization-mode=1"));
        assert!(params
            .capability
            .rtcp_feedback
            .iter()
            .any(|fb| fb.typ == "nack" && fb.parameter == "pli"));
    }

    #[tokio::test]
    async fn test_offer_round_trip_through_session() {
        let config = ReceiverConfig::default();
        let (session, mut rx) = SessionHandle::channel();
        let pipeline = Pipeline::with_decoders(DecoderRegistry::new()).unwrap();
        let builder = MediaGraphBuilder::new(
            Arc::new(pipeline.clone()),
            Arc::new(|_| Ok(())),
            BranchOptions::default(),
        );
        let engine = WebRtcEngine::new(&config, session, pipeline, builder, Shutdown::new())
            .await
            .unwrap();
        engine.start().await.unwrap();

        engine.request_offer().unwrap();
        let offer = loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionMessage::Engine(SignalingEvent::OfferCreated(desc)) = msg {
                break desc;
            }
        };
        assert!(offer.as_str().contains("VP8/90000"));
        assert!(offer.as_str().contains("a=recvonly"));

        engine.set_local_description(offer).unwrap();
        let applied = loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match msg {
                SessionMessage::Engine(SignalingEvent::LocalDescriptionSet) => break true,
                SessionMessage::Engine(SignalingEvent::DescriptionFailed { .. }) => break false,
                _ => {}
            }
        };
        assert!(applied);
        assert!(engine.local_description().await.is_some());
        engine.close().await.unwrap();
    }
}
