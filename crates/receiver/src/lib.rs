//! Manual-signaling WebRTC video receiver
//!
//! Negotiates a one-way video session with a browser by copy/paste: the
//! offer is printed to the terminal, the browser's answer is pasted back.
//! Incoming RTP is decoded by an in-process stage graph and the newest frame
//! is handed to a render loop.
//!
//! # Features
//!
//! - **SDP sanitization**: CRLF output, ICE candidate filtering, banner removal
//! - **Signaling state machine**: single-owner controller fed by an event queue
//! - **Dynamic graph construction**: decode and conversion branches built as
//!   streams appear
//! - **Newest-wins frame hand-off**: single-slot exchange between pipeline and
//!   renderer
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Browser peer                                             │
//! │  ↓ (offer / answer pasted through the terminal)           │
//! │  ConsolePresenter ──answers──▶ session task               │
//! │                                 └─ SignalingController    │
//! │                                      ↕ SignalingEngine    │
//! │  WebRtcEngine (webrtc-rs peer connection)                 │
//! │  ├─ events ──▶ session task                               │
//! │  └─ on_track ──▶ MediaGraphBuilder                        │
//! │        Pipeline: queue → decodebin ─pad─▶ videoconvert    │
//! │                  → videoscale → capsfilter → framesink    │
//! │                                                  ↓        │
//! │  FrameExchange ──▶ render loop ──▶ FrameSurface           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use webrtc_receiver::sdp::sanitize;
//!
//! let raw = "v=0\r\na=candidate:1 1 TCP 100 10.0.0.1 9999 typ host\r\na=end-of-candidates\r\n";
//! assert_eq!(sanitize(raw), "v=0\r\n");
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod render;
pub mod sdp;
pub mod shutdown;
pub mod signaling;

pub use config::{ReceiverConfig, VideoCodec, VideoSize};
pub use engine::WebRtcEngine;
pub use error::{Error, Result};
pub use media::{Frame, FrameExchange, FrameProducer, MediaGraph, MediaGraphBuilder, PixelFormat};
pub use pipeline::Pipeline;
pub use render::{run_render_loop, FrameSurface, HeadlessSurface};
pub use sdp::{CandidateFilter, SdpSanitizer, SessionDescription};
pub use shutdown::Shutdown;
pub use signaling::{
    run_session, ConsolePresenter, NegotiationState, SessionHandle, SignalingController,
};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
