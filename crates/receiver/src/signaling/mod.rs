//! Manual signaling: negotiation state machine, session task, console transport

pub mod console;
pub mod controller;
pub mod session;

pub use console::{ConsolePresenter, KeyPress};
pub use controller::{
    AnswerOutcome, IceGatheringState, NegotiationState, OfferPresenter, SignalingController,
    SignalingEngine, SignalingEvent,
};
pub use session::{run_session, SessionHandle, SessionMessage, SessionReceiver};
