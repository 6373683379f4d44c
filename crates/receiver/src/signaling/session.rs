//! The session task: sole owner of the [`SignalingController`]
//!
//! Engine callbacks and the console reader run in other contexts; they only
//! enqueue [`SessionMessage`]s through a [`SessionHandle`].

use super::controller::{AnswerOutcome, NegotiationState, SignalingController, SignalingEvent};
use crate::shutdown::Shutdown;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    Engine(SignalingEvent),
    /// Raw pasted answer text
    Answer(String),
}

pub type SessionReceiver = mpsc::UnboundedReceiver<SessionMessage>;

/// Cloneable sender side of the session queue
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    pub fn channel() -> (Self, SessionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue an engine event; `false` once the session task is gone
    pub fn engine_event(&self, event: SignalingEvent) -> bool {
        self.send(SessionMessage::Engine(event))
    }

    /// Enqueue a pasted answer; `false` once the session task is gone
    pub fn answer(&self, raw: String) -> bool {
        self.send(SessionMessage::Answer(raw))
    }

    fn send(&self, msg: SessionMessage) -> bool {
        match self.tx.send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!("Session closed, dropping {:?}", e.0);
                false
            }
        }
    }
}

/// Consume the session queue until shutdown or until every handle is dropped
///
/// Rejected answers are retried up to `max_answer_attempts` pastes in total.
/// Returns the final negotiation state.
pub async fn run_session(
    mut controller: SignalingController,
    mut rx: SessionReceiver,
    shutdown: Shutdown,
    max_answer_attempts: u32,
) -> NegotiationState {
    let mut attempts = 0u32;

    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.wait() => {
                debug!("Session task stopping on shutdown");
                break;
            }
            msg = rx.recv() => msg,
        };

        let Some(msg) = msg else {
            debug!("Session queue closed");
            break;
        };

        match msg {
            SessionMessage::Engine(event) => controller.handle_event(event).await,
            SessionMessage::Answer(raw) => match controller.handle_answer(&raw) {
                AnswerOutcome::Accepted => info!("Answer accepted, waiting for media"),
                AnswerOutcome::Ignored => {}
                AnswerOutcome::Rejected(reason) => {
                    attempts += 1;
                    let will_retry = attempts < max_answer_attempts && controller.retry_answer();
                    if !will_retry {
                        error!(
                            "Giving up on the answer after {} attempt(s)",
                            attempts
                        );
                    } else {
                        warn!(
                            "Answer attempt {}/{} rejected, paste it again",
                            attempts, max_answer_attempts
                        );
                    }
                    controller.presenter().answer_rejected(&reason, will_retry);
                }
            },
        }
    }

    controller.state()
}
