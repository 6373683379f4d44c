//! Negotiation state machine
//!
//! The controller never blocks on the engine: commands are fire-and-forget
//! and their completions come back as [`SignalingEvent`]s through the session
//! queue. It is owned by exactly one task, so transitions are strictly
//! ordered.
//!
//! ```text
//! Idle ──negotiation-needed──▶ OfferPending ──gathering──▶ Gathering
//!                                   │                          │
//!                                   └──────gathering complete──┴──▶ AwaitingAnswer
//!                                                                     │        ▲
//!                                                          answer ok  │        │ retry
//!                                                                     ▼        │
//!                                                               Connected    Failed
//! ```

use crate::sdp::{SdpSanitizer, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Negotiation progress for one offer/answer round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// Offer requested or created, local description being applied
    OfferPending,
    /// ICE candidates being gathered
    Gathering,
    /// Offer presented, waiting for the pasted answer
    AwaitingAnswer,
    Connected,
    Failed,
}

impl NegotiationState {
    /// `Connected` and `Failed` end the round
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Connected | NegotiationState::Failed)
    }

    fn accepts_gathering_complete(&self) -> bool {
        matches!(
            self,
            NegotiationState::Idle | NegotiationState::OfferPending | NegotiationState::Gathering
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferPending => "offer-pending",
            NegotiationState::Gathering => "gathering",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Engine notifications and command completions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    NegotiationNeeded,
    OfferCreated(SessionDescription),
    OfferFailed(String),
    IceGatheringStateChanged(IceGatheringState),
    LocalDescriptionSet,
    RemoteDescriptionSet,
    DescriptionFailed { remote: bool, reason: String },
}

/// Signaling commands the controller issues to the media engine
///
/// Commands return as soon as the work is scheduled; an `Err` means it could
/// not even be scheduled. Results are reported as [`SignalingEvent`]s.
#[async_trait]
pub trait SignalingEngine: Send + Sync {
    /// Completes with `OfferCreated` or `OfferFailed`
    fn request_offer(&self) -> Result<()>;

    /// Completes with `LocalDescriptionSet` or `DescriptionFailed`
    fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// Completes with `RemoteDescriptionSet` or `DescriptionFailed`
    fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Current local description including gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;
}

/// Out-of-band transport that shows the offer and collects the answer
pub trait OfferPresenter: Send + Sync {
    /// Show the sanitized offer and start collecting an answer
    fn present_offer(&self, sdp: &str) -> Result<()>;

    /// A pasted answer was rejected
    fn answer_rejected(&self, reason: &str, will_retry: bool);
}

/// What happened to a pasted answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// Submitted to the engine
    Accepted,
    /// Not usable; the engine was not touched
    Rejected(String),
    /// Not expecting an answer in the current state
    Ignored,
}

/// Drives one offer/answer round
pub struct SignalingController {
    engine: Arc<dyn SignalingEngine>,
    presenter: Arc<dyn OfferPresenter>,
    sanitizer: SdpSanitizer,
    state: NegotiationState,
    presented_offer: Option<String>,
}

impl SignalingController {
    pub fn new(
        engine: Arc<dyn SignalingEngine>,
        presenter: Arc<dyn OfferPresenter>,
        sanitizer: SdpSanitizer,
    ) -> Self {
        Self {
            engine,
            presenter,
            sanitizer,
            state: NegotiationState::Idle,
            presented_offer: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Sanitized offer handed to the presenter, once gathering completed
    pub fn presented_offer(&self) -> Option<&str> {
        self.presented_offer.as_deref()
    }

    pub fn presenter(&self) -> &Arc<dyn OfferPresenter> {
        &self.presenter
    }

    /// Apply one engine event
    pub async fn handle_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::NegotiationNeeded => self.on_negotiation_needed(),
            SignalingEvent::OfferCreated(offer) => self.on_offer_created(offer),
            SignalingEvent::OfferFailed(reason) => {
                error!("Offer creation failed: {}", reason);
                self.transition(NegotiationState::Failed);
            }
            SignalingEvent::IceGatheringStateChanged(IceGatheringState::New) => {}
            SignalingEvent::IceGatheringStateChanged(IceGatheringState::Gathering) => {
                debug!("ICE gathering started");
                if self.state == NegotiationState::OfferPending {
                    self.transition(NegotiationState::Gathering);
                }
            }
            SignalingEvent::IceGatheringStateChanged(IceGatheringState::Complete) => {
                self.on_gathering_complete().await;
            }
            SignalingEvent::LocalDescriptionSet => debug!("Local description applied"),
            SignalingEvent::RemoteDescriptionSet => info!("Remote description applied"),
            SignalingEvent::DescriptionFailed { remote: false, reason } => {
                error!("Failed to set local description: {}", reason);
                self.transition(NegotiationState::Failed);
            }
            SignalingEvent::DescriptionFailed { remote: true, reason } => {
                error!("Failed to set remote description: {}", reason);
            }
        }
    }

    /// Sanitize, validate and submit a pasted answer
    pub fn handle_answer(&mut self, raw: &str) -> AnswerOutcome {
        if self.state != NegotiationState::AwaitingAnswer {
            warn!("Answer ignored in state {}", self.state);
            return AnswerOutcome::Ignored;
        }

        match self.submit_answer(raw) {
            Ok(()) => {
                self.transition(NegotiationState::Connected);
                AnswerOutcome::Accepted
            }
            Err(e) => {
                warn!("Answer rejected: {}", e);
                self.transition(NegotiationState::Failed);
                AnswerOutcome::Rejected(e.to_string())
            }
        }
    }

    /// Accept another answer after a rejected one
    ///
    /// Only possible from `Failed` once an offer has been presented.
    pub fn retry_answer(&mut self) -> bool {
        if self.state == NegotiationState::Failed && self.presented_offer.is_some() {
            self.transition(NegotiationState::AwaitingAnswer);
            true
        } else {
            false
        }
    }

    fn submit_answer(&self, raw: &str) -> Result<()> {
        let sanitized = self.sanitizer.sanitize(raw);
        if sanitized.is_empty() {
            return Err(Error::SignalingError("answer is empty after sanitization".to_string()));
        }

        let answer = SessionDescription::answer(sanitized)?;
        self.engine.set_remote_description(answer)
    }

    fn on_negotiation_needed(&mut self) {
        if self.state != NegotiationState::Idle {
            debug!("Negotiation already in progress ({}), ignoring", self.state);
            return;
        }

        info!("Negotiation needed, creating offer");
        self.transition(NegotiationState::OfferPending);
        if let Err(e) = self.engine.request_offer() {
            error!("Could not request offer: {}", e);
            self.transition(NegotiationState::Failed);
        }
    }

    fn on_offer_created(&mut self, offer: SessionDescription) {
        if self.state != NegotiationState::OfferPending {
            warn!("Unexpected offer in state {}, dropping it", self.state);
            return;
        }

        debug!("Offer created, applying as local description");
        if let Err(e) = self.engine.set_local_description(offer) {
            error!("Could not set local description: {}", e);
            self.transition(NegotiationState::Failed);
        }
    }

    async fn on_gathering_complete(&mut self) {
        if !self.state.accepts_gathering_complete() {
            debug!("ICE gathering complete in state {}, nothing to do", self.state);
            return;
        }

        let Some(local) = self.engine.local_description().await else {
            debug!("ICE gathering complete but no local description yet");
            return;
        };

        info!("ICE gathering complete, presenting offer");
        let sanitized = self.sanitizer.sanitize(local.as_str());
        if sanitized.is_empty() {
            error!("Local description is empty after sanitization");
            self.transition(NegotiationState::Failed);
            return;
        }

        if let Err(e) = self.presenter.present_offer(&sanitized) {
            error!("Could not present offer: {}", e);
            self.transition(NegotiationState::Failed);
            return;
        }

        self.presented_offer = Some(sanitized);
        self.transition(NegotiationState::AwaitingAnswer);
    }

    fn transition(&mut self, to: NegotiationState) {
        if self.state == to {
            return;
        }
        info!(from = %self.state, to = %to, "Negotiation state changed");
        self.state = to;
    }
}
