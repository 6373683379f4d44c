//! Buffers, output pads and the links between stages

use crate::media::{PadId, StageId, StreamDescriptor};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// A unit of data flowing between stages
#[derive(Debug, Clone)]
pub struct MediaBuffer {
    pub data: Bytes,
    pub pts: Option<Duration>,
    /// Format of `data`
    pub caps: Arc<StreamDescriptor>,
}

impl MediaBuffer {
    pub fn new(data: impl Into<Bytes>, caps: Arc<StreamDescriptor>) -> Self {
        Self {
            data: data.into(),
            pts: None,
            caps,
        }
    }

    pub fn with_pts(mut self, pts: Option<Duration>) -> Self {
        self.pts = pts;
        self
    }
}

/// Input side of a stage as seen by whoever links to it
#[derive(Debug, Clone)]
pub struct PadTarget {
    pub stage: StageId,
    pub tx: mpsc::Sender<MediaBuffer>,
    /// Drop incoming buffers when the input is full instead of waiting
    pub leaky: bool,
}

/// Why a push did not reach the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Delivered,
    /// Peer input full, leaky link
    Dropped,
    NotLinked,
    /// Peer stage is gone
    Flushing,
}

/// An output pad: static stage output, engine stream or decoder output
#[derive(Debug)]
pub struct SrcPad {
    id: PadId,
    owner: Option<StageId>,
    caps: Arc<StreamDescriptor>,
    peer: RwLock<Option<PadTarget>>,
    dropped: AtomicU64,
}

impl SrcPad {
    pub(crate) fn new(id: PadId, owner: Option<StageId>, caps: Arc<StreamDescriptor>) -> Self {
        Self {
            id,
            owner,
            caps,
            peer: RwLock::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> PadId {
        self.id
    }

    /// Stage exposing this pad, `None` for engine pads
    pub fn owner(&self) -> Option<StageId> {
        self.owner
    }

    /// Caps announced when the pad was exposed
    pub fn caps(&self) -> &Arc<StreamDescriptor> {
        &self.caps
    }

    pub fn is_linked(&self) -> bool {
        self.peer.read().is_some()
    }

    pub fn peer_stage(&self) -> Option<StageId> {
        self.peer.read().as_ref().map(|p| p.stage)
    }

    /// Buffers dropped on a full leaky link
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Link to `target`; fails if already linked
    pub(crate) fn set_peer(&self, target: PadTarget) -> Result<(), PadTarget> {
        let mut peer = self.peer.write();
        if peer.is_some() {
            return Err(target);
        }
        *peer = Some(target);
        Ok(())
    }

    pub(crate) fn unlink(&self) {
        self.peer.write().take();
    }

    /// Hand `buffer` to the linked stage
    pub async fn push(&self, buffer: MediaBuffer) -> PushResult {
        let peer = self.peer.read().clone();
        let Some(target) = peer else {
            return PushResult::NotLinked;
        };

        if target.leaky {
            match target.tx.try_send(buffer) {
                Ok(()) => PushResult::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("{} -> {} full, dropping buffer", self.id, target.stage);
                    PushResult::Dropped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => PushResult::Flushing,
            }
        } else {
            match target.tx.send(buffer).await {
                Ok(()) => PushResult::Delivered,
                Err(_) => PushResult::Flushing,
            }
        }
    }
}
