//! Dynamic decode-branch construction
//!
//! Streams show up asynchronously: first the engine exposes an RTP pad
//! (stage A), later the decoder exposes a raw pad once it has identified the
//! format (stage B). Each step appends a fresh set of stages to the graph.
//!
//! ```text
//! engine pad ─▶ queue ─▶ decodebin ┄┄▶ videoconvert ─▶ videoscale ─▶ capsfilter(BGR) ─▶ framesink
//!               └──── stage A ────┘    └────────────────────── stage B ──────────────────────┘
//! ```

use super::frame::PixelFormat;
use super::graph::{
    FrameSinkSettings, MediaGraph, PadAddedHandler, PadId, SampleHandler, ScaleTarget, StageId,
    StageKind, StreamDescriptor,
};
use crate::config::ReceiverConfig;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Result of reacting to one new pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Stages created, linked and running
    Built,
    /// Pad is not something this builder handles
    Ignored,
    /// A stage could not be created or linked; its stages were discarded
    Abandoned,
}

/// Per-branch tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchOptions {
    pub queue_capacity: usize,
    pub scale: ScaleTarget,
}

impl Default for BranchOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 200,
            scale: ScaleTarget::Passthrough,
        }
    }
}

impl BranchOptions {
    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            scale: config
                .output_size
                .map(|s| ScaleTarget::Fixed {
                    width: s.width,
                    height: s.height,
                })
                .unwrap_or_default(),
        }
    }
}

/// Grows decode branches in a [`MediaGraph`] as pads appear
#[derive(Clone)]
pub struct MediaGraphBuilder {
    inner: Arc<BuilderInner>,
}

struct BuilderInner {
    graph: Arc<dyn MediaGraph>,
    on_sample: SampleHandler,
    options: BranchOptions,
    built: AtomicU64,
    abandoned: AtomicU64,
}

impl MediaGraphBuilder {
    pub fn new(graph: Arc<dyn MediaGraph>, on_sample: SampleHandler, options: BranchOptions) -> Self {
        Self {
            inner: Arc::new(BuilderInner {
                graph,
                on_sample,
                options,
                built: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
            }),
        }
    }

    /// Stage A: an inbound stream pad was exposed by the engine
    pub fn on_inbound_stream(&self, pad: PadId, desc: &StreamDescriptor) -> BranchOutcome {
        info!("Incoming stream on {}: {}", pad, desc);

        if !desc.is_rtp() {
            debug!("Ignoring non-RTP stream on {}", pad);
            return BranchOutcome::Ignored;
        }

        self.record(self.build_decode_branch(pad), "decode", pad)
    }

    /// Stage B: a decoder exposed an elementary-stream pad
    pub fn on_elementary_stream(&self, pad: PadId, desc: &StreamDescriptor) -> BranchOutcome {
        info!("Decoder pad {} added: {}", pad, desc);

        if !desc.is_video() {
            debug!("Ignoring non-video decoder output on {}", pad);
            return BranchOutcome::Ignored;
        }

        self.record(self.build_video_branch(pad), "video", pad)
    }

    /// Branches fully built so far
    pub fn built_branches(&self) -> u64 {
        self.inner.built.load(Ordering::Relaxed)
    }

    /// Branches dropped after a creation or link failure
    pub fn abandoned_branches(&self) -> u64 {
        self.inner.abandoned.load(Ordering::Relaxed)
    }

    fn record(&self, result: Result<()>, branch: &str, pad: PadId) -> BranchOutcome {
        match result {
            Ok(()) => {
                self.inner.built.fetch_add(1, Ordering::Relaxed);
                info!("Built {} branch for {}", branch, pad);
                BranchOutcome::Built
            }
            Err(e) => {
                self.inner.abandoned.fetch_add(1, Ordering::Relaxed);
                warn!("Abandoned {} branch for {}: {}", branch, pad, e);
                BranchOutcome::Abandoned
            }
        }
    }

    fn build_decode_branch(&self, pad: PadId) -> Result<()> {
        let graph = self.inner.graph.as_ref();
        let mut branch = PendingBranch::new(graph);

        let queue = branch.create(StageKind::Queue {
            max_buffers: self.inner.options.queue_capacity,
        })?;
        let decoder = branch.create(StageKind::DecodeBin)?;

        // Registered before anything can flow so no decoder pad is missed
        graph.on_output_pad_added(decoder, self.elementary_stream_handler())?;

        graph.link(queue, decoder)?;
        graph.link_pad(pad, queue)?;
        graph.sync_with_graph(queue)?;
        graph.sync_with_graph(decoder)?;

        branch.commit();
        Ok(())
    }

    fn build_video_branch(&self, pad: PadId) -> Result<()> {
        let graph = self.inner.graph.as_ref();
        let mut branch = PendingBranch::new(graph);

        let convert = branch.create(StageKind::VideoConvert)?;
        let scale = branch.create(StageKind::VideoScale(self.inner.options.scale))?;
        let filter = branch.create(StageKind::CapsFilter(PixelFormat::Bgr24))?;
        let sink = branch.create(StageKind::FrameSink(FrameSinkSettings::latest_only(
            Arc::clone(&self.inner.on_sample),
        )))?;

        graph.link(convert, scale)?;
        graph.link(scale, filter)?;
        graph.link(filter, sink)?;
        graph.link_pad(pad, convert)?;

        for stage in [convert, scale, filter, sink] {
            graph.sync_with_graph(stage)?;
        }

        branch.commit();
        Ok(())
    }

    fn elementary_stream_handler(&self) -> PadAddedHandler {
        let weak: Weak<BuilderInner> = Arc::downgrade(&self.inner);
        Arc::new(move |pad, desc| match weak.upgrade() {
            Some(inner) => {
                MediaGraphBuilder { inner }.on_elementary_stream(pad, &desc);
            }
            None => debug!("Builder gone, ignoring decoder pad {}", pad),
        })
    }
}

/// Stages created for a branch that is not yet complete
///
/// Dropping it without [`PendingBranch::commit`] discards every stage it
/// created, newest first.
struct PendingBranch<'a> {
    graph: &'a dyn MediaGraph,
    stages: Vec<StageId>,
    committed: bool,
}

impl<'a> PendingBranch<'a> {
    fn new(graph: &'a dyn MediaGraph) -> Self {
        Self {
            graph,
            stages: Vec::new(),
            committed: false,
        }
    }

    fn create(&mut self, kind: StageKind) -> Result<StageId> {
        let stage = self.graph.create_stage(kind)?;
        self.stages.push(stage);
        self.graph.attach(stage)?;
        Ok(stage)
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingBranch<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for stage in self.stages.iter().rev() {
            self.graph.discard(*stage);
        }
    }
}
