//! In-process stage graph
//!
//! Every running stage is a tokio task draining a bounded input channel;
//! links hand the downstream sender to the upstream output pad. Stages are
//! created detached, attached to the graph, linked, and finally brought to
//! the graph's state with `sync_with_graph`. The graph itself is either
//! stopped or playing.

pub mod convert;
pub mod decode;
pub mod pad;
pub mod stages;

use crate::media::{
    MediaGraph, MediaKind, PadAddedHandler, PadId, StageId, StageKind, StreamDescriptor,
};
use crate::{Error, Result};
use decode::{DecodeStage, DecoderRegistry};
use pad::{MediaBuffer, PadTarget, PushResult, SrcPad};
use parking_lot::Mutex;
use stages::{CapsFilterStage, ConvertStage, FrameSinkStage, QueueStage, ScaleStage, StageBehavior};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Input capacity of stages without an explicit bound
const DEFAULT_STAGE_CAPACITY: usize = 8;

/// Input capacity of the decode stage
const DECODER_INPUT_CAPACITY: usize = 64;

/// What a running stage sees of the graph
pub struct StageContext {
    stage: StageId,
    output: Option<Arc<SrcPad>>,
    graph: Weak<PipelineInner>,
}

impl StageContext {
    /// Context for a stage outside any graph; dynamic pads cannot be exposed
    pub fn detached(stage: StageId, output: Option<Arc<SrcPad>>) -> Self {
        Self {
            stage,
            output,
            graph: Weak::new(),
        }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Push through the static output pad
    pub async fn push(&self, buffer: MediaBuffer) -> PushResult {
        match &self.output {
            Some(pad) => pad.push(buffer).await,
            None => PushResult::NotLinked,
        }
    }

    /// Expose a new dynamic output pad and notify the pad-added handler
    pub fn expose_pad(&self, caps: StreamDescriptor) -> Option<Arc<SrcPad>> {
        self.graph.upgrade()?.expose_pad(self.stage, caps)
    }
}

struct StageSlot {
    name: &'static str,
    behavior: Option<Box<dyn StageBehavior>>,
    input_tx: mpsc::Sender<MediaBuffer>,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    leaky: bool,
    input_linked: bool,
    output: Option<Arc<SrcPad>>,
    dynamic_pads: Vec<PadId>,
    pad_added: Option<PadAddedHandler>,
    attached: bool,
    wants_running: bool,
    task: Option<JoinHandle<()>>,
}

impl StageSlot {
    fn target(&self, stage: StageId) -> PadTarget {
        PadTarget {
            stage,
            tx: self.input_tx.clone(),
            leaky: self.leaky,
        }
    }
}

struct PipelineInner {
    handle: Handle,
    decoders: Arc<DecoderRegistry>,
    next_id: AtomicU64,
    playing: AtomicBool,
    stages: Mutex<HashMap<StageId, StageSlot>>,
    pads: Mutex<HashMap<PadId, Arc<SrcPad>>>,
}

impl PipelineInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn start_stage(self: &Arc<Self>, id: StageId, slot: &mut StageSlot) {
        let (Some(mut behavior), Some(mut rx)) = (slot.behavior.take(), slot.input_rx.take())
        else {
            return;
        };

        let ctx = StageContext {
            stage: id,
            output: slot.output.clone(),
            graph: Arc::downgrade(self),
        };
        let name = slot.name;

        slot.task = Some(self.handle.spawn(async move {
            debug!("{} {} running", name, id);
            while let Some(buffer) = rx.recv().await {
                if let Err(e) = behavior.process(buffer, &ctx).await {
                    debug!("{} {}: {}", name, id, e);
                }
            }
            debug!("{} {} input closed", name, id);
        }));
    }

    fn expose_pad(self: &Arc<Self>, stage: StageId, caps: StreamDescriptor) -> Option<Arc<SrcPad>> {
        let id = PadId(self.next_id());
        let pad = Arc::new(SrcPad::new(id, Some(stage), Arc::new(caps.clone())));

        let handler = {
            let mut stages = self.stages.lock();
            let slot = stages.get_mut(&stage)?;
            slot.dynamic_pads.push(id);
            slot.pad_added.clone()
        };
        self.pads.lock().insert(id, Arc::clone(&pad));

        debug!("{} exposed {} ({})", stage, id, caps);
        match handler {
            Some(handler) => handler(id, caps),
            None => debug!("No pad-added handler on {}", stage),
        }
        Some(pad)
    }
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        for slot in self.stages.get_mut().values_mut() {
            if let Some(task) = slot.task.take() {
                task.abort();
            }
        }
    }
}

/// Stage graph driven by the current tokio runtime
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Graph with the decoders compiled into this build
    pub fn new() -> Result<Self> {
        Self::with_decoders(DecoderRegistry::with_defaults())
    }

    /// Graph with a custom decoder registry
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_decoders(decoders: DecoderRegistry) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            Error::PipelineConstruction(format!("no tokio runtime for the stage graph: {}", e))
        })?;

        info!("Creating pipeline, decoders: {:?}", decoders.codecs());
        Ok(Self {
            inner: Arc::new(PipelineInner {
                handle,
                decoders: Arc::new(decoders),
                next_id: AtomicU64::new(1),
                playing: AtomicBool::new(false),
                stages: Mutex::new(HashMap::new()),
                pads: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Start every attached stage that asked to run
    pub fn play(&self) {
        self.inner.playing.store(true, Ordering::SeqCst);
        let mut stages = self.inner.stages.lock();
        for (id, slot) in stages.iter_mut() {
            if slot.attached && slot.wants_running && slot.task.is_none() {
                self.inner.start_stage(*id, slot);
            }
        }
        info!("Pipeline playing ({} stages)", stages.len());
    }

    /// Stop and remove every stage; engine pads stay but are unlinked
    pub fn stop(&self) {
        self.inner.playing.store(false, Ordering::SeqCst);
        let drained: Vec<(StageId, StageSlot)> = self.inner.stages.lock().drain().collect();
        for (_, mut slot) in drained {
            if let Some(task) = slot.task.take() {
                task.abort();
            }
        }

        let mut pads = self.inner.pads.lock();
        pads.retain(|_, pad| pad.owner().is_none());
        for pad in pads.values() {
            pad.unlink();
        }
        info!("Pipeline stopped");
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::SeqCst)
    }

    /// Register a pad fed from outside the graph (an engine stream)
    pub fn add_source_pad(&self, caps: StreamDescriptor) -> (PadId, Arc<SrcPad>) {
        let id = PadId(self.inner.next_id());
        let pad = Arc::new(SrcPad::new(id, None, Arc::new(caps)));
        self.inner.pads.lock().insert(id, Arc::clone(&pad));
        (id, pad)
    }

    pub fn remove_pad(&self, pad: PadId) {
        if let Some(pad) = self.inner.pads.lock().remove(&pad) {
            pad.unlink();
        }
    }

    pub fn pad(&self, pad: PadId) -> Option<Arc<SrcPad>> {
        self.inner.pads.lock().get(&pad).cloned()
    }

    pub fn stage_count(&self) -> usize {
        self.inner.stages.lock().len()
    }

    /// Names of live stages, sorted by id
    pub fn stage_names(&self) -> Vec<&'static str> {
        let stages = self.inner.stages.lock();
        let mut ids: Vec<&StageId> = stages.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| stages[id].name).collect()
    }

    fn behavior_for(&self, kind: &StageKind) -> (Box<dyn StageBehavior>, usize, bool) {
        match kind {
            StageKind::Queue { max_buffers } => (Box::new(QueueStage), (*max_buffers).max(1), false),
            StageKind::DecodeBin => (
                Box::new(DecodeStage::new(Arc::clone(&self.inner.decoders))),
                DECODER_INPUT_CAPACITY,
                false,
            ),
            StageKind::VideoConvert => (Box::<ConvertStage>::default(), DEFAULT_STAGE_CAPACITY, false),
            StageKind::VideoScale(target) => {
                (Box::new(ScaleStage::new(*target)), DEFAULT_STAGE_CAPACITY, false)
            }
            StageKind::CapsFilter(format) => {
                (Box::new(CapsFilterStage::new(*format)), DEFAULT_STAGE_CAPACITY, false)
            }
            StageKind::FrameSink(settings) => (
                Box::new(FrameSinkStage::new(settings.clone())),
                settings.max_buffers.max(1),
                settings.drop,
            ),
        }
    }
}

impl MediaGraph for Pipeline {
    fn create_stage(&self, kind: StageKind) -> Result<StageId> {
        let id = StageId(self.inner.next_id());
        let (behavior, capacity, leaky) = self.behavior_for(&kind);
        let (input_tx, input_rx) = mpsc::channel(capacity);

        let output = match kind {
            StageKind::DecodeBin | StageKind::FrameSink(_) => None,
            _ => Some(Arc::new(SrcPad::new(
                PadId(self.inner.next_id()),
                Some(id),
                Arc::new(StreamDescriptor::other("ANY", MediaKind::Unknown)),
            ))),
        };

        self.inner.stages.lock().insert(
            id,
            StageSlot {
                name: kind.name(),
                behavior: Some(behavior),
                input_tx,
                input_rx: Some(input_rx),
                leaky,
                input_linked: false,
                output,
                dynamic_pads: Vec::new(),
                pad_added: None,
                attached: false,
                wants_running: false,
                task: None,
            },
        );
        debug!("Created {} {}", kind.name(), id);
        Ok(id)
    }

    fn attach(&self, stage: StageId) -> Result<()> {
        let mut stages = self.inner.stages.lock();
        let slot = stages
            .get_mut(&stage)
            .ok_or_else(|| Error::StageNotFound(stage.to_string()))?;
        if slot.attached {
            return Err(Error::InvalidState(format!("{} already in the graph", stage)));
        }
        slot.attached = true;
        Ok(())
    }

    fn link(&self, upstream: StageId, downstream: StageId) -> Result<()> {
        let mut stages = self.inner.stages.lock();
        let link_err = |why: &str| Error::LinkError(format!("{} -> {}: {}", upstream, downstream, why));

        let target = match stages.get(&downstream) {
            Some(slot) if !slot.attached => return Err(link_err("downstream not in the graph")),
            Some(slot) if slot.input_linked => return Err(link_err("downstream input already linked")),
            Some(slot) => slot.target(downstream),
            None => return Err(Error::StageNotFound(downstream.to_string())),
        };

        let output = match stages.get(&upstream) {
            Some(slot) if !slot.attached => return Err(link_err("upstream not in the graph")),
            Some(slot) => slot
                .output
                .clone()
                .ok_or_else(|| link_err("upstream has no static output"))?,
            None => return Err(Error::StageNotFound(upstream.to_string())),
        };

        output
            .set_peer(target)
            .map_err(|_| link_err("upstream output already linked"))?;
        if let Some(slot) = stages.get_mut(&downstream) {
            slot.input_linked = true;
        }
        debug!("Linked {} -> {}", upstream, downstream);
        Ok(())
    }

    fn link_pad(&self, pad: PadId, stage: StageId) -> Result<()> {
        let src = self
            .pad(pad)
            .ok_or_else(|| Error::LinkError(format!("{} -> {}: unknown pad", pad, stage)))?;

        let mut stages = self.inner.stages.lock();
        let slot = stages
            .get_mut(&stage)
            .ok_or_else(|| Error::StageNotFound(stage.to_string()))?;
        if !slot.attached || slot.input_linked {
            return Err(Error::LinkError(format!(
                "{} -> {}: stage input unavailable",
                pad, stage
            )));
        }

        src.set_peer(slot.target(stage))
            .map_err(|_| Error::LinkError(format!("{} -> {}: pad already linked", pad, stage)))?;
        slot.input_linked = true;
        debug!("Linked {} -> {}", pad, stage);
        Ok(())
    }

    fn sync_with_graph(&self, stage: StageId) -> Result<()> {
        let mut stages = self.inner.stages.lock();
        let slot = stages
            .get_mut(&stage)
            .ok_or_else(|| Error::StageNotFound(stage.to_string()))?;
        if !slot.attached {
            return Err(Error::InvalidState(format!("{} not in the graph", stage)));
        }

        slot.wants_running = true;
        if self.is_playing() && slot.task.is_none() {
            self.inner.start_stage(stage, slot);
        }
        Ok(())
    }

    fn discard(&self, stage: StageId) {
        let Some(mut slot) = self.inner.stages.lock().remove(&stage) else {
            return;
        };
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        if let Some(output) = &slot.output {
            output.unlink();
        }

        // Unlink everything feeding the discarded stage
        for other in self.inner.stages.lock().values_mut() {
            if let Some(output) = &other.output {
                if output.peer_stage() == Some(stage) {
                    output.unlink();
                }
            }
        }
        let mut pads = self.inner.pads.lock();
        for id in &slot.dynamic_pads {
            if let Some(pad) = pads.remove(id) {
                pad.unlink();
            }
        }
        for pad in pads.values() {
            if pad.peer_stage() == Some(stage) {
                pad.unlink();
            }
        }
        debug!("Discarded {} {}", slot.name, stage);
    }

    fn on_output_pad_added(&self, stage: StageId, handler: PadAddedHandler) -> Result<()> {
        let mut stages = self.inner.stages.lock();
        let slot = stages
            .get_mut(&stage)
            .ok_or_else(|| Error::StageNotFound(stage.to_string()))?;
        if slot.pad_added.is_some() {
            warn!("Replacing pad-added handler on {}", stage);
        }
        slot.pad_added = Some(handler);
        Ok(())
    }
}
