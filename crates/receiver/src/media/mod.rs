//! Media side: frames, the graph capability set and the branch builder

pub mod builder;
pub mod frame;
pub mod graph;
pub mod sink;

pub use builder::{BranchOptions, BranchOutcome, MediaGraphBuilder};
pub use frame::{Frame, FrameExchange, PixelFormat};
pub use graph::{
    FrameSinkSettings, MediaGraph, MediaKind, PadAddedHandler, PadId, Sample, SampleHandler,
    ScaleTarget, StageId, StageKind, StreamDescriptor,
};
pub use sink::FrameProducer;
