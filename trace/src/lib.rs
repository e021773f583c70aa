//! Execution-trace memoization for the Weft task-graph runtime.
//!
//! A *trace* is a named, repeatable window of operations issued inside a parent task. On its
//! first physical execution the window is recorded into a [`PhysicalTemplate`]: the event
//! dataflow of every task, copy, and fill, the mapper decisions, and the conditions under which
//! the whole recording is valid. On later executions whose conditions hold, the template is
//! *replayed* straight from its compiled instruction stream, bypassing dependence analysis and
//! mapping entirely.
//!
//! The crate is organized leaves-first:
//!
//! - `view_set`: field-masked, expression-aware view sets ([`TraceViewSet`]);
//! - `conditions`: pre/anti/post condition sets checked against equivalence sets;
//! - `template`: recording, the optimization pipeline, and parallel replay;
//! - `sharded`: the control-replication extension (cross-shard event naming, frontier
//!   barriers, the replayable vote);
//! - `recorder`: dynamic and static operation-level dependence recording;
//! - `ops`: the trace control operations and per-trace state machine.
//!
//! The runtime proper is reached only through the collaborator traits of `weft-core`
//! ([`weft_core::ParentContext`], [`weft_core::RegionForest`], [`weft_core::EquivalenceSet`],
//! [`weft_core::RuntimeTransport`], [`weft_core::ShardExchange`]).

mod conditions;
mod errors;
mod ops;
mod options;
mod recorder;
mod sharded;
mod template;
mod view_set;

#[cfg(test)]
mod test_utils;


// RE-EXPORTS
// ================================================================================================

pub use conditions::{ConditionTest, TraceConditionSet};
pub use errors::{ConditionFailure, NotReplayableReason, Replayable, TraceError};
pub use ops::{
    Trace, TraceBeginOp, TraceCaptureOp, TraceCompleteOp, TraceContext, TraceEndStatus,
    TraceReplayOp, TraceState, TraceSummaryOp, Tracing,
};
pub use options::{
    DEFAULT_MAX_TEMPLATES_PER_TRACE, DEFAULT_REPLAY_PARALLELISM, NEW_TEMPLATE_WARNING_COUNT,
    NON_REPLAYABLE_WARNING, TraceConfig,
};
pub use recorder::{DynamicRecorder, StaticRecorder, TraceRecorder};
pub use sharded::ShardedExtension;
pub use template::{Instruction, InstructionKind, PhysicalTemplate};
pub use view_set::TraceViewSet;
