//! Shared vocabulary of the Weft task-graph runtime.
//!
//! This crate defines the handles, masks, and collaborator contracts that the runtime's
//! subsystems agree on: event and barrier handles, shard and operation identifiers, field masks
//! and field-masked sets, access usages and dependence records, and the traits through which the
//! trace core reaches the parent context, the region forest, the equivalence sets, and the
//! runtime transport.

mod context;
mod events;
mod expr;
mod field_mask;
mod ids;
mod transport;
mod usage;

// RE-EXPORTS
// ================================================================================================

pub use context::{
    CapturedConditions, ConditionEntry, ConditionSetId, EquivalenceSet, FutureBound, MapperOutput,
    Memoizable, Operation, ParentContext,
};
pub use events::{Barrier, Event, UserEvent};
pub use expr::{AcrossExecutor, CopySrcDstField, ExprId, RegionForest, ViewId};
pub use field_mask::{FieldMask, FieldMaskSet, MAX_FIELDS};
pub use ids::{
    DomainPoint, FieldId, InstanceId, MemoryId, OperationKind, ProcessorId, ReductionOpId,
    RegionTreeId, ReservationId, ShardId, TraceId, TraceLocalId, UniqueId,
};
pub use transport::{
    RequestId, RuntimeTransport, ShardExchange, ShardMessageHandler, TemplateIndex,
    TraceShardMessage,
};
pub use usage::{
    DependenceKind, DependenceRecord, Privilege, StaticDependence, Usage, ViewUser,
};
