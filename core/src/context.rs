use std::sync::Arc;

use crate::{
    DependenceKind, Event, ExprId, FieldMask, InstanceId, MemoryId, OperationKind, ProcessorId,
    RegionTreeId, ReservationId, TraceId, TraceLocalId, UniqueId, ViewId,
};

// EQUIVALENCE SETS
// ================================================================================================

/// Identity of a trace condition set for the equivalence-set subscription handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConditionSetId(pub u64);

/// One `(view, expression, fields)` triple emitted when an equivalence set captures trace
/// conditions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionEntry {
    pub view: ViewId,
    pub expr: ExprId,
    pub mask: FieldMask,
}

/// The three view sets an equivalence set reports for a captured expression: views that must be
/// valid before replay, views whose partial validity replay must not disturb, and views replay
/// leaves valid.
#[derive(Clone, Debug, Default)]
pub struct CapturedConditions {
    pub preconditions: Vec<ConditionEntry>,
    pub anticonditions: Vec<ConditionEntry>,
    pub postconditions: Vec<ConditionEntry>,
}

/// The data-version-tracking entity the runtime queries for current view ↦ expression mappings.
///
/// The trace core subscribes condition sets to the equivalence sets covering their footprint and
/// must cancel every subscription before a condition set is dropped.
pub trait EquivalenceSet: Send + Sync {
    /// The expression this set covers.
    fn expression(&self) -> ExprId;

    /// Reports the pre/anti/post view sets for `expr` restricted to `mask`.
    fn capture_trace_conditions(&self, expr: ExprId, mask: &FieldMask) -> CapturedConditions;

    /// True when a valid instance of `view` covers `expr` on every field of `mask`.
    fn has_valid_instance(&self, view: ViewId, expr: ExprId, mask: &FieldMask) -> bool;

    /// True when an instance conflicting with `view` holds partial validity over `expr` on any
    /// field of `mask`.
    fn has_antivalid_instance(&self, view: ViewId, expr: ExprId, mask: &FieldMask) -> bool;

    /// Overwrites the tracked state for `expr` with exactly `views`.
    fn overwrite(&self, expr: ExprId, views: &[(ViewId, FieldMask)]);

    fn subscribe(&self, subscriber: ConditionSetId, mask: &FieldMask);
    fn cancel_subscription(&self, subscriber: ConditionSetId, mask: &FieldMask);
}

// PARENT CONTEXT
// ================================================================================================

/// The enclosing parent task's context.
///
/// Supplies dependence registration, fence queries, equivalence-set lookup, and id generation;
/// consumes trace state transitions. One context serves every trace opened inside the task.
pub trait ParentContext: Send + Sync {
    fn generate_unique_id(&self) -> UniqueId;

    /// The completion event of the most recent execution fence in the task's stream.
    fn current_fence_event(&self) -> Event;

    /// Registers an operation-level dependence of `next` on `previous`.
    fn register_dependence(&self, previous: UniqueId, next: UniqueId, kind: DependenceKind);

    /// Registers a region-level dependence between two requirements.
    #[allow(clippy::too_many_arguments)]
    fn register_region_dependence(
        &self,
        previous: UniqueId,
        previous_requirement: u32,
        next: UniqueId,
        next_requirement: u32,
        kind: DependenceKind,
        validates: bool,
        dependent_fields: &FieldMask,
    );

    /// The equivalence sets currently covering `expr` on `mask`, each with the fields it covers.
    fn find_equivalence_sets(
        &self,
        expr: ExprId,
        mask: &FieldMask,
    ) -> Vec<(Arc<dyn EquivalenceSet>, FieldMask)>;

    /// Resolves statically named fields of the task's field space to a mask.
    fn resolve_static_fields(&self, fields: &[u32]) -> FieldMask;

    /// Asks the context to inject a summary operation for an invalidated trace.
    fn request_summary_operation(&self, trace: TraceId);

    /// Tells the context whether the current trace entry selected a physical replay.
    fn record_physical_trace_replay(&self, replaying: bool);
}

// OPERATIONS
// ================================================================================================

/// Whether an operation opts into physical memoization.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Memoizable {
    /// The mapper declined memoization; the operation participates in logical recording only.
    NoMemo,
    /// The operation records into (and replays from) the physical template.
    Memoize,
}

/// The mapper decisions cached verbatim for an operation so replay can skip mapper queries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapperOutput {
    pub chosen_variant: u32,
    pub task_priority: i32,
    pub postmap_task: bool,
    pub target_procs: Vec<ProcessorId>,
    pub future_locations: Vec<MemoryId>,
    pub future_size_bounds: Vec<FutureBound>,
    /// Per region requirement, the instances the mapper selected.
    pub physical_instances: Vec<Vec<InstanceId>>,
}

/// An upper bound on a future's payload size, valid only while its creator stays inside the
/// trace window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FutureBound {
    /// The trace-local id of the operation that produced the future, if it was produced inside
    /// the current trace.
    pub creator: Option<TraceLocalId>,
    pub upper_bound: Option<usize>,
}

/// An operation submitted to the parent task while a trace is active.
///
/// The trace core reads identity and completion information during recording, and feeds cached
/// mapping decisions and replay events back through the `replay_*`/`complete_*` methods.
pub trait Operation: Send + Sync {
    fn unique_id(&self) -> UniqueId;
    fn trace_local_id(&self) -> TraceLocalId;
    fn kind(&self) -> OperationKind;
    fn region_count(&self) -> usize;
    fn region_tree(&self, requirement: u32) -> RegionTreeId;
    fn memoizable(&self) -> Memoizable;

    /// The event the operation's mapping stage waits on before touching instances.
    fn sync_precondition(&self) -> Event;

    /// The completion event of the operation's execution.
    fn completion_event(&self) -> Event;

    /// Applies a cached mapper decision in place of a mapper query.
    fn replay_mapping_output(&self, output: &MapperOutput);

    /// Applies cached premapping instances.
    fn replay_premap_output(&self, instances: &[Vec<InstanceId>]);

    /// Applies cached reservations (each with its exclusivity).
    fn replay_reservations(&self, reservations: &[(ReservationId, bool)]);

    /// Hands the operation its termination event on replay.
    fn complete_replay(&self, completion: Event);

    /// Feeds the merged effects of the operation's template instructions back as its effects
    /// postcondition.
    fn set_effects_postcondition(&self, effects: Event);
}
