use crate::{Event, FieldId, InstanceId, ReductionOpId, ReservationId, ShardId};

// INDEX SPACE EXPRESSIONS
// ================================================================================================

/// Handle to an index-space expression owned by the region forest.
///
/// Expressions name sets of multi-dimensional points. The trace core never looks inside one; it
/// combines them through [`RegionForest`] and holds pins for the handles it stores.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExprId(pub u64);

impl ExprId {
    /// The canonical empty expression. Always pinned, never owned.
    pub const EMPTY: Self = Self(0);
}

/// Handle to a field-masked view of a physical instance, owned by the region forest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId(pub u64);

/// One field of a copy descriptor: an instance, the field to move, and an optional fold-on-write
/// reduction operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CopySrcDstField {
    pub inst: InstanceId,
    pub field: FieldId,
    pub redop: ReductionOpId,
}

// REGION FOREST
// ================================================================================================

/// The region-tree forest the trace core leans on for expression algebra, view ownership, and
/// the actual issuing of data movement during replay.
///
/// Stored handles are reference counted: each `pin_*` must be matched by exactly one `unpin_*`.
/// All methods may be called concurrently from recording and replay threads.
pub trait RegionForest: Send + Sync {
    fn union_exprs(&self, a: ExprId, b: ExprId) -> ExprId;
    fn intersect_exprs(&self, a: ExprId, b: ExprId) -> ExprId;
    fn subtract_exprs(&self, a: ExprId, b: ExprId) -> ExprId;
    fn expr_volume(&self, expr: ExprId) -> u64;

    fn expr_is_empty(&self, expr: ExprId) -> bool {
        self.expr_volume(expr) == 0
    }

    fn exprs_overlap(&self, a: ExprId, b: ExprId) -> bool {
        !self.expr_is_empty(self.intersect_exprs(a, b))
    }

    fn pin_expr(&self, expr: ExprId);
    fn unpin_expr(&self, expr: ExprId);
    fn pin_view(&self, view: ViewId);
    fn unpin_view(&self, view: ViewId);

    /// The shard whose instance node owns the view. Determines where view users are collected in
    /// control-replicated templates.
    fn view_owner_shard(&self, view: ViewId) -> ShardId;

    /// Issues a gathering copy over `expr` and returns its completion event.
    fn issue_copy(
        &self,
        expr: ExprId,
        src_fields: &[CopySrcDstField],
        dst_fields: &[CopySrcDstField],
        reservations: &[(ReservationId, bool)],
        precondition: Event,
    ) -> Event;

    /// Issues a fill of `fill_value` over `expr` and returns its completion event.
    fn issue_fill(
        &self,
        expr: ExprId,
        dst_fields: &[CopySrcDstField],
        fill_value: &[u8],
        precondition: Event,
    ) -> Event;
}

// ACROSS EXECUTOR
// ================================================================================================

/// Executor for an indirect (gather/scatter) copy across regions.
///
/// The executor is built during mapping and captured by the template; replay re-runs it with the
/// event preconditions recorded for the trace. When a template proves that the indirection
/// fields are never written inside the trace, it marks the executor immutable so preimage
/// computations are reused across replays.
pub trait AcrossExecutor: Send + Sync {
    fn execute(
        &self,
        copy_precondition: Event,
        collective_precondition: Event,
        src_indirect_precondition: Event,
        dst_indirect_precondition: Event,
    ) -> Event;

    /// Marks the source or destination indirection as trace-immutable.
    fn mark_immutable_indirection(&self, source_indirect: bool);
}
