use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use weft_core::{
    AcrossExecutor, CapturedConditions, ConditionEntry, ConditionSetId, DependenceKind,
    EquivalenceSet, Event, ExprId, FieldMask, InstanceId, MapperOutput, Memoizable, Operation,
    OperationKind, ParentContext, RegionForest, RegionTreeId, ReservationId, TraceId, TraceLocalId,
    UniqueId, ViewId,
};

use super::{MockForest, MockRuntime};

// MOCK EQUIVALENCE SET
// ================================================================================================

/// A scripted equivalence set: tests choose what it captures and which instances it currently
/// considers valid.
pub struct MockEquivalenceSet {
    expr: ExprId,
    forest: Arc<MockForest>,
    state: Mutex<EqState>,
}

#[derive(Default)]
struct EqState {
    captured: CapturedConditions,
    valid: Vec<(ViewId, ExprId, FieldMask)>,
    antivalid: Vec<(ViewId, ExprId, FieldMask)>,
    subscriptions: Vec<(ConditionSetId, FieldMask)>,
    overwrites: Vec<(ExprId, Vec<(ViewId, FieldMask)>)>,
}

impl MockEquivalenceSet {
    pub fn new(forest: Arc<MockForest>, expr: ExprId) -> Arc<Self> {
        Arc::new(Self { expr, forest, state: Mutex::new(EqState::default()) })
    }

    /// Scripts the conditions the next capture reports.
    pub fn script_capture(
        &self,
        preconditions: Vec<ConditionEntry>,
        anticonditions: Vec<ConditionEntry>,
        postconditions: Vec<ConditionEntry>,
    ) {
        self.state.lock().captured =
            CapturedConditions { preconditions, anticonditions, postconditions };
    }

    /// Marks `view` as currently holding valid data over `expr` for `mask`.
    pub fn add_valid_instance(&self, view: ViewId, expr: ExprId, mask: FieldMask) {
        self.state.lock().valid.push((view, expr, mask));
    }

    pub fn clear_valid_instances(&self) {
        self.state.lock().valid.clear();
    }

    /// Marks a conflicting instance as partially valid over `expr` for `mask`.
    pub fn add_antivalid_instance(&self, view: ViewId, expr: ExprId, mask: FieldMask) {
        self.state.lock().antivalid.push((view, expr, mask));
    }

    pub fn overwrites(&self) -> Vec<(ExprId, Vec<(ViewId, FieldMask)>)> {
        self.state.lock().overwrites.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }
}

impl EquivalenceSet for MockEquivalenceSet {
    fn expression(&self) -> ExprId {
        self.expr
    }

    fn capture_trace_conditions(&self, expr: ExprId, mask: &FieldMask) -> CapturedConditions {
        let state = self.state.lock();
        let restrict = |entries: &[ConditionEntry]| {
            entries
                .iter()
                .filter_map(|entry| {
                    let fields = entry.mask & *mask;
                    let piece = self.forest.intersect_exprs(entry.expr, expr);
                    if fields.is_empty() || self.forest.expr_is_empty(piece) {
                        None
                    } else {
                        Some(ConditionEntry { view: entry.view, expr: piece, mask: fields })
                    }
                })
                .collect()
        };
        CapturedConditions {
            preconditions: restrict(&state.captured.preconditions),
            anticonditions: restrict(&state.captured.anticonditions),
            postconditions: restrict(&state.captured.postconditions),
        }
    }

    fn has_valid_instance(&self, view: ViewId, expr: ExprId, mask: &FieldMask) -> bool {
        let state = self.state.lock();
        // Every field must be covered by a valid entry whose expression contains `expr`.
        mask.iter().all(|field| {
            state.valid.iter().any(|(v, e, m)| {
                *v == view
                    && m.contains(field)
                    && self.forest.expr_is_empty(self.forest.subtract_exprs(expr, *e))
            })
        })
    }

    fn has_antivalid_instance(&self, view: ViewId, expr: ExprId, mask: &FieldMask) -> bool {
        let state = self.state.lock();
        state.antivalid.iter().any(|(v, e, m)| {
            *v != view && m.overlaps(mask) && self.forest.exprs_overlap(*e, expr)
        })
    }

    fn overwrite(&self, expr: ExprId, views: &[(ViewId, FieldMask)]) {
        let mut state = self.state.lock();
        state.overwrites.push((expr, views.to_vec()));
        for (view, mask) in views {
            state.valid.push((*view, expr, *mask));
        }
    }

    fn subscribe(&self, subscriber: ConditionSetId, mask: &FieldMask) {
        self.state.lock().subscriptions.push((subscriber, *mask));
    }

    fn cancel_subscription(&self, subscriber: ConditionSetId, mask: &FieldMask) {
        let mut state = self.state.lock();
        let position = state
            .subscriptions
            .iter()
            .position(|(id, m)| *id == subscriber && m == mask)
            .expect("cancelling a subscription that was never made");
        state.subscriptions.swap_remove(position);
    }
}

// MOCK PARENT CONTEXT
// ================================================================================================

/// The parent task's context, scripted per root expression.
pub struct MockParentContext {
    next_uid: AtomicU64,
    state: Mutex<ContextState>,
}

#[derive(Default)]
struct ContextState {
    fence_event: Event,
    equivalence_sets: Vec<(ExprId, Arc<MockEquivalenceSet>, FieldMask)>,
    dependences: Vec<RecordedDependence>,
    summary_requests: Vec<TraceId>,
    replay_status: Vec<bool>,
}

/// A dependence registration observed by the context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedDependence {
    pub previous: UniqueId,
    pub previous_requirement: Option<u32>,
    pub next: UniqueId,
    pub next_requirement: Option<u32>,
    pub kind: DependenceKind,
    pub validates: bool,
    pub dependent_fields: FieldMask,
}

impl MockParentContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_uid: AtomicU64::new(1),
            state: Mutex::new(ContextState::default()),
        })
    }

    pub fn set_fence_event(&self, fence: Event) {
        self.state.lock().fence_event = fence;
    }

    /// Registers an equivalence set to be returned for lookups under `root`.
    pub fn add_equivalence_set(
        &self,
        root: ExprId,
        set: Arc<MockEquivalenceSet>,
        mask: FieldMask,
    ) {
        self.state.lock().equivalence_sets.push((root, set, mask));
    }

    pub fn dependences(&self) -> Vec<RecordedDependence> {
        self.state.lock().dependences.clone()
    }

    pub fn summary_requests(&self) -> Vec<TraceId> {
        self.state.lock().summary_requests.clone()
    }

    pub fn replay_status(&self) -> Vec<bool> {
        self.state.lock().replay_status.clone()
    }
}

impl ParentContext for MockParentContext {
    fn generate_unique_id(&self) -> UniqueId {
        UniqueId(self.next_uid.fetch_add(1, Ordering::Relaxed))
    }

    fn current_fence_event(&self) -> Event {
        self.state.lock().fence_event
    }

    fn register_dependence(&self, previous: UniqueId, next: UniqueId, kind: DependenceKind) {
        self.state.lock().dependences.push(RecordedDependence {
            previous,
            previous_requirement: None,
            next,
            next_requirement: None,
            kind,
            validates: false,
            dependent_fields: FieldMask::EMPTY,
        });
    }

    fn register_region_dependence(
        &self,
        previous: UniqueId,
        previous_requirement: u32,
        next: UniqueId,
        next_requirement: u32,
        kind: DependenceKind,
        validates: bool,
        dependent_fields: &FieldMask,
    ) {
        self.state.lock().dependences.push(RecordedDependence {
            previous,
            previous_requirement: Some(previous_requirement),
            next,
            next_requirement: Some(next_requirement),
            kind,
            validates,
            dependent_fields: *dependent_fields,
        });
    }

    fn find_equivalence_sets(
        &self,
        expr: ExprId,
        mask: &FieldMask,
    ) -> Vec<(Arc<dyn EquivalenceSet>, FieldMask)> {
        let state = self.state.lock();
        state
            .equivalence_sets
            .iter()
            .filter(|(root, _, set_mask)| *root == expr && set_mask.overlaps(mask))
            .map(|(_, set, set_mask)| {
                (Arc::clone(set) as Arc<dyn EquivalenceSet>, *set_mask & *mask)
            })
            .collect()
    }

    fn resolve_static_fields(&self, fields: &[u32]) -> FieldMask {
        let indices: Vec<usize> = fields.iter().map(|f| *f as usize).collect();
        FieldMask::of(&indices)
    }

    fn request_summary_operation(&self, trace: TraceId) {
        self.state.lock().summary_requests.push(trace);
    }

    fn record_physical_trace_replay(&self, replaying: bool) {
        self.state.lock().replay_status.push(replaying);
    }
}

// MOCK OPERATION
// ================================================================================================

/// An operation with scripted identity, collecting everything replay feeds back to it.
pub struct MockOperation {
    uid: UniqueId,
    tlid: TraceLocalId,
    kind: OperationKind,
    region_trees: Vec<RegionTreeId>,
    memoizable: Memoizable,
    sync_precondition: Event,
    completion: Event,
    replayed: Mutex<ReplayedState>,
}

#[derive(Default)]
struct ReplayedState {
    mapping: Option<MapperOutput>,
    premap: Option<Vec<Vec<InstanceId>>>,
    reservations: Option<Vec<(ReservationId, bool)>>,
    completion: Option<Event>,
    effects: Option<Event>,
}

impl MockOperation {
    pub fn task(runtime: &MockRuntime, context_index: u64) -> Arc<Self> {
        Self::with_kind(runtime, context_index, OperationKind::Task, 1)
    }

    pub fn with_kind(
        runtime: &MockRuntime,
        context_index: u64,
        kind: OperationKind,
        region_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid: UniqueId(1000 + context_index),
            tlid: TraceLocalId::new(context_index),
            kind,
            region_trees: vec![RegionTreeId(0); region_count],
            memoizable: Memoizable::Memoize,
            sync_precondition: runtime.fresh_event(),
            completion: runtime.fresh_event(),
            replayed: Mutex::new(ReplayedState::default()),
        })
    }

    pub fn with_region_trees(
        runtime: &MockRuntime,
        context_index: u64,
        kind: OperationKind,
        region_trees: Vec<RegionTreeId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid: UniqueId(1000 + context_index),
            tlid: TraceLocalId::new(context_index),
            kind,
            region_trees,
            memoizable: Memoizable::Memoize,
            sync_precondition: runtime.fresh_event(),
            completion: runtime.fresh_event(),
            replayed: Mutex::new(ReplayedState::default()),
        })
    }

    pub fn not_memoizable(runtime: &MockRuntime, context_index: u64) -> Arc<Self> {
        let mut op = Self::task(runtime, context_index);
        Arc::get_mut(&mut op).unwrap().memoizable = Memoizable::NoMemo;
        op
    }

    pub fn replayed_mapping(&self) -> Option<MapperOutput> {
        self.replayed.lock().mapping.clone()
    }

    pub fn replayed_premap(&self) -> Option<Vec<Vec<InstanceId>>> {
        self.replayed.lock().premap.clone()
    }

    pub fn replayed_reservations(&self) -> Option<Vec<(ReservationId, bool)>> {
        self.replayed.lock().reservations.clone()
    }

    pub fn replay_completion(&self) -> Option<Event> {
        self.replayed.lock().completion
    }

    pub fn effects_postcondition(&self) -> Option<Event> {
        self.replayed.lock().effects
    }
}

impl Operation for MockOperation {
    fn unique_id(&self) -> UniqueId {
        self.uid
    }

    fn trace_local_id(&self) -> TraceLocalId {
        self.tlid.clone()
    }

    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn region_count(&self) -> usize {
        self.region_trees.len()
    }

    fn region_tree(&self, requirement: u32) -> RegionTreeId {
        self.region_trees[requirement as usize]
    }

    fn memoizable(&self) -> Memoizable {
        self.memoizable
    }

    fn sync_precondition(&self) -> Event {
        self.sync_precondition
    }

    fn completion_event(&self) -> Event {
        self.completion
    }

    fn replay_mapping_output(&self, output: &MapperOutput) {
        self.replayed.lock().mapping = Some(output.clone());
    }

    fn replay_premap_output(&self, instances: &[Vec<InstanceId>]) {
        self.replayed.lock().premap = Some(instances.to_vec());
    }

    fn replay_reservations(&self, reservations: &[(ReservationId, bool)]) {
        self.replayed.lock().reservations = Some(reservations.to_vec());
    }

    fn complete_replay(&self, completion: Event) {
        self.replayed.lock().completion = Some(completion);
    }

    fn set_effects_postcondition(&self, effects: Event) {
        self.replayed.lock().effects = Some(effects);
    }
}

// MOCK ACROSS EXECUTOR
// ================================================================================================

/// An indirect-copy executor recording the preconditions it was replayed with.
pub struct MockAcrossExecutor {
    runtime: Arc<MockRuntime>,
    state: Mutex<AcrossState>,
}

#[derive(Default)]
struct AcrossState {
    executions: Vec<[Event; 4]>,
    immutable_src: bool,
    immutable_dst: bool,
}

impl MockAcrossExecutor {
    pub fn new(runtime: Arc<MockRuntime>) -> Arc<Self> {
        Arc::new(Self { runtime, state: Mutex::new(AcrossState::default()) })
    }

    pub fn executions(&self) -> Vec<[Event; 4]> {
        self.state.lock().executions.clone()
    }

    pub fn immutable_flags(&self) -> (bool, bool) {
        let state = self.state.lock();
        (state.immutable_src, state.immutable_dst)
    }
}

impl AcrossExecutor for MockAcrossExecutor {
    fn execute(
        &self,
        copy_precondition: Event,
        collective_precondition: Event,
        src_indirect_precondition: Event,
        dst_indirect_precondition: Event,
    ) -> Event {
        self.state.lock().executions.push([
            copy_precondition,
            collective_precondition,
            src_indirect_precondition,
            dst_indirect_precondition,
        ]);
        self.runtime.derived_event(copy_precondition)
    }

    fn mark_immutable_indirection(&self, source_indirect: bool) {
        let mut state = self.state.lock();
        if source_indirect {
            state.immutable_src = true;
        } else {
            state.immutable_dst = true;
        }
    }
}
