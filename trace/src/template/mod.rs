//! Recording, optimization, and replay of physical templates.
//!
//! A [`PhysicalTemplate`] is created on the first memoizing operation of a trace, records the
//! event dataflow of the trace window, is finalized (conditions computed, optimizer run) when
//! the trace closes, and replays its compiled instruction stream on later matching entries.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::debug;
use weft_core::{
    AcrossExecutor, Barrier, ConditionSetId, CopySrcDstField, EquivalenceSet, Event, ExprId,
    FieldMask, InstanceId, MapperOutput, Operation, OperationKind, ParentContext, RegionForest,
    ReservationId, RuntimeTransport, ShardId, TraceLocalId, Usage, ViewId, ViewUser,
};

mod instruction;
mod optimize;
mod replay;

pub use instruction::{Instruction, InstructionKind};
pub(crate) use instruction::ReplayContext;
pub(crate) use replay::CompiledTemplate;

use crate::{
    conditions::TraceConditionSet,
    errors::{NotReplayableReason, Replayable, TraceError},
    options::TraceConfig,
    sharded::ShardedExtension,
};

// RECORDED VIEW ACCESS
// ================================================================================================

/// One view access recorded for an instruction or an operation.
#[derive(Clone, Debug)]
pub(crate) struct ViewAccess {
    pub view: ViewId,
    pub expr: ExprId,
    pub mask: FieldMask,
    pub usage: Usage,
}

// RECORDING STATE
// ================================================================================================

/// Everything mutated while the template records, guarded by the template lock.
pub(crate) struct RecordingState {
    /// Number of event slots allocated; slot 0 is the fence slot.
    pub slots: usize,
    /// Runtime event handle → slot, valid during recording only.
    pub event_map: HashMap<Event, usize>,
    pub instructions: Vec<Instruction>,
    /// Operation → (term-event slot, kind).
    pub memo_entries: HashMap<TraceLocalId, (usize, OperationKind)>,
    pub cached_mappings: HashMap<TraceLocalId, MapperOutput>,
    pub cached_premappings: HashMap<TraceLocalId, Vec<Vec<InstanceId>>>,
    pub cached_reservations: HashMap<TraceLocalId, Vec<(ReservationId, bool)>>,
    /// Per view, the surviving users after conflict filtering.
    pub view_users: BTreeMap<ViewId, Vec<ViewUser>>,
    /// Per instruction slot, the view accesses it performs.
    pub inst_views: HashMap<usize, Vec<ViewAccess>>,
    /// Per instruction slot, the conflicting users present when it recorded.
    pub elide_users: HashMap<usize, BTreeSet<usize>>,
    /// Like `elide_users`, but `(owner shard, remote slot)` descriptors of users other shards
    /// own; they are imported as frontier barriers during fence elision.
    pub remote_elide_users: HashMap<usize, Vec<(ShardId, usize)>>,
    /// Per operation, accesses and users accumulated before its completing instruction records.
    pub op_views: HashMap<TraceLocalId, Vec<ViewAccess>>,
    pub op_elide_users: HashMap<TraceLocalId, BTreeSet<usize>>,
    pub op_remote_elide_users: HashMap<TraceLocalId, Vec<(ShardId, usize)>>,
    /// Indirection accesses of `IssueAcross` instructions, `(access, is_source)`.
    pub across_indirections: HashMap<usize, Vec<(ViewAccess, bool)>>,
    /// Equivalence sets touched during recording, grouped by root region expression.
    pub equivalence_sets: BTreeMap<ExprId, Vec<(Arc<dyn EquivalenceSet>, FieldMask)>>,
    /// Slots the local shard no longer owns users for but must still publish (sharded).
    pub local_last_users: BTreeSet<usize>,
    pub has_blocking_call: bool,
    pub has_virtual_mapping: bool,
    pub recording_done: bool,
}

impl RecordingState {
    fn new(owner: TraceLocalId) -> Self {
        let fence = Instruction::new(owner, InstructionKind::AssignFenceCompletion { lhs: 0 });
        Self {
            slots: 1,
            event_map: HashMap::new(),
            instructions: vec![fence],
            memo_entries: HashMap::new(),
            cached_mappings: HashMap::new(),
            cached_premappings: HashMap::new(),
            cached_reservations: HashMap::new(),
            view_users: BTreeMap::new(),
            inst_views: HashMap::new(),
            elide_users: HashMap::new(),
            remote_elide_users: HashMap::new(),
            op_views: HashMap::new(),
            op_elide_users: HashMap::new(),
            op_remote_elide_users: HashMap::new(),
            across_indirections: HashMap::new(),
            equivalence_sets: BTreeMap::new(),
            local_last_users: BTreeSet::new(),
            has_blocking_call: false,
            has_virtual_mapping: false,
            recording_done: false,
        }
    }

    pub(crate) fn allocate_slot(&mut self) -> usize {
        let slot = self.slots;
        self.slots += 1;
        slot
    }

    /// Finds the slot holding `event`, if the template has seen it.
    pub(crate) fn find_event(&self, event: Event) -> Option<usize> {
        self.event_map.get(&event).copied()
    }

    /// The conflicting users of `(view, expr, mask)` currently on record.
    pub(crate) fn find_last_users(
        &self,
        forest: &Arc<dyn RegionForest>,
        view: ViewId,
        expr: ExprId,
        mask: &FieldMask,
        usage: &Usage,
    ) -> Vec<ViewUser> {
        let mut users = Vec::new();
        if let Some(recorded) = self.view_users.get(&view) {
            for user in recorded {
                if user.usage.conflicts_with(usage)
                    && user.mask.overlaps(mask)
                    && forest.exprs_overlap(user.expr, expr)
                {
                    users.push(user.clone());
                }
            }
        }
        users
    }

    /// Splits freshly found conflicting users into locally owned slots and remote descriptors.
    fn split_users(
        &self,
        local_shard: ShardId,
        users: Vec<ViewUser>,
    ) -> (BTreeSet<usize>, Vec<(ShardId, usize)>) {
        let mut local = BTreeSet::new();
        let mut remote = Vec::new();
        for user in users {
            if user.owner_shard == local_shard {
                local.insert(user.user);
            } else {
                remote.push((user.owner_shard, user.user));
            }
        }
        (local, remote)
    }

    /// Adds a view user, dropping previously recorded users it supersedes (overlapping fields,
    /// overlapping expressions, conflicting usage). Only the most recent of a conflicting pair
    /// survives.
    pub(crate) fn add_view_user(
        &mut self,
        forest: &Arc<dyn RegionForest>,
        view: ViewId,
        user: ViewUser,
    ) {
        let users = self.view_users.entry(view).or_default();
        users.retain(|existing| {
            !(existing.usage.conflicts_with(&user.usage)
                && existing.mask.overlaps(&user.mask)
                && forest.exprs_overlap(existing.expr, user.expr))
        });
        users.push(user);
    }
}

// PHYSICAL TEMPLATE
// ================================================================================================

/// A recorded trace window: the event DAG, cached mapping decisions, and the conditions under
/// which the whole thing can be replayed.
pub struct PhysicalTemplate {
    forest: Arc<dyn RegionForest>,
    runtime: Arc<dyn RuntimeTransport>,
    config: TraceConfig,
    local_shard: ShardId,
    /// The template lock: guards all recording mutations.
    recording: Mutex<RecordingState>,
    /// Present once finalization succeeded and the template is replayable.
    compiled: Mutex<Option<Arc<CompiledTemplate>>>,
    conditions: Mutex<Vec<TraceConditionSet>>,
    replayable: Mutex<Option<Replayable>>,
    /// Control-replication extension; `None` for single-shard templates.
    pub(crate) sharded: Option<ShardedExtension>,
}

impl PhysicalTemplate {
    /// Creates a template recording under the given fence owner.
    pub fn new(
        forest: Arc<dyn RegionForest>,
        runtime: Arc<dyn RuntimeTransport>,
        config: TraceConfig,
        fence_owner: TraceLocalId,
    ) -> Arc<Self> {
        Arc::new(Self {
            forest,
            runtime,
            config,
            local_shard: ShardId(0),
            recording: Mutex::new(RecordingState::new(fence_owner)),
            compiled: Mutex::new(None),
            conditions: Mutex::new(Vec::new()),
            replayable: Mutex::new(None),
            sharded: None,
        })
    }

    pub(crate) fn with_extension(
        forest: Arc<dyn RegionForest>,
        runtime: Arc<dyn RuntimeTransport>,
        config: TraceConfig,
        fence_owner: TraceLocalId,
        local_shard: ShardId,
        extension: ShardedExtension,
    ) -> Arc<Self> {
        Arc::new(Self {
            forest,
            runtime,
            config,
            local_shard,
            recording: Mutex::new(RecordingState::new(fence_owner)),
            compiled: Mutex::new(None),
            conditions: Mutex::new(Vec::new()),
            replayable: Mutex::new(None),
            sharded: Some(extension),
        })
    }

    pub(crate) fn recording_state(&self) -> parking_lot::MutexGuard<'_, RecordingState> {
        self.recording.lock()
    }

    pub(crate) fn try_recording_state(
        &self,
    ) -> Option<parking_lot::MutexGuard<'_, RecordingState>> {
        self.recording.try_lock()
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub(crate) fn forest(&self) -> &Arc<dyn RegionForest> {
        &self.forest
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn RuntimeTransport> {
        &self.runtime
    }

    pub(crate) fn local_shard(&self) -> ShardId {
        self.local_shard
    }

    /// The capture verdict; `None` until finalized.
    pub fn replayable(&self) -> Option<Replayable> {
        self.replayable.lock().clone()
    }

    pub fn is_replayable(&self) -> bool {
        matches!(self.replayable(), Some(Replayable::Yes))
    }

    // RECORDING CONTRACT
    // --------------------------------------------------------------------------------------------

    /// Registers an operation with the template and materializes its completion event into a
    /// slot. Must be the operation's first recording call.
    pub fn record_get_term_event(&self, op: &dyn Operation) -> Result<(), TraceError> {
        let kind = op.kind();
        if kind.is_internal() || kind == OperationKind::TraceControl {
            return Err(TraceError::UnsupportedOpKind { kind });
        }
        let tlid = op.trace_local_id();
        let mut state = self.recording.lock();
        let slot = state.allocate_slot();
        state
            .instructions
            .push(Instruction::new(tlid.clone(), InstructionKind::GetTermEvent { lhs: slot }));
        state.memo_entries.insert(tlid, (slot, kind));
        let completion = op.completion_event();
        if completion.exists() {
            state.event_map.insert(completion, slot);
        }
        Ok(())
    }

    /// Records the operation's mapping-sync precondition into a slot.
    pub fn record_set_op_sync_event(&self, op: &dyn Operation) {
        let sync = op.sync_precondition();
        let mut state = self.recording.lock();
        let slot = state.allocate_slot();
        state.instructions.push(Instruction::new(
            op.trace_local_id(),
            InstructionKind::SetOpSyncEvent { lhs: slot },
        ));
        if sync.exists() {
            state.event_map.insert(sync, slot);
        }
    }

    /// Wraps `event` in a user event the template controls and returns the renamed handle.
    ///
    /// The recorded program re-creates the user event on every replay and triggers it with the
    /// value of the original event's slot, so downstream consumers always see a creator local
    /// to this template.
    pub fn record_rename_event(&self, op: &dyn Operation, event: Event) -> Event {
        let user_event = self.runtime.create_user_event();
        let mut state = self.recording.lock();
        let rhs = self.resolve_event_slot(&mut state, event);
        let slot = state.allocate_slot();
        state.instructions.push(Instruction::new(
            op.trace_local_id(),
            InstructionKind::CreateApUserEvent { lhs: slot },
        ));
        state
            .instructions
            .push(Instruction::new(op.trace_local_id(), InstructionKind::TriggerEvent {
                lhs: slot,
                rhs,
            }));
        state.slots += 1;
        state.event_map.insert(user_event.event(), slot);
        drop(state);
        // The rename must behave like the original during the recording execution too.
        self.runtime.trigger_user_event(user_event, event);
        self.complete_imports();
        user_event.event()
    }

    /// Records an event merge performed by `op` and returns the merged event.
    pub fn record_merge_events(&self, op: &dyn Operation, inputs: &[Event]) -> Event {
        let result = self.runtime.merge_events(inputs);
        let mut state = self.recording.lock();
        let mut rhs = BTreeSet::new();
        for input in inputs {
            if !input.exists() {
                continue;
            }
            rhs.insert(self.resolve_event_slot(&mut state, *input));
        }
        let slot = state.allocate_slot();
        state
            .instructions
            .push(Instruction::new(op.trace_local_id(), InstructionKind::MergeEvent {
                lhs: slot,
                rhs,
            }));
        state.event_map.insert(result, slot);
        drop(state);
        self.complete_imports();
        result
    }

    /// Records a copy issued by `op` with completion event `completion`.
    #[allow(clippy::too_many_arguments)]
    pub fn record_issue_copy(
        &self,
        op: &dyn Operation,
        completion: Event,
        expr: ExprId,
        src_fields: Vec<CopySrcDstField>,
        dst_fields: Vec<CopySrcDstField>,
        reservations: Vec<(ReservationId, bool)>,
        precondition: Event,
    ) -> usize {
        self.forest.pin_expr(expr);
        let mut state = self.recording.lock();
        let precondition = self.resolve_event_slot(&mut state, precondition);
        let slot = state.allocate_slot();
        state
            .instructions
            .push(Instruction::new(op.trace_local_id(), InstructionKind::IssueCopy {
                lhs: slot,
                expr,
                src_fields,
                dst_fields,
                reservations,
                precondition,
            }));
        state.event_map.insert(completion, slot);
        drop(state);
        self.complete_imports();
        slot
    }

    /// Records a fill issued by `op` with completion event `completion`.
    pub fn record_issue_fill(
        &self,
        op: &dyn Operation,
        completion: Event,
        expr: ExprId,
        dst_fields: Vec<CopySrcDstField>,
        fill_value: Vec<u8>,
        precondition: Event,
    ) -> usize {
        self.forest.pin_expr(expr);
        let mut state = self.recording.lock();
        let precondition = self.resolve_event_slot(&mut state, precondition);
        let slot = state.allocate_slot();
        state
            .instructions
            .push(Instruction::new(op.trace_local_id(), InstructionKind::IssueFill {
                lhs: slot,
                expr,
                dst_fields,
                fill_value,
                precondition,
            }));
        state.event_map.insert(completion, slot);
        drop(state);
        self.complete_imports();
        slot
    }

    /// Records an indirect copy issued by `op` through `executor`.
    #[allow(clippy::too_many_arguments)]
    pub fn record_issue_across(
        &self,
        op: &dyn Operation,
        completion: Event,
        executor: Arc<dyn AcrossExecutor>,
        copy_precondition: Event,
        collective_precondition: Option<Event>,
        src_indirect_precondition: Option<Event>,
        dst_indirect_precondition: Option<Event>,
    ) -> usize {
        let mut state = self.recording.lock();
        let copy_precondition = self.resolve_event_slot(&mut state, copy_precondition);
        let collective_precondition =
            collective_precondition.map(|e| self.resolve_event_slot(&mut state, e));
        let src_indirect_precondition =
            src_indirect_precondition.map(|e| self.resolve_event_slot(&mut state, e));
        let dst_indirect_precondition =
            dst_indirect_precondition.map(|e| self.resolve_event_slot(&mut state, e));
        let slot = state.allocate_slot();
        state
            .instructions
            .push(Instruction::new(op.trace_local_id(), InstructionKind::IssueAcross {
                lhs: slot,
                executor,
                copy_precondition,
                collective_precondition,
                src_indirect_precondition,
                dst_indirect_precondition,
            }));
        state.event_map.insert(completion, slot);
        drop(state);
        self.complete_imports();
        slot
    }

    /// Records the event handed back to `op` as its termination on replay. The direct users
    /// accumulated for the operation's views become the instruction's fence-elision candidates.
    pub fn record_complete_replay(&self, op: &dyn Operation, precondition: Event) {
        let tlid = op.trace_local_id();
        let mut state = self.recording.lock();
        let rhs = self.resolve_event_slot(&mut state, precondition);
        let index = state.instructions.len();
        state
            .instructions
            .push(Instruction::new(tlid.clone(), InstructionKind::CompleteReplay { rhs }));
        state.slots += 1;
        if let Some(users) = state.op_elide_users.remove(&tlid) {
            state.elide_users.insert(index, users);
        }
        if let Some(remote) = state.op_remote_elide_users.remove(&tlid) {
            state.remote_elide_users.insert(index, remote);
        }
        if let Some(views) = state.op_views.remove(&tlid) {
            state.inst_views.insert(index, views);
        }
        drop(state);
        self.complete_imports();
    }

    /// Feeds `effects` back to `op` as its effects postcondition.
    pub fn record_set_effects(&self, op: &dyn Operation, effects: Event) {
        let mut state = self.recording.lock();
        let rhs = self.resolve_event_slot(&mut state, effects);
        state
            .instructions
            .push(Instruction::new(op.trace_local_id(), InstructionKind::SetEffects { rhs }));
        state.slots += 1;
        drop(state);
        self.complete_imports();
    }

    /// Records an arrival on a barrier named collectively by every shard; the handle replayed
    /// with is supplied per replay under `key`.
    pub fn record_collective_barrier(
        &self,
        op: &dyn Operation,
        barrier: Barrier,
        precondition: Event,
        key: u64,
        arrivals: u32,
    ) -> usize {
        let sharded = self.sharded.as_ref().expect("collective barriers require sharding");
        let mut state = self.recording.lock();
        let rhs = self.resolve_event_slot(&mut state, precondition);
        let slot = state.allocate_slot();
        state
            .instructions
            .push(Instruction::new(op.trace_local_id(), InstructionKind::BarrierArrival {
                lhs: slot,
                rhs,
                barrier,
                arrivals,
                collective_key: Some(key),
            }));
        state.event_map.insert(barrier.event(), slot);
        drop(state);
        sharded.set_collective_barrier(key, barrier);
        self.complete_imports();
        slot
    }

    fn complete_imports(&self) {
        if let Some(sharded) = &self.sharded {
            sharded.wait_pending_imports(self);
        }
    }

    /// Records a task-level view access of `op`.
    pub fn record_op_view(
        &self,
        op: &dyn Operation,
        view: ViewId,
        expr: ExprId,
        mask: FieldMask,
        usage: Usage,
    ) {
        let tlid = op.trace_local_id();
        let mut state = self.recording.lock();
        let Some((term_slot, _)) = state.memo_entries.get(&tlid).copied() else {
            return;
        };
        let found = state.find_last_users(&self.forest, view, expr, &mask, &usage);
        let (direct, remote) = state.split_users(self.local_shard, found);
        state.op_elide_users.entry(tlid.clone()).or_default().extend(direct);
        state.op_remote_elide_users.entry(tlid.clone()).or_default().extend(remote);
        state
            .op_views
            .entry(tlid)
            .or_default()
            .push(ViewAccess { view, expr, mask, usage });
        self.record_view_user(&mut state, view, expr, mask, usage, term_slot);
    }

    /// Records the views moved by a copy instruction previously recorded at `slot`.
    pub fn record_copy_views(
        &self,
        op: &dyn Operation,
        slot: usize,
        src: Vec<(ViewId, ExprId, FieldMask)>,
        dst: Vec<(ViewId, ExprId, FieldMask)>,
    ) {
        let _ = op;
        let mut state = self.recording.lock();
        for (views, usage) in [(src, Usage::read_only()), (dst, Usage::read_write())] {
            for (view, expr, mask) in views {
                let found = state.find_last_users(&self.forest, view, expr, &mask, &usage);
                let (direct, remote) = state.split_users(self.local_shard, found);
                state.elide_users.entry(slot).or_default().extend(direct);
                state.remote_elide_users.entry(slot).or_default().extend(remote);
                state
                    .inst_views
                    .entry(slot)
                    .or_default()
                    .push(ViewAccess { view, expr, mask, usage });
                self.record_view_user(&mut state, view, expr, mask, usage, slot);
            }
        }
    }

    /// Records the views written by a fill instruction previously recorded at `slot`.
    pub fn record_fill_views(
        &self,
        op: &dyn Operation,
        slot: usize,
        dst: Vec<(ViewId, ExprId, FieldMask)>,
    ) {
        self.record_copy_views(op, slot, Vec::new(), dst);
    }

    /// Records the indirection views read by an across instruction at `slot`.
    pub fn record_indirect_views(
        &self,
        op: &dyn Operation,
        slot: usize,
        indirections: Vec<(ViewId, ExprId, FieldMask, bool)>,
    ) {
        let _ = op;
        let usage = Usage::read_only();
        let mut state = self.recording.lock();
        for (view, expr, mask, is_source) in indirections {
            let found = state.find_last_users(&self.forest, view, expr, &mask, &usage);
            let (direct, remote) = state.split_users(self.local_shard, found);
            state.elide_users.entry(slot).or_default().extend(direct);
            state.remote_elide_users.entry(slot).or_default().extend(remote);
            let access = ViewAccess { view, expr, mask, usage };
            state.inst_views.entry(slot).or_default().push(access.clone());
            state.across_indirections.entry(slot).or_default().push((access, is_source));
            self.record_view_user(&mut state, view, expr, mask, usage, slot);
        }
    }

    /// Caches the mapper's decisions for `op`, dropping future size bounds whose creator lies
    /// outside the trace window.
    pub fn record_mapper_output(&self, op: &dyn Operation, mut output: MapperOutput) {
        for bound in output.future_size_bounds.iter_mut() {
            if bound.creator.is_none() {
                bound.upper_bound = None;
            }
        }
        let mut state = self.recording.lock();
        state.cached_mappings.insert(op.trace_local_id(), output);
    }

    pub fn record_premap_output(&self, op: &dyn Operation, instances: Vec<Vec<InstanceId>>) {
        let mut state = self.recording.lock();
        state.cached_premappings.insert(op.trace_local_id(), instances);
    }

    pub fn record_reservations(
        &self,
        op: &dyn Operation,
        reservations: Vec<(ReservationId, bool)>,
    ) {
        let mut state = self.recording.lock();
        state.cached_reservations.insert(op.trace_local_id(), reservations);
    }

    /// Accumulates the equivalence sets covering `op`'s requirements under their root region
    /// expression, for condition capture at trace close.
    pub fn record_equivalence_sets(
        &self,
        root_expr: ExprId,
        sets: Vec<(Arc<dyn EquivalenceSet>, FieldMask)>,
    ) {
        let mut state = self.recording.lock();
        let entry = state.equivalence_sets.entry(root_expr).or_default();
        for (set, mask) in sets {
            if let Some((_, existing)) =
                entry.iter_mut().find(|(s, _)| Arc::ptr_eq(s, &set))
            {
                *existing |= mask;
            } else {
                entry.push((set, mask));
            }
        }
    }

    /// Marks the template non-replayable because a blocking call happened inside the trace.
    pub fn record_blocking_call(&self) {
        self.recording.lock().has_blocking_call = true;
    }

    /// Marks the template non-replayable because an instance was virtually mapped.
    pub fn record_virtual_mapping(&self) {
        self.recording.lock().has_virtual_mapping = true;
    }

    // EVENT RESOLUTION
    // --------------------------------------------------------------------------------------------

    /// Resolves `event` to its slot. Unknown local events predate the trace and resolve to the
    /// fence slot; unknown events created by another shard are imported through the sharded
    /// naming protocol.
    fn resolve_event_slot(&self, state: &mut RecordingState, event: Event) -> usize {
        if !event.exists() {
            return 0;
        }
        if let Some(slot) = state.find_event(event) {
            return slot;
        }
        if let Some(sharded) = &self.sharded {
            if event.creator_shard() != self.local_shard {
                return sharded.import_remote_event(state, event);
            }
        }
        0
    }

    fn record_view_user(
        &self,
        state: &mut RecordingState,
        view: ViewId,
        expr: ExprId,
        mask: FieldMask,
        usage: Usage,
        slot: usize,
    ) {
        let owner_shard = self.forest.view_owner_shard(view);
        let user = ViewUser { usage, user: slot, expr, mask, owner_shard: self.local_shard };
        if let Some(sharded) = &self.sharded {
            if owner_shard != self.local_shard {
                sharded.forward_view_user(state, view, user);
                return;
            }
        }
        state.add_view_user(&self.forest, view, user);
    }

    // FINALIZATION
    // --------------------------------------------------------------------------------------------

    /// Finalizes the capture: computes the trace conditions, evaluates replayability, and — for
    /// replayable templates — runs the optimization pipeline and installs the compiled program.
    #[tracing::instrument(skip_all)]
    pub fn finalize(self: &Arc<Self>, parent: &Arc<dyn ParentContext>) -> Replayable {
        let mut state = self.recording.lock();
        state.recording_done = true;

        let mut verdict = if state.has_blocking_call {
            Replayable::No(NotReplayableReason::BlockingCall)
        } else if state.has_virtual_mapping {
            Replayable::No(NotReplayableReason::VirtualMapping)
        } else {
            self.compute_conditions(&state, parent)
        };

        if let Some(sharded) = &self.sharded {
            // Publish surviving remote users, then agree on the verdict with every shard.
            sharded.publish_last_users(&state);
            verdict = sharded.exchange_replayable(verdict);
        }

        if verdict.is_replayable() {
            let mut program = optimize::compile(self, &mut state);
            let pending = program.pending_reduction_input.take();
            self.install_compiled(CompiledTemplate::new(program));
            self.flag_immutable_indirections(&state);
            if let Some((snapshot, slots)) = pending {
                self.spawn_deferred_reduction(snapshot, slots);
            }
        } else {
            debug!(target: "weft::trace::template", verdict = %verdict, "capture not replayable");
        }

        *self.replayable.lock() = Some(verdict.clone());
        verdict
    }

    /// Builds one condition set per recorded root region and folds their verdicts.
    fn compute_conditions(
        &self,
        state: &RecordingState,
        parent: &Arc<dyn ParentContext>,
    ) -> Replayable {
        let mut verdict = Replayable::Yes;
        let mut all = Vec::with_capacity(state.equivalence_sets.len());
        for (root, sets) in state.equivalence_sets.iter() {
            let id = ConditionSetId(parent.generate_unique_id().0);
            let condition =
                TraceConditionSet::capture(Arc::clone(&self.forest), *root, sets.clone(), id);
            if verdict.is_replayable() {
                verdict = condition.is_replayable();
            }
            all.push(condition);
        }
        *self.conditions.lock() = all;
        verdict
    }

    /// Checks the indirection fields of every across copy; when all their recorded users are
    /// read-only the executor can reuse its precomputed preimages over replays.
    fn flag_immutable_indirections(&self, state: &RecordingState) {
        for (slot, indirections) in state.across_indirections.iter() {
            let Some(executor) = self.find_across_executor(*slot) else {
                continue;
            };
            for (access, is_source) in indirections {
                let read_only = if let Some(sharded) = &self.sharded {
                    if self.forest.view_owner_shard(access.view) != self.local_shard {
                        sharded.remote_users_read_only(self, access)
                    } else {
                        self.local_users_read_only(state, access)
                    }
                } else {
                    self.local_users_read_only(state, access)
                };
                if read_only {
                    executor.mark_immutable_indirection(*is_source);
                }
            }
        }
    }

    fn local_users_read_only(&self, state: &RecordingState, access: &ViewAccess) -> bool {
        let Some(users) = state.view_users.get(&access.view) else {
            return true;
        };
        users.iter().all(|user| {
            !user.mask.overlaps(&access.mask)
                || !self.forest.exprs_overlap(user.expr, access.expr)
                || user.usage.is_read_only()
        })
    }

    fn find_across_executor(&self, slot: usize) -> Option<Arc<dyn AcrossExecutor>> {
        let compiled = self.try_compiled()?;
        compiled.find_across_executor(slot)
    }

    // CONDITION PROTOCOL
    // --------------------------------------------------------------------------------------------

    /// Dispatches the precondition/anticondition analyses for every condition set; true when
    /// all of them pass.
    pub fn test_preconditions(&self, parent: &Arc<dyn ParentContext>) -> bool {
        let conditions = self.conditions.lock();
        let tests: Vec<_> =
            conditions.iter().map(|condition| condition.test_require(parent)).collect();
        conditions
            .iter()
            .zip(tests)
            .all(|(condition, test)| condition.check_require(test))
    }

    /// Overwrites the equivalence sets with the template's postconditions.
    pub fn apply_postconditions(&self) {
        for condition in self.conditions.lock().iter() {
            condition.ensure();
        }
    }

    /// Tells every condition set that outside activity invalidated `mask` fields.
    pub fn invalidate_conditions(&self, mask: &FieldMask) {
        for condition in self.conditions.lock().iter() {
            condition.invalidate_equivalence_sets(mask);
        }
    }

    /// Runs the teardown handshake: cancels condition subscriptions and releases the sharded
    /// registration. Must be called before the template is dropped.
    pub fn retire(&self) {
        for condition in self.conditions.lock().iter() {
            condition.cancel_subscriptions();
        }
        if let Some(sharded) = &self.sharded {
            sharded.unregister(self);
        }
    }

    // DIAGNOSTICS
    // --------------------------------------------------------------------------------------------

    /// Renders the recorded instruction stream through `tracing` for post-capture inspection.
    pub fn dump_template(&self) {
        let state = self.recording.lock();
        debug!(target: "weft::trace::template", instructions = state.instructions.len());
        for (index, instruction) in state.instructions.iter().enumerate() {
            debug!(target: "weft::trace::template", "  [{index}] {instruction}");
        }
    }

    #[cfg(test)]
    pub(crate) fn with_recording<R>(&self, body: impl FnOnce(&RecordingState) -> R) -> R {
        body(&self.recording.lock())
    }
}

// SLOT COUNT INVARIANT
// ================================================================================================

// `RecordingState::slots` counts one slot per instruction plus the fence slot. Instructions that
// write no slot (SetEffects, CompleteReplay, TriggerEvent) still advance the count so the
// relation `slots == instructions + 1` holds during normal recording; the optimizer appends
// merge/frontier/crossing slots past that point.
