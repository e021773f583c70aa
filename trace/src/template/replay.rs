//! Replay-time state of a finalized template: the event slot array, the per-slice instruction
//! streams, and the frontier/crossing bookkeeping re-bound at the start of every replay.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use weft_core::{Barrier, Event, Operation, TraceLocalId, UserEvent};

use super::{
    Instruction, InstructionKind, PhysicalTemplate, ReplayContext,
    optimize::{reduce_incoming_edges, resolve_alias},
};

// COMPILED PROGRAM
// ================================================================================================

/// A cross-slice dataflow edge: `slot` carries a fresh user event each replay, triggered with
/// the value of `source` by the producer slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Crossing {
    pub source: usize,
    pub slot: usize,
}

/// The output of the optimization pipeline, consumed by [`CompiledTemplate::new`].
pub(crate) struct CompiledProgram {
    pub slots: usize,
    pub slices: Vec<Vec<Instruction>>,
    pub crossings: Vec<Crossing>,
    pub frontiers: BTreeMap<usize, usize>,
    pub aliases: HashMap<usize, usize>,
    pub postcondition_slots: BTreeSet<usize>,
    /// Snapshot handed to the deferred transitive-reduction task, when deferral is configured.
    pub pending_reduction_input: Option<(Vec<Instruction>, usize)>,
    pub supports_recurrent: bool,
}

enum PendingReduction {
    None,
    Computing,
    Ready(HashMap<usize, BTreeSet<usize>>),
}

/// The replay engine of one finalized template.
///
/// `events` has a single writer per slot per replay (guaranteed by the slicing pass), so slots
/// are plain atomics: release stores by the producing slice, acquire loads by consumers that
/// were routed through crossings or run later in the same slice.
pub(crate) struct CompiledTemplate {
    events: Vec<AtomicU64>,
    slices: Vec<Mutex<Vec<Instruction>>>,
    crossings: Mutex<Vec<Crossing>>,
    frontiers: Vec<(usize, usize)>,
    aliases: HashMap<usize, usize>,
    postcondition_slots: Vec<usize>,
    /// Slots of `CreateApUserEvent` instructions; fresh user events are allocated for them (and
    /// for crossing slots) at the start of every replay.
    user_event_slots: Vec<usize>,
    supports_recurrent: bool,
    pending_reduction: Mutex<PendingReduction>,
    user_events: RwLock<HashMap<usize, UserEvent>>,
    operations: RwLock<HashMap<TraceLocalId, Arc<dyn Operation>>>,
    fence_completion: AtomicU64,
    replay_done: Mutex<Event>,
    replay_count: AtomicU64,
}

impl CompiledTemplate {
    pub fn new(program: CompiledProgram) -> Arc<Self> {
        let mut user_event_slots = Vec::new();
        for slice in program.slices.iter() {
            for instruction in slice {
                if let InstructionKind::CreateApUserEvent { lhs } = &instruction.kind {
                    user_event_slots.push(*lhs);
                }
            }
        }
        let events = (0..program.slots).map(|_| AtomicU64::new(0)).collect();
        Arc::new(Self {
            events,
            slices: program.slices.into_iter().map(Mutex::new).collect(),
            crossings: Mutex::new(program.crossings),
            frontiers: program.frontiers.into_iter().collect(),
            aliases: program.aliases,
            postcondition_slots: program.postcondition_slots.into_iter().collect(),
            user_event_slots,
            supports_recurrent: program.supports_recurrent,
            pending_reduction: Mutex::new(PendingReduction::None),
            user_events: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            fence_completion: AtomicU64::new(0),
            replay_done: Mutex::new(Event::NO_EVENT),
            replay_count: AtomicU64::new(0),
        })
    }

    pub fn supports_recurrent(&self) -> bool {
        self.supports_recurrent
    }

    pub fn replay_count(&self) -> u64 {
        self.replay_count.load(Ordering::Relaxed)
    }

    pub fn frontiers(&self) -> &[(usize, usize)] {
        &self.frontiers
    }

    pub fn load_event(&self, slot: usize) -> Event {
        Event::from_raw(self.events[slot].load(Ordering::Acquire))
    }

    pub(crate) fn store_slot(&self, slot: usize, event: Event) {
        self.events[slot].store(event.raw(), Ordering::Release);
    }

    fn store_event(&self, slot: usize, event: Event) {
        self.store_slot(slot, event);
    }

    /// The executor of the `IssueAcross` instruction writing `slot`, if any.
    pub(crate) fn find_across_executor(
        &self,
        slot: usize,
    ) -> Option<Arc<dyn weft_core::AcrossExecutor>> {
        for slice in self.slices.iter() {
            for instruction in slice.lock().iter() {
                if let InstructionKind::IssueAcross { lhs, executor, .. } = &instruction.kind {
                    if *lhs == slot {
                        return Some(Arc::clone(executor));
                    }
                }
            }
        }
        None
    }

    /// Updates every collective barrier arrival keyed `key` with the externally agreed handle.
    pub fn set_collective_barrier(&self, key: u64, barrier: Barrier) {
        for slice in self.slices.iter() {
            for instruction in slice.lock().iter_mut() {
                if let InstructionKind::BarrierArrival {
                    barrier: slot_barrier,
                    collective_key: Some(existing),
                    ..
                } = &mut instruction.kind
                {
                    if *existing == key {
                        *slot_barrier = barrier;
                    }
                }
            }
        }
    }

    /// Applies `update` to every barrier instruction holding a generation of `old`, returning
    /// how many were rewritten.
    pub fn refresh_barrier(&self, old: Barrier, update: Barrier) -> usize {
        let mut rewritten = 0;
        for slice in self.slices.iter() {
            for instruction in slice.lock().iter_mut() {
                match &mut instruction.kind {
                    InstructionKind::BarrierArrival { barrier, collective_key: None, .. }
                    | InstructionKind::BarrierAdvance { barrier, .. } => {
                        if barrier.base() == old.base() {
                            *barrier = update;
                            rewritten += 1;
                        }
                    },
                    _ => {},
                }
            }
        }
        rewritten
    }

    /// Every barrier currently held by arrival/advance instructions.
    pub fn held_barriers(&self) -> Vec<Barrier> {
        let mut barriers = Vec::new();
        for slice in self.slices.iter() {
            for instruction in slice.lock().iter() {
                match &instruction.kind {
                    InstructionKind::BarrierArrival { barrier, collective_key: None, .. }
                    | InstructionKind::BarrierAdvance { barrier, .. } => barriers.push(*barrier),
                    _ => {},
                }
            }
        }
        barriers
    }

    // DEFERRED REDUCTION
    // --------------------------------------------------------------------------------------------

    fn begin_reduction(&self) {
        *self.pending_reduction.lock() = PendingReduction::Computing;
    }

    fn store_reduction(&self, reduced: HashMap<usize, BTreeSet<usize>>) {
        *self.pending_reduction.lock() = PendingReduction::Ready(reduced);
    }

    /// Applies a completed background transitive reduction, then re-eliminates the single-input
    /// merges the reduction produced. Runs at the top of a replay, never mid-replay.
    fn apply_pending_reduction(&self) {
        let reduced = {
            let mut pending = self.pending_reduction.lock();
            match std::mem::replace(&mut *pending, PendingReduction::None) {
                PendingReduction::Ready(reduced) => reduced,
                other => {
                    *pending = other;
                    return;
                },
            }
        };

        // Crossing slots stand in for their source slots inside foreign slices.
        let mut crossings = self.crossings.lock();
        let crossing_source: HashMap<usize, usize> =
            crossings.iter().map(|c| (c.slot, c.source)).collect();

        for slice in self.slices.iter() {
            for instruction in slice.lock().iter_mut() {
                if let InstructionKind::MergeEvent { lhs, rhs } = &mut instruction.kind {
                    let Some(allowed) = reduced.get(lhs) else {
                        continue;
                    };
                    let allowed: BTreeSet<usize> =
                        allowed.iter().map(|slot| resolve_alias(&self.aliases, *slot)).collect();
                    rhs.retain(|entry| {
                        let original = crossing_source.get(entry).copied().unwrap_or(*entry);
                        allowed.contains(&resolve_alias(&self.aliases, original))
                    });
                }
            }
        }

        // Crossing triggers whose merge users disappeared are dead; drop them so their user
        // events are no longer allocated.
        let mut still_read: BTreeSet<usize> = BTreeSet::new();
        for slice in self.slices.iter() {
            for instruction in slice.lock().iter() {
                still_read.extend(instruction.read_slots());
            }
        }
        let dead: BTreeSet<usize> = crossings
            .iter()
            .filter(|c| !still_read.contains(&c.slot))
            .map(|c| c.slot)
            .collect();
        if !dead.is_empty() {
            crossings.retain(|c| !dead.contains(&c.slot));
            for slice in self.slices.iter() {
                slice.lock().retain(|instruction| {
                    !matches!(&instruction.kind,
                        InstructionKind::TriggerEvent { lhs, .. } if dead.contains(lhs))
                });
            }
        }
        drop(crossings);

        self.relide_single_merges();
    }

    /// Re-runs single-input merge elimination after a late reduction. Merges whose slots are
    /// observed outside their own slice (crossings, frontiers, postconditions) keep their
    /// instruction; everything else is rewritten to read the source slot directly.
    fn relide_single_merges(&self) {
        let crossings = self.crossings.lock();
        let mut published: BTreeSet<usize> = crossings.iter().map(|c| c.source).collect();
        drop(crossings);
        published.extend(self.postcondition_slots.iter().copied());
        published.extend(self.frontiers.iter().map(|(src, _)| *src));

        for slice in self.slices.iter() {
            let mut slice = slice.lock();
            let mut aliases: HashMap<usize, usize> = HashMap::new();
            let mut kept: Vec<Instruction> = Vec::with_capacity(slice.len());
            for mut instruction in slice.drain(..) {
                instruction.rewrite_reads(&aliases);
                if let InstructionKind::MergeEvent { lhs, rhs } = &instruction.kind {
                    if rhs.len() == 1 && !published.contains(lhs) {
                        let source = *rhs.iter().next().expect("single element");
                        aliases.insert(*lhs, resolve_alias(&aliases, source));
                        continue;
                    }
                }
                kept.push(instruction);
            }
            *slice = kept;
        }
    }
}

// TEMPLATE REPLAY DRIVER
// ================================================================================================

impl PhysicalTemplate {
    pub(crate) fn install_compiled(&self, compiled: Arc<CompiledTemplate>) {
        *self.compiled.lock() = Some(compiled);
    }

    pub(crate) fn compiled_ref(&self) -> Arc<CompiledTemplate> {
        self.compiled
            .lock()
            .as_ref()
            .map(Arc::clone)
            .expect("template was not compiled; only replayable templates can replay")
    }

    pub(crate) fn try_compiled(&self) -> Option<Arc<CompiledTemplate>> {
        self.compiled.lock().as_ref().map(Arc::clone)
    }

    /// Spawns the background transitive reduction for a deferred compile.
    pub(crate) fn spawn_deferred_reduction(
        self: &Arc<Self>,
        snapshot: Vec<Instruction>,
        slots: usize,
    ) {
        let compiled = self.compiled_ref();
        compiled.begin_reduction();
        let target = Arc::clone(&compiled);
        self.runtime().spawn_task(
            Event::NO_EVENT,
            Box::new(move || {
                let reduced = reduce_incoming_edges(slots, &snapshot);
                target.store_reduction(reduced);
            }),
        );
    }

    /// Registers an operation arriving for the current replay and immediately replays its
    /// cached mapping decisions.
    pub fn register_operation(&self, op: Arc<dyn Operation>) {
        let tlid = op.trace_local_id();
        {
            let state = self.recording.lock();
            if let Some(mapping) = state.cached_mappings.get(&tlid) {
                op.replay_mapping_output(mapping);
            }
            if let Some(premap) = state.cached_premappings.get(&tlid) {
                op.replay_premap_output(premap);
            }
            if let Some(reservations) = state.cached_reservations.get(&tlid) {
                op.replay_reservations(reservations);
            }
        }
        let compiled = self.compiled_ref();
        compiled.operations.write().insert(tlid, op);
    }

    /// True when `op`'s position was recorded by this template.
    pub fn has_memo_entry(&self, tlid: &TraceLocalId) -> bool {
        self.recording.lock().memo_entries.contains_key(tlid)
    }

    /// Prepares the event slot array for a replay.
    ///
    /// A recurrent replay chains the previous replay's frontier values into this replay's roots
    /// and runs with no fence; a fresh replay binds the fence completion everywhere.
    pub fn initialize_replay(&self, completion: Event, recurrent: bool) {
        let compiled = self.compiled_ref();
        compiled.apply_pending_reduction();

        if let Some(sharded) = &self.sharded {
            sharded.prepare_replay(self);
        }

        let recurrent = recurrent && compiled.supports_recurrent();

        // Read every frontier source before overwriting anything; sources may themselves be
        // frontier destinations of the previous replay.
        let bindings: Vec<(usize, Event)> = if recurrent {
            compiled
                .frontiers
                .iter()
                .map(|(src, dst)| (*dst, compiled.load_event(*src)))
                .collect()
        } else {
            compiled.frontiers.iter().map(|(_, dst)| (*dst, completion)).collect()
        };
        let fence = if recurrent { Event::NO_EVENT } else { completion };
        compiled.fence_completion.store(fence.raw(), Ordering::Release);
        compiled.store_event(0, fence);
        for (dst, event) in bindings {
            compiled.store_event(dst, event);
        }

        // Fresh user events for created and crossing slots.
        let mut user_events = HashMap::new();
        for slot in compiled.user_event_slots.iter() {
            user_events.insert(*slot, self.runtime().create_user_event());
        }
        for crossing in compiled.crossings.lock().iter() {
            let user_event = self.runtime().create_user_event();
            compiled.store_event(crossing.slot, user_event.event());
            user_events.insert(crossing.slot, user_event);
        }
        *compiled.user_events.write() = user_events;

        compiled.replay_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Dispatches every slice to the replay workers and returns the replay's completion event.
    pub fn perform_replay(self: &Arc<Self>) -> Event {
        let compiled = self.compiled_ref();
        let fence = Event::from_raw(compiled.fence_completion.load(Ordering::Acquire));
        let generations = self.runtime().max_barrier_generations();
        let mut completions = Vec::with_capacity(compiled.slices.len());
        for index in 0..compiled.slices.len() {
            let slice_target = Arc::clone(&compiled);
            let forest = Arc::clone(self.forest());
            let runtime = Arc::clone(self.runtime());
            let completion = self.runtime().spawn_task(
                Event::NO_EVENT,
                Box::new(move || {
                    let operations = slice_target.operations.read();
                    let user_events = slice_target.user_events.read();
                    let ctx = ReplayContext {
                        events: &slice_target.events,
                        user_events: &*user_events,
                        operations: &*operations,
                        forest: &forest,
                        runtime: &runtime,
                        fence_completion: fence,
                    };
                    let mut slice = slice_target.slices[index].lock();
                    for instruction in slice.iter_mut() {
                        instruction.execute(&ctx, generations);
                    }
                }),
            );
            completions.push(completion);
        }
        let done = self.runtime().merge_events(&completions);
        *compiled.replay_done.lock() = done;
        done
    }

    /// Waits for the dispatched slices and returns the merged postcondition event the parent
    /// task must depend on.
    pub fn finish_replay(&self) -> Event {
        let compiled = self.compiled_ref();
        let done = *compiled.replay_done.lock();
        self.runtime().wait_for_event(done);

        // Slot values for this replay are final; publish them to subscribed shards.
        if let Some(sharded) = &self.sharded {
            sharded.arrive_on_local_frontiers(self);
        }

        let mut post_events: Vec<Event> = Vec::with_capacity(compiled.postcondition_slots.len());
        for slot in compiled.postcondition_slots.iter() {
            let event = compiled.load_event(*slot);
            if event.exists() {
                post_events.push(event);
            }
        }
        let merged = self.runtime().merge_events(&post_events);
        compiled.operations.write().clear();
        merged
    }

    // TEST SUPPORT
    // --------------------------------------------------------------------------------------------

    /// Flattened copy of every slice's instruction stream, for structural assertions.
    #[cfg(test)]
    pub(crate) fn compiled_instructions(&self) -> Vec<Vec<Instruction>> {
        let compiled = self.compiled_ref();
        compiled.slices.iter().map(|slice| slice.lock().clone()).collect()
    }

    #[cfg(test)]
    pub(crate) fn frontier_map(&self) -> Vec<(usize, usize)> {
        self.compiled_ref().frontiers().to_vec()
    }
}
