use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use smallvec::SmallVec;
use weft_core::{
    AcrossExecutor, Barrier, CopySrcDstField, Event, ExprId, Operation, RegionForest,
    ReservationId, RuntimeTransport, TraceLocalId, UserEvent,
};

// REPLAY CONTEXT
// ================================================================================================

/// Everything one replay slice needs to execute instructions.
///
/// `events` is written with release stores and read with acquire loads; the slicing pass
/// guarantees a single writer per slot per replay, with all cross-slice reads routed through
/// pre-allocated crossing user events.
pub(crate) struct ReplayContext<'a> {
    pub events: &'a [AtomicU64],
    pub user_events: &'a HashMap<usize, UserEvent>,
    pub operations: &'a HashMap<TraceLocalId, Arc<dyn Operation>>,
    pub forest: &'a Arc<dyn RegionForest>,
    pub runtime: &'a Arc<dyn RuntimeTransport>,
    pub fence_completion: Event,
}

impl ReplayContext<'_> {
    pub fn get(&self, slot: usize) -> Event {
        Event::from_raw(self.events[slot].load(Ordering::Acquire))
    }

    pub fn set(&self, slot: usize, event: Event) {
        self.events[slot].store(event.raw(), Ordering::Release);
    }

    fn operation(&self, owner: &TraceLocalId) -> &Arc<dyn Operation> {
        self.operations
            .get(owner)
            .unwrap_or_else(|| panic!("{owner} was not registered before replay"))
    }

    fn user_event(&self, slot: usize) -> UserEvent {
        *self
            .user_events
            .get(&slot)
            .unwrap_or_else(|| panic!("no user event allocated for slot {slot}"))
    }
}

// INSTRUCTION
// ================================================================================================

/// One node of a compiled replay program: an owner operation plus the action to perform.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub owner: TraceLocalId,
    pub kind: InstructionKind,
}

/// The action of an [`Instruction`]. `lhs`/`rhs` name event slots.
#[derive(Clone)]
pub enum InstructionKind {
    /// `events[lhs] = owner.completion_event()`
    GetTermEvent { lhs: usize },
    /// `events[lhs] = user_events[lhs]`
    CreateApUserEvent { lhs: usize },
    /// `trigger(user_events[lhs], events[rhs])`
    TriggerEvent { lhs: usize, rhs: usize },
    /// `events[lhs] = merge(events[s] for s in rhs)`
    MergeEvent { lhs: usize, rhs: BTreeSet<usize> },
    /// `events[lhs] = fence_completion`
    AssignFenceCompletion { lhs: usize },
    /// `events[lhs] = issue_copy(expr, …, pre = events[precondition])`
    IssueCopy {
        lhs: usize,
        expr: ExprId,
        src_fields: Vec<CopySrcDstField>,
        dst_fields: Vec<CopySrcDstField>,
        reservations: Vec<(ReservationId, bool)>,
        precondition: usize,
    },
    /// `events[lhs] = issue_fill(expr, …, pre = events[precondition])`
    IssueFill {
        lhs: usize,
        expr: ExprId,
        dst_fields: Vec<CopySrcDstField>,
        fill_value: Vec<u8>,
        precondition: usize,
    },
    /// `events[lhs] = executor.execute(events[copy_pre], …)`
    IssueAcross {
        lhs: usize,
        executor: Arc<dyn AcrossExecutor>,
        copy_precondition: usize,
        collective_precondition: Option<usize>,
        src_indirect_precondition: Option<usize>,
        dst_indirect_precondition: Option<usize>,
    },
    /// `events[lhs] = owner.sync_precondition()`
    SetOpSyncEvent { lhs: usize },
    /// `owner.set_effects_postcondition(events[rhs])`
    SetEffects { rhs: usize },
    /// `owner.complete_replay(events[rhs])`
    CompleteReplay { rhs: usize },
    /// `arrive(barrier, arrivals, events[rhs]); events[lhs] = barrier; advance unless collective`
    BarrierArrival {
        lhs: usize,
        rhs: usize,
        barrier: Barrier,
        arrivals: u32,
        /// Set when the barrier is a collective one named by all shards; the handle is supplied
        /// externally before each replay and never advanced here.
        collective_key: Option<u64>,
    },
    /// `events[lhs] = barrier; advance`
    BarrierAdvance { lhs: usize, barrier: Barrier },
}

impl Instruction {
    pub fn new(owner: TraceLocalId, kind: InstructionKind) -> Self {
        Self { owner, kind }
    }

    /// The slot this instruction writes, if any.
    pub fn write_slot(&self) -> Option<usize> {
        match &self.kind {
            InstructionKind::GetTermEvent { lhs }
            | InstructionKind::CreateApUserEvent { lhs }
            | InstructionKind::MergeEvent { lhs, .. }
            | InstructionKind::AssignFenceCompletion { lhs }
            | InstructionKind::IssueCopy { lhs, .. }
            | InstructionKind::IssueFill { lhs, .. }
            | InstructionKind::IssueAcross { lhs, .. }
            | InstructionKind::SetOpSyncEvent { lhs }
            | InstructionKind::BarrierArrival { lhs, .. }
            | InstructionKind::BarrierAdvance { lhs, .. } => Some(*lhs),
            InstructionKind::TriggerEvent { .. }
            | InstructionKind::SetEffects { .. }
            | InstructionKind::CompleteReplay { .. } => None,
        }
    }

    /// The slots this instruction reads.
    pub fn read_slots(&self) -> SmallVec<[usize; 4]> {
        let mut reads = SmallVec::new();
        match &self.kind {
            InstructionKind::GetTermEvent { .. }
            | InstructionKind::CreateApUserEvent { .. }
            | InstructionKind::AssignFenceCompletion { .. }
            | InstructionKind::SetOpSyncEvent { .. }
            | InstructionKind::BarrierAdvance { .. } => {},
            InstructionKind::TriggerEvent { rhs, .. }
            | InstructionKind::SetEffects { rhs }
            | InstructionKind::CompleteReplay { rhs }
            | InstructionKind::BarrierArrival { rhs, .. } => reads.push(*rhs),
            InstructionKind::MergeEvent { rhs, .. } => reads.extend(rhs.iter().copied()),
            InstructionKind::IssueCopy { precondition, .. }
            | InstructionKind::IssueFill { precondition, .. } => reads.push(*precondition),
            InstructionKind::IssueAcross {
                copy_precondition,
                collective_precondition,
                src_indirect_precondition,
                dst_indirect_precondition,
                ..
            } => {
                reads.push(*copy_precondition);
                reads.extend(collective_precondition.iter().copied());
                reads.extend(src_indirect_precondition.iter().copied());
                reads.extend(dst_indirect_precondition.iter().copied());
            },
        }
        reads
    }

    /// Substitutes slot reads according to `rewrites` (old slot → new slot).
    pub fn rewrite_reads(&mut self, rewrites: &HashMap<usize, usize>) {
        let rewrite = |slot: &mut usize| {
            if let Some(new) = rewrites.get(slot) {
                *slot = *new;
            }
        };
        match &mut self.kind {
            InstructionKind::GetTermEvent { .. }
            | InstructionKind::CreateApUserEvent { .. }
            | InstructionKind::AssignFenceCompletion { .. }
            | InstructionKind::SetOpSyncEvent { .. }
            | InstructionKind::BarrierAdvance { .. } => {},
            InstructionKind::TriggerEvent { rhs, .. }
            | InstructionKind::SetEffects { rhs }
            | InstructionKind::CompleteReplay { rhs }
            | InstructionKind::BarrierArrival { rhs, .. } => rewrite(rhs),
            InstructionKind::MergeEvent { rhs, .. } => {
                let rewritten: BTreeSet<usize> =
                    rhs.iter().map(|s| rewrites.get(s).copied().unwrap_or(*s)).collect();
                *rhs = rewritten;
            },
            InstructionKind::IssueCopy { precondition, .. }
            | InstructionKind::IssueFill { precondition, .. } => rewrite(precondition),
            InstructionKind::IssueAcross {
                copy_precondition,
                collective_precondition,
                src_indirect_precondition,
                dst_indirect_precondition,
                ..
            } => {
                rewrite(copy_precondition);
                if let Some(slot) = collective_precondition {
                    rewrite(slot);
                }
                if let Some(slot) = src_indirect_precondition {
                    rewrite(slot);
                }
                if let Some(slot) = dst_indirect_precondition {
                    rewrite(slot);
                }
            },
        }
    }

    /// Executes the instruction against the replay context.
    ///
    /// Takes `&mut self` because barrier instructions advance their generation in place;
    /// everything else is read-only.
    pub(crate) fn execute(&mut self, ctx: &ReplayContext<'_>, barrier_generations: u32) {
        match &mut self.kind {
            InstructionKind::GetTermEvent { lhs } => {
                let completion = ctx.operation(&self.owner).completion_event();
                ctx.set(*lhs, completion);
            },
            InstructionKind::CreateApUserEvent { lhs } => {
                ctx.set(*lhs, ctx.user_event(*lhs).event());
            },
            InstructionKind::TriggerEvent { lhs, rhs } => {
                ctx.runtime.trigger_user_event(ctx.user_event(*lhs), ctx.get(*rhs));
            },
            InstructionKind::MergeEvent { lhs, rhs } => {
                let inputs: Vec<Event> = rhs.iter().map(|slot| ctx.get(*slot)).collect();
                ctx.set(*lhs, ctx.runtime.merge_events(&inputs));
            },
            InstructionKind::AssignFenceCompletion { lhs } => {
                ctx.set(*lhs, ctx.fence_completion);
            },
            InstructionKind::IssueCopy {
                lhs,
                expr,
                src_fields,
                dst_fields,
                reservations,
                precondition,
            } => {
                let completion = ctx.forest.issue_copy(
                    *expr,
                    src_fields,
                    dst_fields,
                    reservations,
                    ctx.get(*precondition),
                );
                ctx.set(*lhs, completion);
            },
            InstructionKind::IssueFill { lhs, expr, dst_fields, fill_value, precondition } => {
                let completion =
                    ctx.forest.issue_fill(*expr, dst_fields, fill_value, ctx.get(*precondition));
                ctx.set(*lhs, completion);
            },
            InstructionKind::IssueAcross {
                lhs,
                executor,
                copy_precondition,
                collective_precondition,
                src_indirect_precondition,
                dst_indirect_precondition,
            } => {
                let slot_event =
                    |slot: &Option<usize>| slot.map(|s| ctx.get(s)).unwrap_or(Event::NO_EVENT);
                let completion = executor.execute(
                    ctx.get(*copy_precondition),
                    slot_event(collective_precondition),
                    slot_event(src_indirect_precondition),
                    slot_event(dst_indirect_precondition),
                );
                ctx.set(*lhs, completion);
            },
            InstructionKind::SetOpSyncEvent { lhs } => {
                let sync = ctx.operation(&self.owner).sync_precondition();
                ctx.set(*lhs, sync);
            },
            InstructionKind::SetEffects { rhs } => {
                ctx.operation(&self.owner).set_effects_postcondition(ctx.get(*rhs));
            },
            InstructionKind::CompleteReplay { rhs } => {
                ctx.operation(&self.owner).complete_replay(ctx.get(*rhs));
            },
            InstructionKind::BarrierArrival { lhs, rhs, barrier, arrivals, collective_key } => {
                ctx.runtime.arrive_barrier(*barrier, *arrivals, ctx.get(*rhs));
                ctx.set(*lhs, barrier.event());
                if collective_key.is_none() {
                    // At the generation limit the barrier stays put; the refresh pass replaces
                    // it before the next replay dispatch.
                    if let Some(advanced) = barrier.advanced(barrier_generations) {
                        *barrier = advanced;
                    }
                }
            },
            InstructionKind::BarrierAdvance { lhs, barrier } => {
                ctx.set(*lhs, barrier.event());
                if let Some(advanced) = barrier.advanced(barrier_generations) {
                    *barrier = advanced;
                }
            },
        }
    }
}

impl fmt::Debug for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.owner)
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstructionKind::GetTermEvent { lhs } => {
                write!(f, "events[{lhs}] = term_event")
            },
            InstructionKind::CreateApUserEvent { lhs } => {
                write!(f, "events[{lhs}] = create_user_event()")
            },
            InstructionKind::TriggerEvent { lhs, rhs } => {
                write!(f, "trigger(events[{lhs}], events[{rhs}])")
            },
            InstructionKind::MergeEvent { lhs, rhs } => {
                write!(f, "events[{lhs}] = merge(")?;
                for (i, slot) in rhs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "events[{slot}]")?;
                }
                write!(f, ")")
            },
            InstructionKind::AssignFenceCompletion { lhs } => {
                write!(f, "events[{lhs}] = fence_completion")
            },
            InstructionKind::IssueCopy { lhs, expr, precondition, .. } => {
                write!(f, "events[{lhs}] = copy(x{}, pre=events[{precondition}])", expr.0)
            },
            InstructionKind::IssueFill { lhs, expr, precondition, .. } => {
                write!(f, "events[{lhs}] = fill(x{}, pre=events[{precondition}])", expr.0)
            },
            InstructionKind::IssueAcross { lhs, copy_precondition, .. } => {
                write!(f, "events[{lhs}] = copy_across(pre=events[{copy_precondition}])")
            },
            InstructionKind::SetOpSyncEvent { lhs } => {
                write!(f, "events[{lhs}] = op_sync_event")
            },
            InstructionKind::SetEffects { rhs } => {
                write!(f, "set_effects(events[{rhs}])")
            },
            InstructionKind::CompleteReplay { rhs } => {
                write!(f, "complete_replay(events[{rhs}])")
            },
            InstructionKind::BarrierArrival { lhs, rhs, barrier, arrivals, collective_key } => {
                write!(
                    f,
                    "events[{lhs}] = arrive({barrier}, {arrivals}, events[{rhs}]{})",
                    if collective_key.is_some() { ", collective" } else { "" }
                )
            },
            InstructionKind::BarrierAdvance { lhs, barrier } => {
                write!(f, "events[{lhs}] = advance({barrier})")
            },
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn owner(index: u64) -> TraceLocalId {
        TraceLocalId::new(index)
    }

    #[test]
    fn display_renders_the_program_shape() {
        let merge = Instruction::new(
            owner(1),
            InstructionKind::MergeEvent { lhs: 4, rhs: BTreeSet::from([1, 3]) },
        );
        assert_eq!(merge.to_string(), "events[4] = merge(events[1],events[3]) (op[1])");

        let fence = Instruction::new(owner(0), InstructionKind::AssignFenceCompletion { lhs: 0 });
        assert_eq!(fence.to_string(), "events[0] = fence_completion (op[0])");
    }

    #[test]
    fn read_write_slots() {
        let copy = Instruction::new(
            owner(2),
            InstructionKind::IssueCopy {
                lhs: 5,
                expr: ExprId(1),
                src_fields: vec![],
                dst_fields: vec![],
                reservations: vec![],
                precondition: 3,
            },
        );
        assert_eq!(copy.write_slot(), Some(5));
        assert_eq!(copy.read_slots().as_slice(), &[3]);

        let trigger = Instruction::new(owner(2), InstructionKind::TriggerEvent { lhs: 7, rhs: 5 });
        assert_eq!(trigger.write_slot(), None);
        assert_eq!(trigger.read_slots().as_slice(), &[5]);
    }

    #[test]
    fn rewrite_reads_substitutes_merge_inputs() {
        let mut merge = Instruction::new(
            owner(1),
            InstructionKind::MergeEvent { lhs: 9, rhs: BTreeSet::from([2, 4, 6]) },
        );
        let rewrites = HashMap::from([(4, 11), (6, 2)]);
        merge.rewrite_reads(&rewrites);
        match merge.kind {
            InstructionKind::MergeEvent { rhs, .. } => {
                assert_eq!(rhs, BTreeSet::from([2, 11]));
            },
            _ => unreachable!(),
        }
    }
}
