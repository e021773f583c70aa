//! The template optimization pipeline: fence elision, merge flattening, transitive reduction,
//! single-input merge elimination, dead-code elimination, parallel-replay slicing, and
//! complete-replay sinking.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use itertools::Itertools;
use weft_core::{ProcessorId, ShardId, TraceLocalId};

use super::{
    Instruction, InstructionKind, PhysicalTemplate, RecordingState,
    replay::{CompiledProgram, Crossing},
};

// PIPELINE
// ================================================================================================

/// Runs the enabled pipeline stages over the recorded instructions and produces the compiled
/// program. `state` is consumed conceptually: the instruction stream moves into the slices.
pub(super) fn compile(template: &PhysicalTemplate, state: &mut RecordingState) -> CompiledProgram {
    let config = template.config();
    let mut instructions = std::mem::take(&mut state.instructions);
    let mut slots = state.slots;
    let mut frontiers: BTreeMap<usize, usize> = BTreeMap::new();

    if config.fence_elision_enabled() {
        elide_fences(template, state, &mut instructions, &mut slots, &mut frontiers);
        propagate_merges(&mut instructions);
    }

    let mut pending_reduction = None;
    if config.optimization_enabled() {
        if config.deferred_transitive_reduction() {
            // The reduction runs on a background task over a snapshot; see
            // `CompiledTemplate::apply_pending_reduction` for the late application.
            pending_reduction = Some((instructions.clone(), slots));
        } else {
            let reduced = reduce_incoming_edges(slots, &instructions);
            apply_reduction(&mut instructions, &reduced);
        }
    }

    let mut aliases: HashMap<usize, usize> = HashMap::new();
    if config.optimization_enabled() {
        propagate_copies(&mut instructions, &mut aliases);
    }

    // Postcondition slots and frontier sources survive every pass; collect them before DCE so
    // liveness can keep their producers.
    let mut postcondition_slots: BTreeSet<usize> = BTreeSet::new();
    postcondition_slots.insert(0);
    for users in state.view_users.values() {
        for user in users {
            if user.owner_shard == template.local_shard() {
                postcondition_slots.insert(resolve_alias(&aliases, user.user));
            }
        }
    }
    for slot in state.local_last_users.iter() {
        postcondition_slots.insert(resolve_alias(&aliases, *slot));
    }

    if config.optimization_enabled() {
        let mut live_roots = postcondition_slots.clone();
        live_roots.extend(frontiers.keys().copied());
        eliminate_dead_code(&mut instructions, &live_roots);
    }

    // With optimization off the template stays fence-ordered on a single slice.
    let replay_parallelism =
        if config.optimization_enabled() { config.replay_parallelism() } else { 1 };
    let (mut slices, crossings) = slice_program(
        instructions,
        &mut slots,
        replay_parallelism,
        &state.cached_mappings_targets(),
    );

    push_complete_replays(&mut slices);

    CompiledProgram {
        slots,
        slices,
        crossings,
        frontiers,
        aliases,
        postcondition_slots,
        pending_reduction_input: pending_reduction,
        supports_recurrent: config.fence_elision_enabled(),
    }
}

impl RecordingState {
    /// First target processor per operation, for the slice-assignment heuristic.
    fn cached_mappings_targets(&self) -> HashMap<TraceLocalId, ProcessorId> {
        self.cached_mappings
            .iter()
            .filter_map(|(tlid, output)| {
                output.target_procs.first().map(|proc| (tlid.clone(), *proc))
            })
            .collect()
    }
}

// FENCE ELISION
// ================================================================================================

/// Replaces fence preconditions of copies, fills, across copies, and complete-replays with
/// merges over the last users of the views they touch. Users recorded after the consuming
/// instruction reach it through a frontier slot carrying the previous replay's value.
fn elide_fences(
    template: &PhysicalTemplate,
    state: &RecordingState,
    instructions: &mut Vec<Instruction>,
    slots: &mut usize,
    frontiers: &mut BTreeMap<usize, usize>,
) {
    let original = std::mem::take(instructions);
    // Merges are inserted in front of their consumers; reserve for the worst case.
    instructions.reserve(original.len() * 2);

    // Slot ↔ instruction index coincide during recording, so the owner of the instruction that
    // writes a slot is a direct lookup.
    let owners: Vec<TraceLocalId> = original.iter().map(|i| i.owner.clone()).collect();

    // Contents of every recorded merge that includes the fence slot, by its written slot. A
    // consumer waiting on such a merge gets a fresh merge of the non-fence inputs plus its
    // last users; the original stays untouched for any other reader.
    let mut fence_merges: HashMap<usize, BTreeSet<usize>> = HashMap::new();
    for instruction in original.iter() {
        if let (Some(lhs), InstructionKind::MergeEvent { rhs, .. }) =
            (instruction.write_slot(), &instruction.kind)
        {
            if rhs.contains(&0) {
                fence_merges.insert(lhs, rhs.iter().copied().filter(|slot| *slot != 0).collect());
            }
        }
    }

    for (index, mut instruction) in original.into_iter().enumerate() {
        let precondition = main_precondition(&instruction);
        let retained: Option<BTreeSet<usize>> = match precondition {
            Some(0) => Some(BTreeSet::new()),
            Some(slot) => fence_merges.get(&slot).cloned(),
            None => None,
        };
        if let Some(retained) = retained {
            let mut users = elision_users(template, state, &owners, index, slots, frontiers);
            if !users.is_empty() {
                // Fresh merge right in front of the consumer; every input was written earlier
                // in the stream or is bound at replay initialization.
                users.extend(retained);
                let merge_slot = *slots;
                *slots += 1;
                instructions.push(Instruction::new(
                    instruction.owner.clone(),
                    InstructionKind::MergeEvent { lhs: merge_slot, rhs: users },
                ));
                set_main_precondition(&mut instruction, merge_slot);
            }
        }
        instructions.push(instruction);
    }
}

/// The main (fence-elidable) precondition slot of an instruction.
fn main_precondition(instruction: &Instruction) -> Option<usize> {
    match &instruction.kind {
        InstructionKind::IssueCopy { precondition, .. }
        | InstructionKind::IssueFill { precondition, .. } => Some(*precondition),
        InstructionKind::IssueAcross { copy_precondition, .. } => Some(*copy_precondition),
        InstructionKind::CompleteReplay { rhs } => Some(*rhs),
        _ => None,
    }
}

fn set_main_precondition(instruction: &mut Instruction, slot: usize) {
    match &mut instruction.kind {
        InstructionKind::IssueCopy { precondition, .. }
        | InstructionKind::IssueFill { precondition, .. } => *precondition = slot,
        InstructionKind::IssueAcross { copy_precondition, .. } => *copy_precondition = slot,
        InstructionKind::CompleteReplay { rhs } => *rhs = slot,
        _ => unreachable!("no main precondition"),
    }
}

/// The slots the instruction at `index` must wait on instead of the fence: the conflicting
/// users present when it recorded, plus frontier slots for the users that recorded later (the
/// previous replay's values).
fn elision_users(
    template: &PhysicalTemplate,
    state: &RecordingState,
    owners: &[TraceLocalId],
    index: usize,
    slots: &mut usize,
    frontiers: &mut BTreeMap<usize, usize>,
) -> BTreeSet<usize> {
    let forest = template.forest();
    let local_shard = template.local_shard();
    let mut users: BTreeSet<usize> = state.elide_users.get(&index).cloned().unwrap_or_default();
    users.retain(|user| owners.get(*user) != owners.get(index));

    // Users other shards own, both those present at record time and those discovered below.
    let mut remote: Vec<(ShardId, usize)> =
        state.remote_elide_users.get(&index).cloned().unwrap_or_default();

    if let Some(accesses) = state.inst_views.get(&index) {
        for access in accesses {
            let owner_shard = forest.view_owner_shard(access.view);
            let mut wraparound: Vec<(ShardId, usize)> = Vec::new();
            if owner_shard == local_shard || template.sharded.is_none() {
                for user in state.find_last_users(
                    forest,
                    access.view,
                    access.expr,
                    &access.mask,
                    &access.usage,
                ) {
                    wraparound.push((user.owner_shard, user.user));
                }
            } else if let Some(sharded) = &template.sharded {
                // The view's owner holds the authoritative user table.
                wraparound.extend(sharded.find_remote_last_users(template, access));
            }
            for (shard, user) in wraparound {
                if shard != local_shard {
                    remote.push((shard, user));
                    continue;
                }
                if users.contains(&user) {
                    continue;
                }
                // Never wait on the owner's own slots.
                if owners.get(user) == owners.get(index) {
                    continue;
                }
                if user <= index {
                    users.insert(user);
                } else {
                    // Recorded after this instruction: only the previous replay's value can be
                    // waited on, so the edge routes through a frontier slot.
                    let frontier = *frontiers.entry(user).or_insert_with(|| {
                        let slot = *slots;
                        *slots += 1;
                        slot
                    });
                    users.insert(frontier);
                }
            }
        }
    }

    if let Some(sharded) = &template.sharded {
        // Remote users always carry previous-replay semantics: their owner republishes the slot
        // through a barrier on every replay.
        for (shard, remote_slot) in remote {
            users.insert(sharded.import_user_frontier(shard, remote_slot, slots));
        }
    }
    users
}

// MERGE PROPAGATION
// ================================================================================================

/// Flattens chains of merges feeding merges. Instructions appear in dataflow order, so a single
/// in-order pass reaches a fixpoint. Fence entries survive only where elision left them: a
/// consumer whose fence edge was re-routed already waits on a fresh merge without slot 0.
fn propagate_merges(instructions: &mut [Instruction]) {
    let mut merge_contents: HashMap<usize, BTreeSet<usize>> = HashMap::new();
    for instruction in instructions.iter_mut() {
        if let InstructionKind::MergeEvent { lhs, rhs } = &mut instruction.kind {
            let mut flattened: BTreeSet<usize> = BTreeSet::new();
            for slot in rhs.iter() {
                match merge_contents.get(slot) {
                    Some(inner) => flattened.extend(inner.iter().copied()),
                    None => {
                        flattened.insert(*slot);
                    },
                }
            }
            *rhs = flattened.clone();
            merge_contents.insert(*lhs, flattened);
        }
    }
}

// TRANSITIVE REDUCTION
// ================================================================================================

/// Computes the transitively reduced incoming-edge sets of every merge slot.
///
/// The dataflow DAG is topologically sorted (Kahn), decomposed into chains, and per-node
/// reachability is tracked as the earliest reachable position per chain; an incoming edge is
/// kept only when no other retained edge already implies it.
pub(super) fn reduce_incoming_edges(
    slots: usize,
    instructions: &[Instruction],
) -> HashMap<usize, BTreeSet<usize>> {
    // Dataflow edges: read slot → written slot.
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); slots];
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); slots];
    let mut merge_slots: Vec<usize> = Vec::new();
    for instruction in instructions {
        let Some(write) = instruction.write_slot() else {
            continue;
        };
        if matches!(instruction.kind, InstructionKind::MergeEvent { .. }) {
            merge_slots.push(write);
        }
        for read in instruction.read_slots() {
            if read == write || read >= slots {
                continue;
            }
            successors[read].push(write);
            predecessors[write].push(read);
        }
        // Trigger edges: the user event happens after its trigger source.
        if let InstructionKind::TriggerEvent { lhs, rhs } = &instruction.kind {
            if *lhs < slots && *rhs < slots && lhs != rhs {
                successors[*rhs].push(*lhs);
                predecessors[*lhs].push(*rhs);
            }
        }
    }
    for list in successors.iter_mut().chain(predecessors.iter_mut()) {
        list.sort_unstable();
        list.dedup();
    }

    // Kahn toposort.
    let mut in_degree: Vec<usize> = predecessors.iter().map(|p| p.len()).collect();
    let mut queue: VecDeque<usize> =
        (0..slots).filter(|slot| in_degree[*slot] == 0).collect();
    let mut topo_order: Vec<usize> = Vec::with_capacity(slots);
    let mut topo_pos: Vec<usize> = vec![0; slots];
    while let Some(node) = queue.pop_front() {
        topo_pos[node] = topo_order.len();
        topo_order.push(node);
        for succ in successors[node].iter() {
            in_degree[*succ] -= 1;
            if in_degree[*succ] == 0 {
                queue.push_back(*succ);
            }
        }
    }
    debug_assert_eq!(topo_order.len(), slots, "event graph has a cycle");

    // Greedy chain decomposition: extend the chain whose tail is a direct predecessor.
    let mut chain_of: Vec<usize> = vec![usize::MAX; slots];
    let mut chain_pos: Vec<usize> = vec![0; slots];
    let mut tails: Vec<usize> = Vec::new();
    for node in topo_order.iter().copied() {
        let mut assigned = false;
        for pred in predecessors[node].iter() {
            let chain = chain_of[*pred];
            if chain != usize::MAX && tails[chain] == *pred {
                chain_of[node] = chain;
                chain_pos[node] = chain_pos[*pred] + 1;
                tails[chain] = node;
                assigned = true;
                break;
            }
        }
        if !assigned {
            chain_of[node] = tails.len();
            chain_pos[node] = 0;
            tails.push(node);
        }
    }
    let chains = tails.len();

    // Earliest reachable chain position per node, in reverse topological order.
    let mut reach: Vec<Vec<usize>> = vec![Vec::new(); slots];
    for node in topo_order.iter().rev().copied() {
        let mut row = vec![usize::MAX; chains];
        row[chain_of[node]] = chain_pos[node];
        for succ in successors[node].iter() {
            for (chain, pos) in reach[*succ].iter().enumerate() {
                if *pos < row[chain] {
                    row[chain] = *pos;
                }
            }
        }
        reach[node] = row;
    }
    let reaches = |from: usize, to: usize| reach[from][chain_of[to]] <= chain_pos[to];

    let mut reduced: HashMap<usize, BTreeSet<usize>> = HashMap::new();
    for merge in merge_slots {
        // Keep the latest predecessor per chain, then drop any predecessor implied by another
        // retained one.
        let mut latest_per_chain: HashMap<usize, usize> = HashMap::new();
        for pred in predecessors[merge].iter().copied() {
            let entry = latest_per_chain.entry(chain_of[pred]).or_insert(pred);
            if chain_pos[pred] > chain_pos[*entry] {
                *entry = pred;
            }
        }
        let mut candidates: Vec<usize> = latest_per_chain.into_values().collect();
        candidates.sort_unstable_by_key(|pred| std::cmp::Reverse(topo_pos[*pred]));
        let mut kept: Vec<usize> = Vec::new();
        for candidate in candidates {
            // An incoming edge is implied when its source reaches a retained (later) source.
            if !kept.iter().any(|existing| reaches(candidate, *existing)) {
                kept.push(candidate);
            }
        }
        reduced.insert(merge, kept.into_iter().collect());
    }
    reduced
}

/// Substitutes the reduced incoming sets into the merge instructions.
pub(super) fn apply_reduction(
    instructions: &mut [Instruction],
    reduced: &HashMap<usize, BTreeSet<usize>>,
) {
    for instruction in instructions.iter_mut() {
        if let InstructionKind::MergeEvent { lhs, rhs } = &mut instruction.kind {
            if let Some(new_rhs) = reduced.get(lhs) {
                *rhs = new_rhs.clone();
            }
        }
    }
}

// SINGLE-INPUT MERGE ELIMINATION
// ================================================================================================

/// Replaces every single-input merge with a slot alias and substitutes the alias throughout.
pub(super) fn propagate_copies(
    instructions: &mut Vec<Instruction>,
    aliases: &mut HashMap<usize, usize>,
) {
    let mut kept: Vec<Instruction> = Vec::with_capacity(instructions.len());
    for mut instruction in instructions.drain(..) {
        instruction.rewrite_reads(aliases);
        if let InstructionKind::MergeEvent { lhs, rhs } = &instruction.kind {
            if rhs.len() == 1 {
                let source = *rhs.iter().next().expect("single element");
                let resolved = resolve_alias(aliases, source);
                aliases.insert(*lhs, resolved);
                continue;
            }
        }
        kept.push(instruction);
    }
    *instructions = kept;
}

pub(super) fn resolve_alias(aliases: &HashMap<usize, usize>, slot: usize) -> usize {
    let mut current = slot;
    while let Some(next) = aliases.get(&current) {
        current = *next;
    }
    current
}

// DEAD CODE ELIMINATION
// ================================================================================================

/// Removes `GetTermEvent` and `SetOpSyncEvent` instructions whose slots nothing reads.
fn eliminate_dead_code(instructions: &mut Vec<Instruction>, live_roots: &BTreeSet<usize>) {
    let mut read: BTreeSet<usize> = live_roots.clone();
    for instruction in instructions.iter() {
        read.extend(instruction.read_slots());
        if let InstructionKind::TriggerEvent { lhs, .. } = &instruction.kind {
            read.insert(*lhs);
        }
    }
    instructions.retain(|instruction| match &instruction.kind {
        InstructionKind::GetTermEvent { lhs } | InstructionKind::SetOpSyncEvent { lhs } => {
            read.contains(lhs)
        },
        _ => true,
    });
}

// PARALLEL REPLAY SLICING
// ================================================================================================

/// Partitions the instruction stream into `parallelism` slices, inserting crossing triggers for
/// every cross-slice dataflow edge.
fn slice_program(
    instructions: Vec<Instruction>,
    slots: &mut usize,
    parallelism: usize,
    targets: &HashMap<TraceLocalId, ProcessorId>,
) -> (Vec<Vec<Instruction>>, Vec<Crossing>) {
    // Slice per operation: hash by first target processor when the mapping spreads operations
    // over at least `parallelism` distinct processors, round-robin otherwise.
    let distinct = targets.values().map(|proc| proc.0).unique().count();
    let mut op_slices: HashMap<TraceLocalId, usize> = HashMap::new();
    let mut owners: BTreeSet<TraceLocalId> = BTreeSet::new();
    for instruction in instructions.iter() {
        owners.insert(instruction.owner.clone());
    }
    if distinct >= parallelism {
        for owner in owners.iter() {
            let slice = targets
                .get(owner)
                .map(|proc| (proc.0 % parallelism as u64) as usize)
                .unwrap_or(0);
            op_slices.insert(owner.clone(), slice);
        }
    } else {
        for (index, owner) in owners.iter().enumerate() {
            op_slices.insert(owner.clone(), index % parallelism);
        }
    }

    // Which slice writes each slot. The fence slot is initialized before dispatch and readable
    // everywhere, so it never needs a crossing.
    let mut slot_slice: HashMap<usize, usize> = HashMap::new();
    for instruction in instructions.iter() {
        if let Some(write) = instruction.write_slot() {
            if write != 0 {
                slot_slice.insert(write, op_slices[&instruction.owner]);
            }
        }
    }

    // Allocate one crossing slot per slot read from a foreign slice.
    let mut crossings: BTreeMap<usize, Crossing> = BTreeMap::new();
    for instruction in instructions.iter() {
        let consumer_slice = op_slices[&instruction.owner];
        for read in instruction.read_slots() {
            let Some(producer_slice) = slot_slice.get(&read) else {
                // Fence, frontier, and crossing slots are written at replay initialization and
                // are safe to read from any slice.
                continue;
            };
            if *producer_slice != consumer_slice {
                crossings.entry(read).or_insert_with(|| {
                    let crossing_slot = *slots;
                    *slots += 1;
                    Crossing { source: read, slot: crossing_slot }
                });
            }
        }
    }

    let mut slices: Vec<Vec<Instruction>> = vec![Vec::new(); parallelism];
    for mut instruction in instructions {
        let slice = op_slices[&instruction.owner];
        // Foreign reads go through the crossing slot; local reads stay direct.
        let rewrites: HashMap<usize, usize> = instruction
            .read_slots()
            .into_iter()
            .filter_map(|read| {
                let crossing = crossings.get(&read)?;
                (slot_slice.get(&read) != Some(&slice)).then_some((read, crossing.slot))
            })
            .collect();
        if !rewrites.is_empty() {
            instruction.rewrite_reads(&rewrites);
        }
        let write = instruction.write_slot();
        let owner = instruction.owner.clone();
        slices[slice].push(instruction);
        if let Some(write) = write {
            if let Some(crossing) = crossings.get(&write) {
                slices[slice].push(Instruction::new(owner, InstructionKind::TriggerEvent {
                    lhs: crossing.slot,
                    rhs: write,
                }));
            }
        }
    }

    (slices, crossings.into_values().collect())
}

// COMPLETE REPLAY SINKING
// ================================================================================================

/// Moves every `CompleteReplay` to the end of its slice, preserving relative order.
fn push_complete_replays(slices: &mut [Vec<Instruction>]) {
    for slice in slices.iter_mut() {
        let (mut rest, completes): (Vec<_>, Vec<_>) = slice
            .drain(..)
            .partition(|i| !matches!(i.kind, InstructionKind::CompleteReplay { .. }));
        rest.extend(completes);
        *slice = rest;
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use weft_core::TraceLocalId;

    use super::*;

    fn merge(lhs: usize, rhs: &[usize]) -> Instruction {
        Instruction::new(TraceLocalId::new(lhs as u64), InstructionKind::MergeEvent {
            lhs,
            rhs: rhs.iter().copied().collect(),
        })
    }

    fn source(lhs: usize) -> Instruction {
        Instruction::new(TraceLocalId::new(lhs as u64), InstructionKind::GetTermEvent { lhs })
    }

    #[test]
    fn transitive_reduction_prunes_implied_edges() {
        // Edges: 1→2, 2→3, 1→3, 1→4, 3→4, 2→4.
        let instructions = vec![
            source(1),
            merge(2, &[1]),
            merge(3, &[1, 2]),
            merge(4, &[1, 2, 3]),
        ];
        let reduced = reduce_incoming_edges(5, &instructions);

        assert_eq!(reduced[&4], BTreeSet::from([3]));
        assert_eq!(reduced[&3], BTreeSet::from([2]));
        assert_eq!(reduced[&2], BTreeSet::from([1]));
    }

    #[test]
    fn reduction_preserves_reachability() {
        // A diamond with a long tail: 1→{2,3}, {2,3}→4, 4→5.
        let instructions = vec![
            source(1),
            merge(2, &[1]),
            merge(3, &[1]),
            merge(4, &[1, 2, 3]),
            merge(5, &[1, 2, 3, 4]),
        ];
        let reduced = reduce_incoming_edges(6, &instructions);

        // Node 4 keeps both diamond arms but not the implied edge from 1.
        assert_eq!(reduced[&4], BTreeSet::from([2, 3]));
        assert_eq!(reduced[&5], BTreeSet::from([4]));
    }

    #[test]
    fn single_input_merges_collapse_to_aliases() {
        let mut instructions = vec![
            source(1),
            merge(2, &[1]),
            merge(3, &[2]),
            Instruction::new(TraceLocalId::new(9), InstructionKind::IssueFill {
                lhs: 4,
                expr: weft_core::ExprId(1),
                dst_fields: vec![],
                fill_value: vec![0],
                precondition: 3,
            }),
        ];
        let mut aliases = HashMap::new();
        propagate_copies(&mut instructions, &mut aliases);

        assert_eq!(instructions.len(), 2);
        assert_eq!(resolve_alias(&aliases, 3), 1);
        match &instructions[1].kind {
            InstructionKind::IssueFill { precondition, .. } => assert_eq!(*precondition, 1),
            other => panic!("unexpected instruction {other}"),
        }
    }
}
