//! Control-replication extension of the physical template: cross-shard event naming, frontier
//! barriers, collective barriers, and the all-shards replayable vote.
//!
//! Every event slot is authoritative on exactly one shard. A shard that needs another shard's
//! slot value imports it through a barrier: the owner arrives on the barrier with the slot's
//! value every replay, the importer reads the barrier's generation event. Barriers support a
//! bounded number of generations, so owners refresh them and notify subscribed shards before
//! the bound is reached.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use weft_core::{
    Barrier, Event, RequestId, ShardExchange, ShardId, ShardMessageHandler, TemplateIndex,
    TraceShardMessage, Usage, ViewId, ViewUser,
};

use crate::{
    errors::{NotReplayableReason, Replayable},
    options::TraceConfig,
    template::{InstructionKind, PhysicalTemplate, RecordingState, ViewAccess},
};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

// SHARDED EXTENSION
// ================================================================================================

/// Per-template sharding state. Lives inside a [`PhysicalTemplate`] and is guarded by its own
/// lock so message handlers never contend with the template lock unless they must touch
/// recording state.
pub struct ShardedExtension {
    exchange: Arc<dyn ShardExchange>,
    template_index: TemplateIndex,
    local_shard: ShardId,
    /// Back-reference for deferring contended message handling to a meta-task.
    owner: Mutex<Weak<PhysicalTemplate>>,
    state: Mutex<ShardedState>,
    response_cv: Condvar,
}

#[derive(Default)]
struct ShardedState {
    next_request: u64,
    /// Outstanding recording-time event imports: request → placeholder instruction slot.
    pending_event_imports: HashMap<RequestId, usize>,
    event_import_results: HashMap<RequestId, Barrier>,
    /// `(owner shard, remote slot)` → local slot, so repeated imports share a binding.
    imported_user_slots: HashMap<(ShardId, usize), usize>,
    /// Barriers bound to local slots at the start of every replay.
    remote_frontiers: Vec<(Barrier, usize)>,
    /// Owner side: local slots republished through a barrier each replay.
    local_frontiers: BTreeMap<usize, Barrier>,
    local_subscriptions: BTreeMap<usize, BTreeSet<ShardId>>,
    /// Owner side: subscribers of barriers handed out for recording-time event imports.
    import_subscriptions: HashMap<Event, BTreeSet<ShardId>>,
    frontier_results: HashMap<RequestId, Barrier>,
    last_users_results: HashMap<RequestId, Vec<(ShardId, usize)>>,
    read_only_results: HashMap<RequestId, bool>,
    /// Lock-free copy of the view-user table for answering peers during finalization.
    view_users_snapshot: BTreeMap<ViewId, Vec<ViewUser>>,
    /// Externally supplied collective barriers, keyed as recorded.
    collective_barriers: HashMap<u64, Barrier>,
}

impl ShardedExtension {
    fn new(exchange: Arc<dyn ShardExchange>, template_index: TemplateIndex) -> Self {
        let local_shard = exchange.local_shard();
        Self {
            exchange,
            template_index,
            local_shard,
            owner: Mutex::new(Weak::new()),
            state: Mutex::new(ShardedState::default()),
            response_cv: Condvar::new(),
        }
    }

    fn next_request(&self) -> RequestId {
        let mut state = self.state.lock();
        state.next_request += 1;
        RequestId(state.next_request)
    }

    fn owner_template(&self) -> Option<Arc<PhysicalTemplate>> {
        self.owner.lock().upgrade()
    }

    pub(crate) fn unregister(&self, _template: &PhysicalTemplate) {
        self.exchange.unregister_template(self.template_index);
    }

    // RECORDING-TIME EVENT IMPORTS
    // --------------------------------------------------------------------------------------------

    /// Imports an event created by another shard while recording: a placeholder
    /// `BarrierAdvance` takes a fresh slot, and the owner is asked to publish the event through
    /// a single-arrival barrier. The barrier lands via [`ShardedExtension::wait_pending_imports`]
    /// once the recording call has released the template lock.
    pub(crate) fn import_remote_event(&self, state: &mut RecordingState, event: Event) -> usize {
        let slot = state.allocate_slot();
        state.instructions.push(crate::template::Instruction::new(
            state.instructions[0].owner.clone(),
            InstructionKind::BarrierAdvance { lhs: slot, barrier: Barrier::NO_BARRIER },
        ));
        state.event_map.insert(event, slot);

        let request = self.next_request();
        self.state.lock().pending_event_imports.insert(request, slot);
        self.exchange.post(event.creator_shard(), TraceShardMessage::FindEventRequest {
            template: self.template_index,
            request,
            event,
            asker: self.local_shard,
        });
        slot
    }

    /// Blocks until every outstanding event import has a response, filling the placeholder
    /// instructions. Must be called without the template lock held.
    pub(crate) fn wait_pending_imports(&self, template: &PhysicalTemplate) {
        loop {
            let completed = {
                let mut state = self.state.lock();
                if state.pending_event_imports.is_empty() {
                    return;
                }
                let ready: Vec<RequestId> = state
                    .pending_event_imports
                    .keys()
                    .filter(|request| state.event_import_results.contains_key(request))
                    .copied()
                    .collect();
                if ready.is_empty() {
                    if self
                        .response_cv
                        .wait_for(&mut state, RESPONSE_TIMEOUT)
                        .timed_out()
                    {
                        panic!("timed out waiting for remote event names");
                    }
                    continue;
                }
                ready
                    .into_iter()
                    .map(|request| {
                        let slot = state.pending_event_imports.remove(&request).expect("pending");
                        let barrier =
                            state.event_import_results.remove(&request).expect("result");
                        (slot, barrier)
                    })
                    .collect::<Vec<_>>()
            };
            let mut recording = template.recording_state();
            for (slot, barrier) in completed {
                if barrier.exists() {
                    recording.instructions[slot].kind =
                        InstructionKind::BarrierAdvance { lhs: slot, barrier };
                } else {
                    // The owner has no record of the event: it predates both traces, so the
                    // placeholder degrades to the fence value and later collapses away.
                    recording.instructions[slot].kind =
                        InstructionKind::MergeEvent { lhs: slot, rhs: BTreeSet::from([0]) };
                }
            }
        }
    }

    // VIEW USERS ACROSS SHARDS
    // --------------------------------------------------------------------------------------------

    /// Sends a view user recorded against a remotely owned view to the owner shard, and keeps
    /// the slot locally so this shard's replay postconditions still cover it until the owner
    /// confirms the surviving set.
    pub(crate) fn forward_view_user(
        &self,
        state: &mut RecordingState,
        view: ViewId,
        user: ViewUser,
    ) {
        state.local_last_users.insert(user.user);
        let owner = user.owner_shard;
        debug_assert_eq!(owner, self.local_shard, "forwarded users carry the recording shard");
        let destination = self.view_owner(view);
        self.exchange.post(destination, TraceShardMessage::UpdateViewUser {
            template: self.template_index,
            view,
            user,
        });
    }

    fn view_owner(&self, view: ViewId) -> ShardId {
        self.owner_template()
            .map(|template| template.forest().view_owner_shard(view))
            .unwrap_or(self.local_shard)
    }

    /// Snapshots the view-user table and tells every shard which of its forwarded users
    /// survived the conflict filter. Runs at the start of finalization, before the replayable
    /// exchange.
    pub(crate) fn publish_last_users(&self, state: &RecordingState) {
        self.state.lock().view_users_snapshot = state.view_users.clone();

        let mut per_shard: BTreeMap<ShardId, Vec<usize>> = BTreeMap::new();
        for users in state.view_users.values() {
            for user in users {
                if user.owner_shard != self.local_shard {
                    per_shard.entry(user.owner_shard).or_default().push(user.user);
                }
            }
        }
        for (shard, slots) in per_shard {
            self.exchange.post(shard, TraceShardMessage::UpdateLastUsers {
                template: self.template_index,
                slots,
            });
        }
    }

    /// Asks the owner of `access.view` for the last users conflicting with the access.
    pub(crate) fn find_remote_last_users(
        &self,
        template: &PhysicalTemplate,
        access: &ViewAccess,
    ) -> Vec<(ShardId, usize)> {
        let owner = template.forest().view_owner_shard(access.view);
        if owner == self.local_shard {
            return Vec::new();
        }
        let request = self.next_request();
        self.exchange.post(owner, TraceShardMessage::FindLastUsersRequest {
            template: self.template_index,
            request,
            view: access.view,
            expr: access.expr,
            mask: access.mask,
            usage: access.usage,
            asker: self.local_shard,
        });
        self.wait_response(request, |state, request| state.last_users_results.remove(request))
    }

    /// Asks the owner of `access.view` whether every recorded user is read-only.
    pub(crate) fn remote_users_read_only(
        &self,
        template: &PhysicalTemplate,
        access: &ViewAccess,
    ) -> bool {
        let owner = template.forest().view_owner_shard(access.view);
        let request = self.next_request();
        self.exchange.post(owner, TraceShardMessage::ReadOnlyUsersRequest {
            template: self.template_index,
            request,
            view: access.view,
            expr: access.expr,
            mask: access.mask,
            asker: self.local_shard,
        });
        self.wait_response(request, |state, request| state.read_only_results.remove(request))
    }

    /// Imports the value of a remote slot as a locally bound frontier barrier, allocating the
    /// local slot from the optimizer's slot counter. Repeated imports of the same remote slot
    /// share one binding.
    pub(crate) fn import_user_frontier(
        &self,
        shard: ShardId,
        remote_slot: usize,
        slots: &mut usize,
    ) -> usize {
        if let Some(existing) = self.state.lock().imported_user_slots.get(&(shard, remote_slot))
        {
            return *existing;
        }
        let request = self.next_request();
        self.exchange.post(shard, TraceShardMessage::FindFrontierRequest {
            template: self.template_index,
            request,
            slot: remote_slot,
            asker: self.local_shard,
        });
        let barrier =
            self.wait_response(request, |state, request| state.frontier_results.remove(request));
        let local_slot = *slots;
        *slots += 1;
        let mut state = self.state.lock();
        state.imported_user_slots.insert((shard, remote_slot), local_slot);
        state.remote_frontiers.push((barrier, local_slot));
        local_slot
    }

    // REPLAYABLE EXCHANGE
    // --------------------------------------------------------------------------------------------

    /// All-reduces the local verdict; a locally replayable template is demoted when any peer
    /// shard vetoes.
    pub(crate) fn exchange_replayable(&self, local: Replayable) -> Replayable {
        let vote = matches!(local, Replayable::Yes);
        let all = self.exchange.exchange_replayable(vote);
        match (vote, all) {
            (_, true) => Replayable::Yes,
            (true, false) => Replayable::No(NotReplayableReason::RemoteShardFailed),
            (false, false) => local,
        }
    }

    // REPLAY HOOKS
    // --------------------------------------------------------------------------------------------

    /// Prepares a replay: refreshes exhausted barriers we own, blocks until peers refresh the
    /// ones they own, binds remote frontier barriers into their slots, and installs collective
    /// barriers supplied for this replay.
    pub(crate) fn prepare_replay(&self, template: &PhysicalTemplate) {
        let limit = template.runtime().max_barrier_generations();
        let compiled = template.compiled_ref();

        // Refresh owned frontier barriers that ran out of generations.
        let refreshes: Vec<(usize, Barrier, Barrier, BTreeSet<ShardId>)> = {
            let mut state = self.state.lock();
            let mut refreshes = Vec::new();
            for (slot, barrier) in state.local_frontiers.iter() {
                if barrier.advanced(limit).is_none() {
                    let fresh = template.runtime().create_barrier(1);
                    let subscribers =
                        state.local_subscriptions.get(slot).cloned().unwrap_or_default();
                    refreshes.push((*slot, *barrier, fresh, subscribers));
                }
            }
            for (slot, _, fresh, _) in refreshes.iter() {
                state.local_frontiers.insert(*slot, *fresh);
            }
            refreshes
        };
        for (_, old, fresh, subscribers) in refreshes {
            template.runtime().destroy_barrier(old);
            for shard in subscribers {
                self.exchange.post(shard, TraceShardMessage::FrontierBarrierRefresh {
                    template: self.template_index,
                    old,
                    new: fresh,
                });
            }
        }

        // Refresh owned import barriers held by peer templates' BarrierAdvance instructions.
        let owned_exhausted: Vec<(Barrier, BTreeSet<ShardId>)> = {
            let state = self.state.lock();
            state
                .import_subscriptions
                .iter()
                .filter_map(|(base, subscribers)| {
                    let held = compiled
                        .held_barriers()
                        .into_iter()
                        .find(|b| b.base() == *base && b.advanced(limit).is_none())?;
                    Some((held, subscribers.clone()))
                })
                .collect()
        };
        for (old, subscribers) in owned_exhausted {
            let fresh = template.runtime().create_barrier(old.total_arrivals());
            compiled.refresh_barrier(old, fresh);
            template.runtime().destroy_barrier(old);
            let mut state = self.state.lock();
            let subs = state.import_subscriptions.remove(&old.base()).unwrap_or_default();
            state.import_subscriptions.insert(fresh.base(), subs);
            drop(state);
            for shard in subscribers {
                self.exchange.post(shard, TraceShardMessage::FrontierBarrierRefresh {
                    template: self.template_index,
                    old,
                    new: fresh,
                });
            }
        }

        // Block until every foreign barrier we hold has generations left; peers refresh them.
        {
            let mut state = self.state.lock();
            loop {
                let mut stuck = false;
                for (barrier, _) in state.remote_frontiers.iter() {
                    if barrier.exists()
                        && barrier.event().creator_shard() != self.local_shard
                        && barrier.advanced(limit).is_none()
                    {
                        stuck = true;
                    }
                }
                for barrier in compiled.held_barriers() {
                    if barrier.exists()
                        && barrier.event().creator_shard() != self.local_shard
                        && barrier.advanced(limit).is_none()
                    {
                        stuck = true;
                    }
                }
                if !stuck {
                    break;
                }
                debug!(target: "weft::trace::sharded", "waiting for frontier barrier refresh");
                if self
                    .response_cv
                    .wait_for(&mut state, RESPONSE_TIMEOUT)
                    .timed_out()
                {
                    panic!("timed out waiting for barrier refresh");
                }
            }
        }

        // Bind remote frontiers and advance their barriers for the next replay.
        {
            let mut state = self.state.lock();
            for (barrier, slot) in state.remote_frontiers.iter_mut() {
                if !barrier.exists() {
                    continue;
                }
                compiled.store_slot(*slot, barrier.event());
                if let Some(advanced) = barrier.advanced(limit) {
                    *barrier = advanced;
                }
            }
            for (key, barrier) in state.collective_barriers.iter() {
                compiled.set_collective_barrier(*key, *barrier);
            }
        }
    }

    /// Publishes the local frontier slots: arrives on each owned barrier with the slot's value
    /// for the finished replay, then advances the barrier. Runs once the slices have completed
    /// so the slot values are final.
    pub(crate) fn arrive_on_local_frontiers(&self, template: &PhysicalTemplate) {
        let limit = template.runtime().max_barrier_generations();
        let compiled = template.compiled_ref();
        let mut state = self.state.lock();
        let slots: Vec<usize> = state.local_frontiers.keys().copied().collect();
        for slot in slots {
            let barrier = state.local_frontiers[&slot];
            let value = compiled.load_event(slot);
            template.runtime().arrive_barrier(barrier, 1, value);
            if let Some(advanced) = barrier.advanced(limit) {
                state.local_frontiers.insert(slot, advanced);
            }
        }
    }

    /// Records an arrival on a collective barrier named identically by every shard; the handle
    /// for each replay is supplied externally under `key`.
    pub(crate) fn set_collective_barrier(&self, key: u64, barrier: Barrier) {
        self.state.lock().collective_barriers.insert(key, barrier);
    }

    /// Installs a replacement collective barrier locally and broadcasts it to every peer.
    pub(crate) fn broadcast_collective_refresh(&self, key: u64, barrier: Barrier) {
        self.set_collective_barrier(key, barrier);
        for shard in 0..self.exchange.shard_count() {
            let shard = ShardId(shard as u32);
            if shard != self.local_shard {
                self.exchange.post(shard, TraceShardMessage::TemplateBarrierRefresh {
                    template: self.template_index,
                    key,
                    barrier,
                });
            }
        }
    }

    // RESPONSE PLUMBING
    // --------------------------------------------------------------------------------------------

    fn wait_response<T>(
        &self,
        request: RequestId,
        mut take: impl FnMut(&mut ShardedState, &RequestId) -> Option<T>,
    ) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = take(&mut state, &request) {
                return result;
            }
            if self
                .response_cv
                .wait_for(&mut state, RESPONSE_TIMEOUT)
                .timed_out()
            {
                panic!("timed out waiting for shard response {request:?}");
            }
        }
    }
}

// MESSAGE HANDLING
// ================================================================================================

impl PhysicalTemplate {
    /// Creates a control-replicated template and registers it with the shard exchange.
    pub fn new_sharded(
        forest: Arc<dyn weft_core::RegionForest>,
        runtime: Arc<dyn weft_core::RuntimeTransport>,
        config: TraceConfig,
        fence_owner: weft_core::TraceLocalId,
        exchange: Arc<dyn ShardExchange>,
        template_index: TemplateIndex,
    ) -> Arc<Self> {
        let local_shard = exchange.local_shard();
        let extension = ShardedExtension::new(Arc::clone(&exchange), template_index);
        let template =
            Self::with_extension(forest, runtime, config, fence_owner, local_shard, extension);
        *template.sharded.as_ref().expect("sharded").owner.lock() = Arc::downgrade(&template);
        exchange.register_template(
            template_index,
            Arc::clone(&template) as Arc<dyn ShardMessageHandler>,
        );
        template
    }

    /// Handles a find-event request on the owner side: an already-known event is published
    /// through a fresh single-arrival barrier; an unknown one is answered with no barrier.
    fn handle_find_event(
        &self,
        state: &mut RecordingState,
        event: Event,
        asker: ShardId,
    ) -> Barrier {
        let sharded = self.sharded.as_ref().expect("sharded template");
        match state.find_event(event) {
            Some(slot) => {
                let barrier = self.runtime().create_barrier(1);
                let arrival_slot = state.allocate_slot();
                state.instructions.push(crate::template::Instruction::new(
                    state.instructions[0].owner.clone(),
                    InstructionKind::BarrierArrival {
                        lhs: arrival_slot,
                        rhs: slot,
                        barrier,
                        arrivals: 1,
                        collective_key: None,
                    },
                ));
                sharded
                    .state
                    .lock()
                    .import_subscriptions
                    .entry(barrier.base())
                    .or_default()
                    .insert(asker);
                barrier
            },
            None => Barrier::NO_BARRIER,
        }
    }

    /// Answers a last-users query from the finalization-time snapshot, so no template lock is
    /// needed.
    fn snapshot_last_users(
        &self,
        view: ViewId,
        expr: weft_core::ExprId,
        mask: weft_core::FieldMask,
        usage: Usage,
    ) -> Vec<(ShardId, usize)> {
        let sharded = self.sharded.as_ref().expect("sharded template");
        let state = sharded.state.lock();
        let Some(users) = state.view_users_snapshot.get(&view) else {
            return Vec::new();
        };
        users
            .iter()
            .filter(|user| {
                user.usage.conflicts_with(&usage)
                    && user.mask.overlaps(&mask)
                    && self.forest().exprs_overlap(user.expr, expr)
            })
            .map(|user| (user.owner_shard, user.user))
            .collect()
    }

    fn snapshot_read_only(
        &self,
        view: ViewId,
        expr: weft_core::ExprId,
        mask: weft_core::FieldMask,
    ) -> bool {
        let sharded = self.sharded.as_ref().expect("sharded template");
        let state = sharded.state.lock();
        let Some(users) = state.view_users_snapshot.get(&view) else {
            return true;
        };
        users.iter().all(|user| {
            !user.mask.overlaps(&mask)
                || !self.forest().exprs_overlap(user.expr, expr)
                || user.usage.is_read_only()
        })
    }
}

impl ShardMessageHandler for PhysicalTemplate {
    fn handle_trace_update(&self, from: ShardId, message: TraceShardMessage) {
        let sharded = self.sharded.as_ref().expect("message sent to unsharded template");
        match message {
            TraceShardMessage::FindEventRequest { request, event, asker, .. } => {
                // The event map lives under the template lock; defer to a meta-task when the
                // recording thread holds it so the transport thread never blocks.
                let barrier = match self.try_recording_state() {
                    Some(mut state) => self.handle_find_event(&mut state, event, asker),
                    None => {
                        self.defer_message(from, TraceShardMessage::FindEventRequest {
                            template: sharded.template_index,
                            request,
                            event,
                            asker,
                        });
                        return;
                    },
                };
                sharded.exchange.post(asker, TraceShardMessage::FindEventResponse {
                    template: sharded.template_index,
                    request,
                    barrier,
                });
            },
            TraceShardMessage::FindEventResponse { request, barrier, .. } => {
                let mut state = sharded.state.lock();
                state.event_import_results.insert(request, barrier);
                sharded.response_cv.notify_all();
            },
            TraceShardMessage::FindFrontierRequest { request, slot, asker, .. } => {
                let barrier = {
                    let mut state = sharded.state.lock();
                    let barrier = match state.local_frontiers.get(&slot) {
                        Some(existing) => *existing,
                        None => {
                            let fresh = self.runtime().create_barrier(1);
                            state.local_frontiers.insert(slot, fresh);
                            fresh
                        },
                    };
                    state.local_subscriptions.entry(slot).or_default().insert(asker);
                    barrier
                };
                sharded.exchange.post(asker, TraceShardMessage::FindFrontierResponse {
                    template: sharded.template_index,
                    request,
                    slot,
                    barrier,
                });
            },
            TraceShardMessage::FindFrontierResponse { request, barrier, .. } => {
                let mut state = sharded.state.lock();
                state.frontier_results.insert(request, barrier);
                sharded.response_cv.notify_all();
            },
            TraceShardMessage::FindLastUsersRequest {
                request,
                view,
                expr,
                mask,
                usage,
                asker,
                ..
            } => {
                let users = self.snapshot_last_users(view, expr, mask, usage);
                sharded.exchange.post(asker, TraceShardMessage::FindLastUsersResponse {
                    template: sharded.template_index,
                    request,
                    users,
                });
            },
            TraceShardMessage::FindLastUsersResponse { request, users, .. } => {
                let mut state = sharded.state.lock();
                state.last_users_results.insert(request, users);
                sharded.response_cv.notify_all();
            },
            TraceShardMessage::UpdateViewUser { view, user, .. } => {
                match self.try_recording_state() {
                    Some(mut recording) => {
                        let forest = Arc::clone(self.forest());
                        recording.add_view_user(&forest, view, user);
                    },
                    None => {
                        self.defer_message(from, TraceShardMessage::UpdateViewUser {
                            template: sharded.template_index,
                            view,
                            user,
                        });
                    },
                }
            },
            TraceShardMessage::UpdateLastUsers { slots, .. } => {
                match self.try_recording_state() {
                    Some(mut recording) => {
                        // The owner's confirmation replaces the provisional set kept when the
                        // users were forwarded.
                        recording.local_last_users.extend(slots);
                    },
                    None => {
                        self.defer_message(from, TraceShardMessage::UpdateLastUsers {
                            template: sharded.template_index,
                            slots,
                        });
                    },
                }
            },
            TraceShardMessage::ReadOnlyUsersRequest { request, view, expr, mask, asker, .. } => {
                let read_only = self.snapshot_read_only(view, expr, mask);
                sharded.exchange.post(asker, TraceShardMessage::ReadOnlyUsersResponse {
                    template: sharded.template_index,
                    request,
                    read_only,
                });
            },
            TraceShardMessage::ReadOnlyUsersResponse { request, read_only, .. } => {
                let mut state = sharded.state.lock();
                state.read_only_results.insert(request, read_only);
                sharded.response_cv.notify_all();
            },
            TraceShardMessage::FrontierBarrierRefresh { old, new, .. } => {
                {
                    let mut state = sharded.state.lock();
                    for (barrier, _) in state.remote_frontiers.iter_mut() {
                        if barrier.base() == old.base() {
                            *barrier = new;
                        }
                    }
                }
                if let Some(compiled) = self.try_compiled() {
                    compiled.refresh_barrier(old, new);
                }
                sharded.response_cv.notify_all();
            },
            TraceShardMessage::TemplateBarrierRefresh { key, barrier, .. } => {
                sharded.set_collective_barrier(key, barrier);
                if let Some(compiled) = self.try_compiled() {
                    compiled.set_collective_barrier(key, barrier);
                }
                sharded.response_cv.notify_all();
            },
        }
    }
}

impl PhysicalTemplate {
    /// Replaces the collective barrier for `key` on this shard and every peer before the next
    /// replay dispatch.
    pub fn refresh_collective_barrier(&self, key: u64, barrier: Barrier) {
        let sharded = self.sharded.as_ref().expect("collective barriers require sharding");
        sharded.broadcast_collective_refresh(key, barrier);
        if let Some(compiled) = self.try_compiled() {
            compiled.set_collective_barrier(key, barrier);
        }
    }

    /// Re-enqueues a message whose handling needs the contended template lock.
    fn defer_message(&self, from: ShardId, message: TraceShardMessage) {
        let sharded = self.sharded.as_ref().expect("sharded template");
        let Some(template) = sharded.owner_template() else {
            return;
        };
        self.runtime().spawn_task(
            Event::NO_EVENT,
            Box::new(move || {
                template.handle_trace_update(from, message);
            }),
        );
    }
}
