use std::sync::Arc;

use crate::{Barrier, Event, ExprId, FieldMask, ShardId, Usage, UserEvent, ViewId};

// RUNTIME TRANSPORT
// ================================================================================================

/// The low-level runtime services the trace core consumes: event plumbing, barriers, and
/// meta-task launch.
///
/// Implementations must be callable from any thread. Spawned tasks run after their precondition
/// triggers; the returned event completes when the task body returns.
pub trait RuntimeTransport: Send + Sync {
    fn create_user_event(&self) -> UserEvent;

    /// Triggers `event` once `precondition` has triggered. A user event is triggered at most
    /// once.
    fn trigger_user_event(&self, event: UserEvent, precondition: Event);

    /// Merges events associatively; non-existent handles are ignored. An empty or all-empty set
    /// merges to [`Event::NO_EVENT`].
    fn merge_events(&self, events: &[Event]) -> Event;

    fn event_has_triggered(&self, event: Event) -> bool;

    /// Allocates a barrier whose every generation triggers after `total_arrivals` arrivals.
    fn create_barrier(&self, total_arrivals: u32) -> Barrier;

    /// Reclaims a barrier after its last generation of interest.
    fn destroy_barrier(&self, barrier: Barrier);

    /// Arrives `count` times on the barrier's generation once `precondition` triggers.
    fn arrive_barrier(&self, barrier: Barrier, count: u32, precondition: Event);

    /// The number of generations a barrier supports before it must be refreshed.
    fn max_barrier_generations(&self) -> u32;

    /// Launches a meta-task gated on `precondition`; returns the task's completion event.
    fn spawn_task(&self, precondition: Event, task: Box<dyn FnOnce() + Send + 'static>) -> Event;

    /// Blocks the calling thread until `event` has triggered.
    fn wait_for_event(&self, event: Event);
}

// SHARD MESSAGES
// ================================================================================================

/// Index of a sharded template within its replicated context, agreed upon by all shards.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TemplateIndex(pub u64);

/// Correlates a request message with its response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// The typed messages sharded templates exchange while recording and refreshing barriers.
#[derive(Clone, Debug)]
pub enum TraceShardMessage {
    /// Asks the owner shard of `event` for a barrier carrying the event's slot value.
    FindEventRequest {
        template: TemplateIndex,
        request: RequestId,
        event: Event,
        asker: ShardId,
    },
    /// Answers a [`TraceShardMessage::FindEventRequest`]; a non-existent barrier means the event
    /// is not part of the owner's trace.
    FindEventResponse {
        template: TemplateIndex,
        request: RequestId,
        barrier: Barrier,
    },
    /// Asks the owner of a frontier slot for a barrier republishing it each replay.
    FindFrontierRequest {
        template: TemplateIndex,
        request: RequestId,
        slot: usize,
        asker: ShardId,
    },
    FindFrontierResponse {
        template: TemplateIndex,
        request: RequestId,
        slot: usize,
        barrier: Barrier,
    },
    /// Asks the owner of `view` for barriers carrying the last users conflicting with `usage`
    /// over `expr`/`mask`.
    FindLastUsersRequest {
        template: TemplateIndex,
        request: RequestId,
        view: ViewId,
        expr: ExprId,
        mask: FieldMask,
        usage: Usage,
        asker: ShardId,
    },
    /// Answers with `(owner shard, slot)` descriptors; the asker imports each through a
    /// [`TraceShardMessage::FindFrontierRequest`] to the slot's owner.
    FindLastUsersResponse {
        template: TemplateIndex,
        request: RequestId,
        users: Vec<(ShardId, usize)>,
    },
    /// Forwards a view user recorded for a remotely owned view to the view's owner shard.
    UpdateViewUser {
        template: TemplateIndex,
        view: ViewId,
        user: crate::ViewUser,
    },
    /// Tells a shard that its slots survived the owner's conflict filter and belong to the
    /// template's postconditions.
    UpdateLastUsers {
        template: TemplateIndex,
        slots: Vec<usize>,
    },
    /// Asks the owner of `view` whether every recorded user is read-only over `expr`/`mask`.
    ReadOnlyUsersRequest {
        template: TemplateIndex,
        request: RequestId,
        view: ViewId,
        expr: ExprId,
        mask: FieldMask,
        asker: ShardId,
    },
    ReadOnlyUsersResponse {
        template: TemplateIndex,
        request: RequestId,
        read_only: bool,
    },
    /// Replaces an exhausted frontier barrier for every subscribed shard.
    FrontierBarrierRefresh {
        template: TemplateIndex,
        old: Barrier,
        new: Barrier,
    },
    /// Replaces an exhausted collective template barrier.
    TemplateBarrierRefresh {
        template: TemplateIndex,
        key: u64,
        barrier: Barrier,
    },
}

impl TraceShardMessage {
    /// The template the message is addressed to.
    pub fn template(&self) -> TemplateIndex {
        match self {
            TraceShardMessage::FindEventRequest { template, .. }
            | TraceShardMessage::FindEventResponse { template, .. }
            | TraceShardMessage::FindFrontierRequest { template, .. }
            | TraceShardMessage::FindFrontierResponse { template, .. }
            | TraceShardMessage::FindLastUsersRequest { template, .. }
            | TraceShardMessage::FindLastUsersResponse { template, .. }
            | TraceShardMessage::UpdateViewUser { template, .. }
            | TraceShardMessage::UpdateLastUsers { template, .. }
            | TraceShardMessage::ReadOnlyUsersRequest { template, .. }
            | TraceShardMessage::ReadOnlyUsersResponse { template, .. }
            | TraceShardMessage::FrontierBarrierRefresh { template, .. }
            | TraceShardMessage::TemplateBarrierRefresh { template, .. } => *template,
        }
    }
}

/// Receiver side of the shard message plumbing, implemented by sharded templates.
pub trait ShardMessageHandler: Send + Sync {
    fn handle_trace_update(&self, from: ShardId, message: TraceShardMessage);
}

// SHARD EXCHANGE
// ================================================================================================

/// Message routing between the shards of one control-replicated parent task.
///
/// The exchange owns the mapping from template indices to registered handlers; posting to an
/// unregistered template buffers the message until the template registers. `exchange_replayable`
/// is the one blocking collective: every shard contributes its local verdict and all of them
/// observe the conjunction.
pub trait ShardExchange: Send + Sync {
    fn local_shard(&self) -> ShardId;
    fn shard_count(&self) -> usize;

    fn register_template(&self, index: TemplateIndex, handler: Arc<dyn ShardMessageHandler>);
    fn unregister_template(&self, index: TemplateIndex);

    /// Posts a message to a peer shard. Delivery is asynchronous and ordered per sender.
    fn post(&self, to: ShardId, message: TraceShardMessage);

    /// All-reduces the local replayable verdict across shards.
    fn exchange_replayable(&self, local: bool) -> bool;
}
