use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};
use weft_core::{ShardExchange, ShardId, ShardMessageHandler, TemplateIndex, TraceShardMessage};

// LOOPBACK EXCHANGE
// ================================================================================================

/// An in-process shard exchange: messages are delivered synchronously on the sender's thread,
/// and the replayable vote is a condvar all-reduce.
///
/// Tests create one [`ExchangeFabric`] per replicated context and hand each shard its own
/// [`LoopbackExchange`] facade.
pub struct ExchangeFabric {
    shard_count: usize,
    registry: Mutex<Registry>,
    reduce: Mutex<ReduceState>,
    reduce_cv: Condvar,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<(ShardId, TemplateIndex), Arc<dyn ShardMessageHandler>>,
    /// Messages posted before the destination template registered.
    buffered: HashMap<(ShardId, TemplateIndex), Vec<(ShardId, TraceShardMessage)>>,
}

#[derive(Default)]
struct ReduceState {
    votes: Vec<bool>,
    result: Option<bool>,
    departed: usize,
}

impl ExchangeFabric {
    pub fn new(shard_count: usize) -> Arc<Self> {
        Arc::new(Self {
            shard_count,
            registry: Mutex::new(Registry::default()),
            reduce: Mutex::new(ReduceState::default()),
            reduce_cv: Condvar::new(),
        })
    }

    pub fn shard(self: &Arc<Self>, shard: ShardId) -> Arc<LoopbackExchange> {
        assert!((shard.0 as usize) < self.shard_count);
        Arc::new(LoopbackExchange { fabric: Arc::clone(self), shard })
    }
}

/// One shard's view of the fabric.
pub struct LoopbackExchange {
    fabric: Arc<ExchangeFabric>,
    shard: ShardId,
}

impl ShardExchange for LoopbackExchange {
    fn local_shard(&self) -> ShardId {
        self.shard
    }

    fn shard_count(&self) -> usize {
        self.fabric.shard_count
    }

    fn register_template(&self, index: TemplateIndex, handler: Arc<dyn ShardMessageHandler>) {
        let buffered = {
            let mut registry = self.fabric.registry.lock();
            registry.handlers.insert((self.shard, index), Arc::clone(&handler));
            registry.buffered.remove(&(self.shard, index)).unwrap_or_default()
        };
        for (from, message) in buffered {
            handler.handle_trace_update(from, message);
        }
    }

    fn unregister_template(&self, index: TemplateIndex) {
        self.fabric.registry.lock().handlers.remove(&(self.shard, index));
    }

    fn post(&self, to: ShardId, message: TraceShardMessage) {
        let template = message.template();
        let handler = {
            let mut registry = self.fabric.registry.lock();
            match registry.handlers.get(&(to, template)) {
                Some(handler) => Arc::clone(handler),
                None => {
                    registry
                        .buffered
                        .entry((to, template))
                        .or_default()
                        .push((self.shard, message));
                    return;
                },
            }
        };
        handler.handle_trace_update(self.shard, message);
    }

    fn exchange_replayable(&self, local: bool) -> bool {
        let fabric = &self.fabric;
        let mut reduce = fabric.reduce.lock();
        reduce.votes.push(local);
        if reduce.votes.len() == fabric.shard_count {
            reduce.result = Some(reduce.votes.iter().all(|v| *v));
            fabric.reduce_cv.notify_all();
        }
        while reduce.result.is_none() {
            if fabric
                .reduce_cv
                .wait_for(&mut reduce, Duration::from_secs(10))
                .timed_out()
            {
                panic!("replayable exchange did not converge");
            }
        }
        let result = reduce.result.unwrap();
        reduce.departed += 1;
        if reduce.departed == fabric.shard_count {
            // Last shard out resets the fabric for the next exchange.
            *reduce = ReduceState::default();
        }
        result
    }
}
