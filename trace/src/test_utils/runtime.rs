use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    thread,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use weft_core::{Barrier, Event, RuntimeTransport, ShardId, UserEvent};

// MOCK RUNTIME
// ================================================================================================

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A deterministic in-process event engine implementing [`RuntimeTransport`].
///
/// Events are nodes in an explicit dependence graph; triggering propagates eagerly under the
/// engine lock. Meta-tasks run on a single pump thread so their side effects are serialized;
/// tests that need to observe the state between task submissions can [`MockRuntime::pause`] the
/// pump.
pub struct MockRuntime {
    shard: ShardId,
    max_generations: u32,
    inner: Arc<EngineInner>,
}

struct EngineInner {
    state: Mutex<EngineState>,
    /// Signaled when an event triggers.
    trigger_cv: Condvar,
    /// Signaled when a task becomes ready or the pump is resumed.
    task_cv: Condvar,
    /// Live transport handles; the pump shuts down when the last one drops.
    handles: std::sync::atomic::AtomicUsize,
}

struct EngineState {
    next_index: u64,
    triggered: HashSet<Event>,
    subscribers: HashMap<Event, Vec<Subscriber>>,
    /// Remaining untriggered dependency count per merge event.
    merges: HashMap<Event, usize>,
    barriers: HashMap<Event, BarrierState>,
    destroyed_barriers: Vec<Event>,
    user_events: HashSet<Event>,
    ready: VecDeque<PendingTask>,
    running: usize,
    paused: bool,
    shutdown: bool,
}

struct BarrierState {
    total_arrivals: u32,
    arrivals: HashMap<u32, u32>,
}

enum Subscriber {
    /// Trigger another event.
    Trigger(Event),
    /// Decrement a merge's remaining count.
    MergeInput(Event),
    /// Apply a deferred barrier arrival.
    BarrierArrive { base: Event, generation: u32, count: u32 },
    /// Release a task for execution.
    Task(PendingTask),
}

struct PendingTask {
    body: Box<dyn FnOnce() + Send + 'static>,
    completion: Event,
}

impl MockRuntime {
    pub fn new(shard: ShardId) -> Arc<Self> {
        Self::with_max_generations(shard, 64)
    }

    pub fn with_max_generations(shard: ShardId, max_generations: u32) -> Arc<Self> {
        let inner = Arc::new(EngineInner {
            state: Mutex::new(EngineState {
                // Index zero is reserved for NO_EVENT on shard zero.
                next_index: 1,
                triggered: HashSet::new(),
                subscribers: HashMap::new(),
                merges: HashMap::new(),
                barriers: HashMap::new(),
                destroyed_barriers: Vec::new(),
                user_events: HashSet::new(),
                ready: VecDeque::new(),
                running: 0,
                paused: false,
                shutdown: false,
            }),
            trigger_cv: Condvar::new(),
            task_cv: Condvar::new(),
            handles: std::sync::atomic::AtomicUsize::new(1),
        });

        let pump = Arc::clone(&inner);
        thread::spawn(move || pump_loop(pump));

        Arc::new(Self { shard, max_generations, inner })
    }

    /// A transport handle for another shard sharing this engine's event graph, as the shards of
    /// one replicated task share a runtime. Allocated handles carry `shard` as their creator.
    pub fn sibling(&self, shard: ShardId) -> Arc<Self> {
        self.inner.handles.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Arc::new(Self {
            shard,
            max_generations: self.max_generations,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Holds back task execution until [`MockRuntime::resume`].
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.inner.task_cv.notify_all();
    }

    /// Blocks until no task is queued or running.
    pub fn quiesce(&self) {
        let mut state = self.inner.state.lock();
        assert!(!state.paused, "cannot quiesce a paused runtime");
        while !state.ready.is_empty() || state.running > 0 {
            if self
                .inner
                .trigger_cv
                .wait_for(&mut state, WAIT_TIMEOUT)
                .timed_out()
            {
                panic!("mock runtime failed to quiesce");
            }
        }
    }

    /// Creates an untriggered plain event tests can fire through [`MockRuntime::fire`].
    pub fn fresh_event(&self) -> Event {
        let mut state = self.inner.state.lock();
        self.allocate(&mut state)
    }

    /// Creates an event that triggers once `precondition` has triggered.
    pub fn derived_event(&self, precondition: Event) -> Event {
        let mut state = self.inner.state.lock();
        let event = self.allocate(&mut state);
        if !precondition.exists() || state.triggered.contains(&precondition) {
            self.fire(&mut state, event);
        } else {
            state
                .subscribers
                .entry(precondition)
                .or_default()
                .push(Subscriber::Trigger(event));
        }
        event
    }

    /// Manually triggers an event.
    pub fn fire_event(&self, event: Event) {
        let mut state = self.inner.state.lock();
        self.fire(&mut state, event);
    }

    pub fn has_triggered(&self, event: Event) -> bool {
        !event.exists() || self.inner.state.lock().triggered.contains(&event)
    }

    pub fn destroyed_barriers(&self) -> Vec<Event> {
        self.inner.state.lock().destroyed_barriers.clone()
    }

    fn allocate(&self, state: &mut EngineState) -> Event {
        let event = Event::encode(self.shard, state.next_index);
        state.next_index += 1;
        event
    }

    fn fire(&self, state: &mut EngineState, event: Event) {
        fire_locked(&self.inner, state, event);
    }
}

/// Triggers `event` and propagates through the subscriber graph.
fn fire_locked(inner: &EngineInner, state: &mut EngineState, event: Event) {
    let mut worklist = vec![event];
    while let Some(current) = worklist.pop() {
        if !state.triggered.insert(current) {
            continue;
        }
        let Some(subscribers) = state.subscribers.remove(&current) else {
            continue;
        };
        for subscriber in subscribers {
            match subscriber {
                Subscriber::Trigger(next) => worklist.push(next),
                Subscriber::MergeInput(merge) => {
                    let remaining = state.merges.get_mut(&merge).expect("merge node missing");
                    *remaining -= 1;
                    if *remaining == 0 {
                        state.merges.remove(&merge);
                        worklist.push(merge);
                    }
                },
                Subscriber::BarrierArrive { base, generation, count } => {
                    if let Some(fired) = apply_arrival(state, base, generation, count) {
                        worklist.push(fired);
                    }
                },
                Subscriber::Task(task) => {
                    state.ready.push_back(task);
                    inner.task_cv.notify_all();
                },
            }
        }
    }
    inner.trigger_cv.notify_all();
}

fn apply_arrival(
    state: &mut EngineState,
    base: Event,
    generation: u32,
    count: u32,
) -> Option<Event> {
    let barrier = state.barriers.get_mut(&base)?;
    let arrivals = barrier.arrivals.entry(generation).or_insert(0);
    *arrivals += count;
    if *arrivals >= barrier.total_arrivals {
        Some(Event::encode(base.creator_shard(), base.index() + generation as u64))
    } else {
        None
    }
}

fn pump_loop(inner: Arc<EngineInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            while state.paused || (state.ready.is_empty() && !state.shutdown) {
                inner.task_cv.wait(&mut state);
            }
            if state.shutdown && state.ready.is_empty() {
                return;
            }
            let task = state.ready.pop_front().expect("ready task");
            state.running += 1;
            task
        };
        (task.body)();
        let mut state = inner.state.lock();
        state.running -= 1;
        // Completion fires after the body returns.
        fire_locked(&inner, &mut state, task.completion);
        inner.trigger_cv.notify_all();
    }
}

impl RuntimeTransport for MockRuntime {
    fn create_user_event(&self) -> UserEvent {
        let mut state = self.inner.state.lock();
        let event = self.allocate(&mut state);
        state.user_events.insert(event);
        UserEvent::new(event)
    }

    fn trigger_user_event(&self, event: UserEvent, precondition: Event) {
        let mut state = self.inner.state.lock();
        assert!(
            state.user_events.remove(&event.event()),
            "user event {} triggered twice or never created",
            event
        );
        if !precondition.exists() || state.triggered.contains(&precondition) {
            self.fire(&mut state, event.event());
        } else {
            state
                .subscribers
                .entry(precondition)
                .or_default()
                .push(Subscriber::Trigger(event.event()));
        }
    }

    fn merge_events(&self, events: &[Event]) -> Event {
        let mut state = self.inner.state.lock();
        let merge = self.allocate(&mut state);
        let pending: Vec<Event> = events
            .iter()
            .copied()
            .filter(|e| e.exists() && !state.triggered.contains(e))
            .collect();
        if pending.is_empty() {
            self.fire(&mut state, merge);
        } else {
            state.merges.insert(merge, pending.len());
            for event in pending {
                state
                    .subscribers
                    .entry(event)
                    .or_default()
                    .push(Subscriber::MergeInput(merge));
            }
        }
        merge
    }

    fn event_has_triggered(&self, event: Event) -> bool {
        self.has_triggered(event)
    }

    fn create_barrier(&self, total_arrivals: u32) -> Barrier {
        let mut state = self.inner.state.lock();
        let base = Event::encode(self.shard, state.next_index);
        // Reserve one event index per generation.
        state.next_index += self.max_generations as u64;
        state.barriers.insert(
            base,
            BarrierState { total_arrivals, arrivals: HashMap::new() },
        );
        Barrier::new(base, total_arrivals)
    }

    fn destroy_barrier(&self, barrier: Barrier) {
        let mut state = self.inner.state.lock();
        let base = barrier.base();
        state.barriers.remove(&base);
        state.destroyed_barriers.push(base);
    }

    fn arrive_barrier(&self, barrier: Barrier, count: u32, precondition: Event) {
        let mut state = self.inner.state.lock();
        let base = barrier.base();
        let generation = barrier.generation();
        if !precondition.exists() || state.triggered.contains(&precondition) {
            if let Some(fired) = apply_arrival(&mut state, base, generation, count) {
                self.fire(&mut state, fired);
            }
        } else {
            state.subscribers.entry(precondition).or_default().push(
                Subscriber::BarrierArrive { base, generation, count },
            );
        }
    }

    fn max_barrier_generations(&self) -> u32 {
        self.max_generations
    }

    fn spawn_task(&self, precondition: Event, task: Box<dyn FnOnce() + Send + 'static>) -> Event {
        let mut state = self.inner.state.lock();
        let completion = self.allocate(&mut state);
        let pending = PendingTask { body: task, completion };
        if !precondition.exists() || state.triggered.contains(&precondition) {
            state.ready.push_back(pending);
            self.inner.task_cv.notify_all();
        } else {
            state
                .subscribers
                .entry(precondition)
                .or_default()
                .push(Subscriber::Task(pending));
        }
        completion
    }

    fn wait_for_event(&self, event: Event) {
        if !event.exists() {
            return;
        }
        let mut state = self.inner.state.lock();
        while !state.triggered.contains(&event) {
            if self
                .inner
                .trigger_cv
                .wait_for(&mut state, WAIT_TIMEOUT)
                .timed_out()
            {
                panic!("timed out waiting for event {event}");
            }
        }
    }
}

impl Drop for MockRuntime {
    fn drop(&mut self) {
        if self.inner.handles.fetch_sub(1, std::sync::atomic::Ordering::AcqRel) != 1 {
            return;
        }
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        state.paused = false;
        self.inner.task_cv.notify_all();
    }
}
