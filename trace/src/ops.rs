//! Trace control operations and the per-trace state machine.
//!
//! Small operations injected into the parent task's stream drive each trace through
//! `LogicalOnly → Recording ⇄ Replaying`: *begin* opens the window behind a mapping fence,
//! *replay* selects a matching template on entry, *capture* finalizes a fresh recording on
//! exit, *complete* replays a selected template on exit, and *summary* reconciles equivalence
//! sets when a cached template is invalidated from outside.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
};

use tracing::{debug, warn};
use weft_core::{
    DependenceRecord, Event, Memoizable, Operation, ParentContext, RegionForest, RegionTreeId,
    RuntimeTransport, ShardExchange, StaticDependence, TemplateIndex, TraceId, UniqueId,
};

use crate::{
    errors::{Replayable, TraceError},
    options::{NEW_TEMPLATE_WARNING_COUNT, NON_REPLAYABLE_WARNING, TraceConfig},
    recorder::{DynamicRecorder, StaticRecorder, TraceRecorder},
    template::PhysicalTemplate,
};

// COLLABORATOR BUNDLE
// ================================================================================================

/// The external collaborators every trace operation needs.
#[derive(Clone)]
pub struct TraceContext {
    pub forest: Arc<dyn RegionForest>,
    pub runtime: Arc<dyn RuntimeTransport>,
    pub parent: Arc<dyn ParentContext>,
    /// Present when the parent task is control replicated.
    pub exchange: Option<Arc<dyn ShardExchange>>,
    pub config: TraceConfig,
}

// TRACE STATE
// ================================================================================================

/// The physical state of a trace.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceState {
    /// Logical dependence recording only; no physical template exists yet.
    LogicalOnly,
    /// A physical template is recording this execution.
    Recording,
    /// A selected template is replaying this execution.
    Replaying,
}

/// What happened when a trace execution closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEndStatus {
    /// The execution only recorded logical dependences.
    Logical,
    /// A fresh template was captured with the given verdict.
    Captured(Replayable),
    /// A template replayed; the parent task must depend on `completion`.
    Replayed { completion: Event },
}

// TRACE
// ================================================================================================

/// One named, repeatable window of operations inside a parent task.
pub struct Trace {
    tid: TraceId,
    logical_only: bool,
    managed_trees: Option<BTreeSet<RegionTreeId>>,
    recorder: TraceRecorder,
    context: TraceContext,

    state: TraceState,
    /// Captured templates, most recently replayed first.
    templates: VecDeque<Arc<PhysicalTemplate>>,
    current_template: Option<Arc<PhysicalTemplate>>,
    previous_template: Option<Arc<PhysicalTemplate>>,

    open: bool,
    op_count: u64,
    current_uids: Vec<UniqueId>,
    memoized: BTreeSet<u64>,
    executions: u64,
    last_replay_completion: Option<Event>,
    intermediate_fence: bool,
    consecutive_nonreplayable: u32,
    templates_since_replay: u32,
    next_template_index: u64,
}

impl Trace {
    fn new(tid: TraceId, logical_only: bool, recorder: TraceRecorder, context: TraceContext) -> Self {
        Self {
            tid,
            logical_only,
            managed_trees: None,
            recorder,
            context,
            state: TraceState::LogicalOnly,
            templates: VecDeque::new(),
            current_template: None,
            previous_template: None,
            open: false,
            op_count: 0,
            current_uids: Vec::new(),
            memoized: BTreeSet::new(),
            executions: 0,
            last_replay_completion: None,
            intermediate_fence: false,
            consecutive_nonreplayable: 0,
            templates_since_replay: 0,
            next_template_index: 0,
        }
    }

    pub fn dynamic(tid: TraceId, logical_only: bool, context: TraceContext) -> Self {
        Self::new(tid, logical_only, TraceRecorder::Dynamic(DynamicRecorder::new()), context)
    }

    pub fn static_trace(
        tid: TraceId,
        dependences: Vec<Vec<StaticDependence>>,
        managed_trees: Option<BTreeSet<RegionTreeId>>,
        context: TraceContext,
    ) -> Self {
        let mut trace =
            Self::new(tid, false, TraceRecorder::Static(StaticRecorder::new(dependences)), context);
        trace.managed_trees = managed_trees;
        trace
    }

    pub fn tid(&self) -> TraceId {
        self.tid
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn is_replaying(&self) -> bool {
        self.state == TraceState::Replaying
    }

    pub fn current_template(&self) -> Option<&Arc<PhysicalTemplate>> {
        self.current_template.as_ref()
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }
}

// BEGIN / REPLAY
// ================================================================================================

/// Opens a trace execution: a mapping fence against prior operations, followed by template
/// selection when captures exist.
pub struct TraceBeginOp<'a> {
    trace: &'a mut Trace,
}

impl<'a> TraceBeginOp<'a> {
    pub fn new(trace: &'a mut Trace) -> Self {
        Self { trace }
    }

    #[tracing::instrument(skip_all, fields(tid = %self.trace.tid))]
    pub fn execute(self) -> Result<(), TraceError> {
        let trace = self.trace;
        trace.open = true;
        trace.op_count = 0;
        trace.current_uids.clear();
        trace.memoized.clear();
        trace.executions += 1;

        if trace.logical_only || trace.executions == 1 {
            trace.state = TraceState::LogicalOnly;
            return Ok(());
        }

        TraceReplayOp::new(trace).execute();
        Ok(())
    }
}

/// Selects a replayable template whose preconditions hold, or falls back to a new capture.
pub struct TraceReplayOp<'a> {
    trace: &'a mut Trace,
}

impl<'a> TraceReplayOp<'a> {
    pub fn new(trace: &'a mut Trace) -> Self {
        Self { trace }
    }

    pub fn execute(self) {
        let trace = self.trace;
        let selected = trace.select_template();
        match selected {
            Some(position) => {
                let template = trace.templates.remove(position).expect("selected template");
                trace.templates.push_front(Arc::clone(&template));
                trace.current_template = Some(template);
                trace.state = TraceState::Replaying;
                trace.templates_since_replay = 0;
                trace.context.parent.record_physical_trace_replay(true);
            },
            None => {
                trace.begin_capture();
                trace.context.parent.record_physical_trace_replay(false);
            },
        }
    }
}

impl Trace {
    /// The ring position of the first replayable template whose preconditions pass.
    fn select_template(&self) -> Option<usize> {
        for (position, template) in self.templates.iter().enumerate() {
            if !template.is_replayable() {
                continue;
            }
            if template.test_preconditions(&self.context.parent) {
                return Some(position);
            }
            debug!(
                target: "weft::trace",
                tid = %self.tid,
                position,
                "template preconditions failed at replay; falling back to recording"
            );
        }
        None
    }

    fn begin_capture(&mut self) {
        let fence_owner = weft_core::TraceLocalId::new(u64::MAX);
        let template = match &self.context.exchange {
            Some(exchange) => {
                let index = TemplateIndex(self.next_template_index);
                self.next_template_index += 1;
                PhysicalTemplate::new_sharded(
                    Arc::clone(&self.context.forest),
                    Arc::clone(&self.context.runtime),
                    self.context.config.clone(),
                    fence_owner,
                    Arc::clone(exchange),
                    index,
                )
            },
            None => PhysicalTemplate::new(
                Arc::clone(&self.context.forest),
                Arc::clone(&self.context.runtime),
                self.context.config.clone(),
                fence_owner,
            ),
        };
        self.current_template = Some(template);
        self.state = TraceState::Recording;
        self.templates_since_replay += 1;
        if self.templates_since_replay > NEW_TEMPLATE_WARNING_COUNT {
            warn!(
                target: "weft::trace",
                tid = %self.tid,
                captures = self.templates_since_replay,
                "trace keeps capturing new templates without a replay hit; the mapper is \
                 likely making unstable decisions"
            );
        }
    }
}

// OPERATION ARRIVAL
// ================================================================================================

impl Trace {
    /// Offers an arriving non-internal operation to the recorder and, when memoizing, to the
    /// physical template.
    pub fn record_operation(&mut self, op: &Arc<dyn Operation>) -> Result<(), TraceError> {
        debug_assert!(self.open, "operation recorded outside an open trace");
        if let Some(managed) = &self.managed_trees {
            for requirement in 0..op.region_count() {
                let tree = op.region_tree(requirement as u32);
                if !managed.contains(&tree) {
                    return Err(TraceError::UnmanagedRegionTree { tid: self.tid, tree });
                }
            }
        }

        let index = self.op_count;
        self.op_count += 1;
        self.recorder.enter_operation(self.tid, index, op.as_ref())?;
        self.current_uids.push(op.unique_id());

        if !self.recorder.is_recording() {
            let uids = std::mem::take(&mut self.current_uids);
            self.recorder.replay_dependences(index, op.as_ref(), &uids, &self.context.parent);
            self.current_uids = uids;
        }

        match self.state {
            TraceState::LogicalOnly => {},
            TraceState::Recording => {
                if op.memoizable() == Memoizable::Memoize {
                    let template = self.current_template.as_ref().expect("recording template");
                    template.record_get_term_event(op.as_ref())?;
                    self.memoized.insert(index);
                }
            },
            TraceState::Replaying => {
                let template = self.current_template.as_ref().expect("replaying template");
                if !template.has_memo_entry(&op.trace_local_id()) {
                    return Err(TraceError::PartialMemoization { tid: self.tid, index });
                }
                template.register_operation(Arc::clone(op));
            },
        }
        Ok(())
    }

    /// Registers the dependences an internal operation inherits from its creator.
    pub fn record_internal_operation(
        &mut self,
        creator_index: u64,
        internal_index: u32,
        op: &dyn Operation,
    ) {
        if let TraceRecorder::Dynamic(recorder) = &mut self.recorder {
            if recorder.is_fixed() {
                recorder.replay_internal_dependences(
                    creator_index,
                    internal_index,
                    op,
                    &self.current_uids,
                    &self.context.parent,
                );
            }
        }
    }

    /// Captures a dependence reported by the dependence machinery during logical recording.
    pub fn record_dependence(&mut self, next_index: u64, record: DependenceRecord) {
        if let TraceRecorder::Dynamic(recorder) = &mut self.recorder {
            if !recorder.is_fixed() {
                recorder.record_dependence(next_index, record);
            }
        }
    }

    /// Marks the recording template non-replayable because of a blocking runtime call.
    pub fn record_blocking_call(&self) {
        if self.state == TraceState::Recording {
            if let Some(template) = &self.current_template {
                template.record_blocking_call();
            }
        }
    }
}

// CAPTURE / COMPLETE
// ================================================================================================

/// Closes the first physical execution of a trace: finalizes the recording template and files
/// it in the ring when the capture is replayable.
pub struct TraceCaptureOp<'a> {
    trace: &'a mut Trace,
}

impl<'a> TraceCaptureOp<'a> {
    pub fn new(trace: &'a mut Trace) -> Self {
        Self { trace }
    }

    #[tracing::instrument(skip_all, fields(tid = %self.trace.tid))]
    pub fn execute(self) -> Result<Replayable, TraceError> {
        let trace = self.trace;
        let template = trace.current_template.take().expect("capturing template");

        // Every operation of the window is memoized or none is.
        if !trace.memoized.is_empty() {
            for index in 0..trace.op_count {
                if !trace.memoized.contains(&index) {
                    return Err(TraceError::PartialMemoization { tid: trace.tid, index });
                }
            }
        }

        template.dump_template();
        let verdict = template.finalize(&trace.context.parent);
        match &verdict {
            Replayable::Yes => {
                trace.consecutive_nonreplayable = 0;
                trace.templates.push_front(template);
                while trace.templates.len() > trace.context.config.max_templates_per_trace() {
                    let evicted = trace.templates.pop_back().expect("over capacity");
                    evicted.retire();
                }
            },
            Replayable::No(reason) => {
                template.retire();
                trace.consecutive_nonreplayable += 1;
                if trace.consecutive_nonreplayable >= NON_REPLAYABLE_WARNING {
                    warn!(
                        target: "weft::trace",
                        tid = %trace.tid,
                        failures = trace.consecutive_nonreplayable,
                        %reason,
                        "trace keeps producing non-replayable captures"
                    );
                }
            },
        }
        Ok(verdict)
    }
}

/// Closes a replaying execution: runs the selected template and hands back the completion the
/// parent task must depend on.
pub struct TraceCompleteOp<'a> {
    trace: &'a mut Trace,
}

impl<'a> TraceCompleteOp<'a> {
    pub fn new(trace: &'a mut Trace) -> Self {
        Self { trace }
    }

    #[tracing::instrument(skip_all, fields(tid = %self.trace.tid))]
    pub fn execute(self) -> Event {
        let trace = self.trace;
        let template = Arc::clone(trace.current_template.as_ref().expect("replaying template"));

        // Back-to-back replays of the same template chain through frontiers; anything else
        // replays behind the fence, serialized against the previous replay's completion.
        let recurrent = !trace.intermediate_fence
            && trace
                .previous_template
                .as_ref()
                .is_some_and(|previous| Arc::ptr_eq(previous, &template));
        let fence = if recurrent {
            Event::NO_EVENT
        } else {
            let mut inputs = vec![trace.context.parent.current_fence_event()];
            inputs.extend(trace.last_replay_completion);
            trace.context.runtime.merge_events(&inputs)
        };

        template.initialize_replay(fence, recurrent);
        template.perform_replay();
        let completion = template.finish_replay();
        template.apply_postconditions();

        trace.previous_template = Some(Arc::clone(&template));
        trace.last_replay_completion = Some(completion);
        trace.intermediate_fence = false;
        completion
    }
}

/// Applies a cached template's postconditions to the equivalence sets after an outside
/// invalidation, instead of keeping the template selected.
pub struct TraceSummaryOp {
    template: Arc<PhysicalTemplate>,
}

impl TraceSummaryOp {
    pub fn new(template: Arc<PhysicalTemplate>) -> Self {
        Self { template }
    }

    pub fn execute(self) {
        self.template.apply_postconditions();
    }
}

// TRACE CLOSE DRIVER
// ================================================================================================

impl Trace {
    /// Closes the current execution, dispatching to capture or complete.
    pub fn end_execution(&mut self) -> Result<TraceEndStatus, TraceError> {
        debug_assert!(self.open);
        self.open = false;

        match self.state {
            TraceState::LogicalOnly => {
                if let TraceRecorder::Dynamic(recorder) = &mut self.recorder {
                    recorder.fix();
                }
                Ok(TraceEndStatus::Logical)
            },
            TraceState::Recording => {
                if self.memoized.is_empty() {
                    // Nothing opted into memoization; the window stays logical.
                    if let Some(template) = self.current_template.take() {
                        template.retire();
                    }
                    self.state = TraceState::LogicalOnly;
                    return Ok(TraceEndStatus::Logical);
                }
                let verdict = TraceCaptureOp::new(self).execute()?;
                Ok(TraceEndStatus::Captured(verdict))
            },
            TraceState::Replaying => {
                let completion = TraceCompleteOp::new(self).execute();
                Ok(TraceEndStatus::Replayed { completion })
            },
        }
    }

    /// Notes an execution fence between two executions; the next replay cannot chain
    /// recurrently.
    pub fn record_intermediate_fence(&mut self) {
        self.intermediate_fence = true;
    }

    /// Invalidates the cached template state after outside mutations: emits a summary
    /// operation applying the last template's postconditions.
    pub fn invalidate_cache(&mut self) {
        self.intermediate_fence = true;
        if let Some(template) = self.previous_template.take() {
            self.context.parent.request_summary_operation(self.tid);
            TraceSummaryOp::new(template).execute();
        }
        self.last_replay_completion = None;
    }

    /// Retires every template; called when the parent task ends.
    pub fn retire(&mut self) {
        self.current_template = None;
        self.previous_template = None;
        for template in self.templates.drain(..) {
            template.retire();
        }
    }
}

// TRACING SURFACE
// ================================================================================================

/// The per-parent-task trace registry: owns every trace opened in the task and enforces the
/// begin/end pairing rules.
pub struct Tracing {
    context: TraceContext,
    traces: HashMap<TraceId, Trace>,
    current: Option<TraceId>,
}

impl Tracing {
    pub fn new(context: TraceContext) -> Self {
        Self { context, traces: HashMap::new(), current: None }
    }

    /// Opens a dynamic trace, creating it on first use.
    pub fn begin_trace(&mut self, tid: TraceId, logical_only: bool) -> Result<(), TraceError> {
        let context = self.context.clone();
        self.begin_with(tid, move || Trace::dynamic(tid, logical_only, context))
    }

    /// Opens a static trace, creating it with the supplied dependences on first use.
    pub fn begin_static_trace(
        &mut self,
        tid: TraceId,
        dependences: Vec<Vec<StaticDependence>>,
        managed_trees: Option<BTreeSet<RegionTreeId>>,
    ) -> Result<(), TraceError> {
        let context = self.context.clone();
        self.begin_with(tid, move || {
            Trace::static_trace(tid, dependences, managed_trees, context)
        })
    }

    fn begin_with(
        &mut self,
        tid: TraceId,
        create: impl FnOnce() -> Trace,
    ) -> Result<(), TraceError> {
        if let Some(outer) = self.current {
            return Err(TraceError::IllegalNestedTrace { outer, inner: tid });
        }
        let trace = self.traces.entry(tid).or_insert_with(create);
        TraceBeginOp::new(trace).execute()?;
        self.current = Some(tid);
        Ok(())
    }

    pub fn end_trace(&mut self, tid: TraceId) -> Result<TraceEndStatus, TraceError> {
        match self.current {
            None => return Err(TraceError::UnmatchedEndTrace { tid }),
            Some(current) if current != tid => {
                return Err(TraceError::MismatchedEndTrace { expected: current, observed: tid });
            },
            Some(_) => {},
        }
        self.current = None;
        let trace = self.traces.get_mut(&tid).expect("trace exists while open");
        trace.end_execution()
    }

    /// The currently open trace, if any.
    pub fn current_trace(&mut self) -> Option<&mut Trace> {
        let tid = self.current?;
        self.traces.get_mut(&tid)
    }

    pub fn trace(&self, tid: TraceId) -> Option<&Trace> {
        self.traces.get(&tid)
    }

    pub fn trace_mut(&mut self, tid: TraceId) -> Option<&mut Trace> {
        self.traces.get_mut(&tid)
    }

    /// Routes an arriving operation to the open trace.
    pub fn record_operation(&mut self, op: &Arc<dyn Operation>) -> Result<(), TraceError> {
        let trace = self.current_trace().expect("operation recorded outside a trace");
        trace.record_operation(op)
    }

    /// Invalidates a trace's cached template from outside the window.
    pub fn invalidate_trace_cache(&mut self, tid: TraceId) {
        if let Some(trace) = self.traces.get_mut(&tid) {
            trace.invalidate_cache();
        }
    }

    /// Retires every trace; called when the parent task ends.
    pub fn retire(&mut self) {
        for (_, trace) in self.traces.iter_mut() {
            trace.retire();
        }
        self.traces.clear();
    }
}
