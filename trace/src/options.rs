// TRACE CONFIG
// ================================================================================================

/// Default number of parallel replay slices.
pub const DEFAULT_REPLAY_PARALLELISM: usize = 4;

/// Default capacity of a trace's template ring.
pub const DEFAULT_MAX_TEMPLATES_PER_TRACE: usize = 16;

/// Number of consecutive non-replayable captures after which a warning is logged.
pub const NON_REPLAYABLE_WARNING: u32 = 5;

/// Number of new templates captured without a replay hit after which a warning is logged.
pub const NEW_TEMPLATE_WARNING_COUNT: u32 = 10;

/// Knobs controlling physical trace capture and replay.
///
/// The defaults match production behavior; the `no_*` switches exist for debugging captures
/// whose optimized form misbehaves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceConfig {
    replay_parallelism: usize,
    max_templates_per_trace: usize,
    /// Skips fence elision and merge propagation.
    no_fence_elision: bool,
    /// Skips every optimization stage, leaving a fence-ordered template.
    no_trace_optimization: bool,
    /// Runs transitive reduction on a background meta-task instead of inline during capture.
    deferred_transitive_reduction: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            replay_parallelism: DEFAULT_REPLAY_PARALLELISM,
            max_templates_per_trace: DEFAULT_MAX_TEMPLATES_PER_TRACE,
            no_fence_elision: false,
            no_trace_optimization: false,
            deferred_transitive_reduction: false,
        }
    }
}

impl TraceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of parallel replay slices; clamped below by one.
    pub fn with_replay_parallelism(mut self, slices: usize) -> Self {
        self.replay_parallelism = slices.max(1);
        self
    }

    /// Sets the capacity of each trace's template ring; clamped below by one.
    pub fn with_max_templates_per_trace(mut self, templates: usize) -> Self {
        self.max_templates_per_trace = templates.max(1);
        self
    }

    pub fn with_no_fence_elision(mut self, disable: bool) -> Self {
        self.no_fence_elision = disable;
        self
    }

    pub fn with_no_trace_optimization(mut self, disable: bool) -> Self {
        self.no_trace_optimization = disable;
        self
    }

    pub fn with_deferred_transitive_reduction(mut self, deferred: bool) -> Self {
        self.deferred_transitive_reduction = deferred;
        self
    }

    pub fn replay_parallelism(&self) -> usize {
        self.replay_parallelism
    }

    pub fn max_templates_per_trace(&self) -> usize {
        self.max_templates_per_trace
    }

    pub fn fence_elision_enabled(&self) -> bool {
        !self.no_fence_elision && !self.no_trace_optimization
    }

    pub fn optimization_enabled(&self) -> bool {
        !self.no_trace_optimization
    }

    pub fn deferred_transitive_reduction(&self) -> bool {
        self.deferred_transitive_reduction && self.optimization_enabled()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_clamp_to_one() {
        let config = TraceConfig::new().with_replay_parallelism(0).with_max_templates_per_trace(0);
        assert_eq!(config.replay_parallelism(), 1);
        assert_eq!(config.max_templates_per_trace(), 1);
    }

    #[test]
    fn no_trace_optimization_implies_no_elision() {
        let config = TraceConfig::new().with_no_trace_optimization(true);
        assert!(!config.fence_elision_enabled());
        assert!(!config.deferred_transitive_reduction());
    }
}
