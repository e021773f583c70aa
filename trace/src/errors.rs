use core::fmt;

use weft_core::{ExprId, FieldMask, OperationKind, RegionTreeId, TraceId, ViewId};

// TRACE ERROR
// ================================================================================================

/// Fatal violations of the tracing contract.
///
/// These surface as `Err` variants from the public trace operations; the enclosing parent task
/// converts them to a user-visible abort with provenance. Everything that merely makes a
/// template ineligible for replay is reported through [`Replayable`] instead.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceError {
    #[error(
        "operation at index {index} of trace {tid} does not match the recording: recorded a \
         {recorded_kind} operation with {recorded_regions} region requirements, observed a \
         {observed_kind} operation with {observed_regions}"
    )]
    StructureViolation {
        tid: TraceId,
        index: u64,
        recorded_kind: OperationKind,
        recorded_regions: usize,
        observed_kind: OperationKind,
        observed_regions: usize,
    },

    #[error(
        "trace {tid} contains a gap in memoized operations before index {index}; either every \
         operation in a trace is memoized or none is"
    )]
    PartialMemoization { tid: TraceId, index: u64 },

    #[error("memoization requested for a {kind} operation, which cannot be recorded")]
    UnsupportedOpKind { kind: OperationKind },

    #[error("trace {inner} was begun while trace {outer} was still open")]
    IllegalNestedTrace { outer: TraceId, inner: TraceId },

    #[error("end of trace {tid} was issued without a matching begin")]
    UnmatchedEndTrace { tid: TraceId },

    #[error("end of trace {observed} was issued while trace {expected} was open")]
    MismatchedEndTrace { expected: TraceId, observed: TraceId },

    #[error(
        "operation in static trace {tid} touches region tree {tree} which is outside the \
         trace's managed set",
        tree = .tree.0
    )]
    UnmanagedRegionTree { tid: TraceId, tree: RegionTreeId },
}

// REPLAYABILITY
// ================================================================================================

/// The `(view, expression, fields)` residue that made a condition check fail, kept so the
/// verdict can be reported readably.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionFailure {
    pub view: ViewId,
    pub expr: ExprId,
    pub fields: FieldMask,
}

impl fmt::Display for ConditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view v{} over expression x{} on fields {}", self.view.0, self.expr.0, self.fields)
    }
}

/// Why a captured template cannot be replayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotReplayableReason {
    /// A blocking API call was observed while the template recorded.
    BlockingCall,
    /// An instance was virtually mapped inside the trace.
    VirtualMapping,
    /// A precondition is not subsumed by the postconditions.
    NotSubsumed(ConditionFailure),
    /// A postcondition intersects an anticondition.
    NotIndependent(ConditionFailure),
    /// A peer shard of a control-replicated template vetoed the capture.
    RemoteShardFailed,
}

impl fmt::Display for NotReplayableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReplayableReason::BlockingCall => f.write_str("blocking call"),
            NotReplayableReason::VirtualMapping => f.write_str("virtual mapping"),
            NotReplayableReason::NotSubsumed(cond) => {
                write!(f, "precondition not subsumed: {cond}")
            },
            NotReplayableReason::NotIndependent(cond) => {
                write!(f, "postcondition not independent of anticondition: {cond}")
            },
            NotReplayableReason::RemoteShardFailed => f.write_str("remote shard not replayable"),
        }
    }
}

/// The replay-eligibility verdict of a captured template.
///
/// This is an ordinary value, not an error: a non-replayable capture simply keeps the trace in
/// recording mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replayable {
    Yes,
    No(NotReplayableReason),
}

impl Replayable {
    pub fn is_replayable(&self) -> bool {
        matches!(self, Replayable::Yes)
    }
}

impl fmt::Display for Replayable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replayable::Yes => f.write_str("replayable"),
            Replayable::No(reason) => write!(f, "not replayable: {reason}"),
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use weft_core::{FieldMask, OperationKind, TraceId};

    use super::*;

    #[rstest]
    #[case(NotReplayableReason::BlockingCall, "blocking call")]
    #[case(NotReplayableReason::VirtualMapping, "virtual mapping")]
    #[case(NotReplayableReason::RemoteShardFailed, "remote shard not replayable")]
    fn reasons_render_for_diagnostics(
        #[case] reason: NotReplayableReason,
        #[case] rendered: &str,
    ) {
        assert_eq!(reason.to_string(), rendered);
    }

    #[test]
    fn structure_violation_names_the_index() {
        let err = TraceError::StructureViolation {
            tid: TraceId(2),
            index: 5,
            recorded_kind: OperationKind::Copy,
            recorded_regions: 2,
            observed_kind: OperationKind::Task,
            observed_regions: 1,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("index 5"));
        assert!(rendered.contains("copy"));
        assert!(rendered.contains("task"));
    }

    #[test]
    fn replayable_verdict_renders_reason() {
        let verdict = Replayable::No(NotReplayableReason::NotSubsumed(ConditionFailure {
            view: ViewId(3),
            expr: ExprId(9),
            fields: FieldMask::of(&[0]),
        }));
        assert!(!verdict.is_replayable());
        assert_eq!(
            verdict.to_string(),
            "not replayable: precondition not subsumed: view v3 over expression x9 on fields {f0}"
        );
    }
}
