use core::fmt;

use smallvec::SmallVec;

// RUNTIME IDENTIFIERS
// ================================================================================================

/// Identifier of one control-replicated instance of a parent task.
///
/// Shards number densely from zero within a replicated context. A non-replicated context behaves
/// as a single shard 0.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Identifier of a named trace within a parent task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId(pub u32);

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Process-unique identifier handed out by the parent context, used to name operations when
/// registering dependences.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UniqueId(pub u64);

/// Identifier of a processor a task variant can be mapped to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorId(pub u64);

/// Identifier of a memory holding physical instances.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryId(pub u64);

/// Identifier of a physical instance of data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

/// Identifier of a field within a field space. The trace core only ever manipulates fields
/// through [`crate::FieldMask`] bit positions; this id names the field in copy descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(pub u32);

/// Identifier of a reduction operator. Zero means "no reduction".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReductionOpId(pub u32);

impl ReductionOpId {
    pub const NONE: Self = Self(0);

    pub fn exists(&self) -> bool {
        self.0 != 0
    }
}

/// Identifier of a region tree (one root region and its partitions).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionTreeId(pub u32);

/// Identifier of a reservation (a runtime-level lock acquired around atomic region accesses).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReservationId(pub u64);

// DOMAIN POINT
// ================================================================================================

/// A point in a multi-dimensional index space, used to distinguish the point tasks of an index
/// operation. Single operations use the empty point.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainPoint(SmallVec<[i64; 3]>);

impl DomainPoint {
    /// Returns the empty point, used by operations that are not part of an index launch.
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    pub fn new(coords: &[i64]) -> Self {
        Self(SmallVec::from_slice(coords))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn coords(&self) -> &[i64] {
        &self.0
    }
}

impl fmt::Display for DomainPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, ")")
    }
}

// TRACE LOCAL ID
// ================================================================================================

/// The position of an operation inside a trace window, stable across replays.
///
/// The context index counts non-internal operations in submission order from the start of the
/// trace; the index point distinguishes the point tasks of an index launch sharing one context
/// index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceLocalId {
    pub context_index: u64,
    pub index_point: DomainPoint,
}

impl TraceLocalId {
    pub fn new(context_index: u64) -> Self {
        Self { context_index, index_point: DomainPoint::empty() }
    }

    pub fn new_point(context_index: u64, index_point: DomainPoint) -> Self {
        Self { context_index, index_point }
    }
}

impl fmt::Display for TraceLocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index_point.is_empty() {
            write!(f, "op[{}]", self.context_index)
        } else {
            write!(f, "op[{}]{}", self.context_index, self.index_point)
        }
    }
}

// OPERATION KIND
// ================================================================================================

/// The kind of an operation submitted to a parent context.
///
/// Structural trace verification compares the kind (together with the region-requirement count)
/// recorded at capture against the kind observed on replay.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// A single task launch.
    Task,
    /// One point of an index task launch.
    IndexTask,
    /// An explicit copy between regions.
    Copy,
    /// A fill of a region with a literal value.
    Fill,
    /// An attach of an external resource.
    Attach,
    /// A detach of a previously attached resource.
    Detach,
    /// A discard of region contents.
    Discard,
    /// An internal close operation inserted by the dependence machinery.
    InternalClose,
    /// An internal refinement operation inserted by the dependence machinery.
    InternalRefinement,
    /// An internal fence inserted between trace replays.
    InternalFence,
    /// A trace control operation (begin/capture/complete/replay/summary).
    TraceControl,
}

impl OperationKind {
    /// Internal operations are inserted by the dependence machinery rather than submitted by the
    /// application; they are not indexed by trace recorders.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            OperationKind::InternalClose
                | OperationKind::InternalRefinement
                | OperationKind::InternalFence
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Task => "task",
            OperationKind::IndexTask => "index task",
            OperationKind::Copy => "copy",
            OperationKind::Fill => "fill",
            OperationKind::Attach => "attach",
            OperationKind::Detach => "detach",
            OperationKind::Discard => "discard",
            OperationKind::InternalClose => "close",
            OperationKind::InternalRefinement => "refinement",
            OperationKind::InternalFence => "fence",
            OperationKind::TraceControl => "trace control",
        };
        f.write_str(name)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_local_id_display() {
        let single = TraceLocalId::new(3);
        assert_eq!(single.to_string(), "op[3]");

        let point = TraceLocalId::new_point(7, DomainPoint::new(&[1, 2]));
        assert_eq!(point.to_string(), "op[7](1,2)");
    }

    #[test]
    fn internal_kinds() {
        assert!(OperationKind::InternalClose.is_internal());
        assert!(OperationKind::InternalRefinement.is_internal());
        assert!(!OperationKind::Task.is_internal());
        assert!(!OperationKind::Copy.is_internal());
    }
}
