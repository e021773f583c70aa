use core::fmt;

use crate::{FieldMask, ReductionOpId, ShardId};

// PRIVILEGE & USAGE
// ================================================================================================

/// The privilege an operation holds on a region requirement.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Privilege {
    /// No access; carried by structural requirements only.
    #[default]
    None,
    ReadOnly,
    ReadWrite,
    /// Write access that discards previous contents.
    WriteDiscard,
    /// Reduction access with a specific reduction operator.
    Reduce,
}

/// A field-independent summary of how an operation accesses a view.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Usage {
    pub privilege: Privilege,
    pub redop: ReductionOpId,
}

impl Usage {
    pub fn read_only() -> Self {
        Self { privilege: Privilege::ReadOnly, redop: ReductionOpId::NONE }
    }

    pub fn read_write() -> Self {
        Self { privilege: Privilege::ReadWrite, redop: ReductionOpId::NONE }
    }

    pub fn write_discard() -> Self {
        Self { privilege: Privilege::WriteDiscard, redop: ReductionOpId::NONE }
    }

    pub fn reduce(redop: ReductionOpId) -> Self {
        Self { privilege: Privilege::Reduce, redop }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.privilege, Privilege::ReadOnly)
    }

    pub fn is_write(&self) -> bool {
        matches!(self.privilege, Privilege::ReadWrite | Privilege::WriteDiscard)
    }

    pub fn is_reduce(&self) -> bool {
        matches!(self.privilege, Privilege::Reduce)
    }

    /// The usual access compatibility table: two reads never conflict, two reductions with the
    /// same operator never conflict, and everything else does. `None` privileges never conflict
    /// with anything.
    pub fn conflicts_with(&self, other: &Usage) -> bool {
        match (self.privilege, other.privilege) {
            (Privilege::None, _) | (_, Privilege::None) => false,
            (Privilege::ReadOnly, Privilege::ReadOnly) => false,
            (Privilege::Reduce, Privilege::Reduce) => self.redop != other.redop,
            _ => true,
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.privilege {
            Privilege::None => f.write_str("none"),
            Privilege::ReadOnly => f.write_str("ro"),
            Privilege::ReadWrite => f.write_str("rw"),
            Privilege::WriteDiscard => f.write_str("wd"),
            Privilege::Reduce => write!(f, "red({})", self.redop.0),
        }
    }
}

// DEPENDENCE TYPES
// ================================================================================================

/// The kind of an inter-operation dependence discovered by the dependence analysis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DependenceKind {
    /// No dependence between the requirements; recorded so that internal operations can promote
    /// it when they inherit their creator's records.
    None,
    /// Read-after-write or write-after-write.
    True,
    /// Write-after-read.
    Anti,
    /// Serialized by a reservation rather than an event chain.
    Atomic,
    /// Mapped concurrently by agreement.
    Simultaneous,
}

/// One recorded dependence of a trace operation on an earlier one.
///
/// `operation_index` names the earlier operation; the requirement indexes refine the dependence
/// to a pair of region requirements when both are region-level (`u32::MAX` marks an
/// operation-level dependence with no requirement refinement).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependenceRecord {
    pub operation_index: u64,
    pub previous_requirement: u32,
    pub next_requirement: u32,
    pub kind: DependenceKind,
    pub validates: bool,
    pub dependent_fields: FieldMask,
}

impl DependenceRecord {
    pub const NO_REQUIREMENT: u32 = u32::MAX;

    /// An operation-level dependence that carries no requirement pair or fields.
    pub fn operation_level(operation_index: u64, kind: DependenceKind) -> Self {
        Self {
            operation_index,
            previous_requirement: Self::NO_REQUIREMENT,
            next_requirement: Self::NO_REQUIREMENT,
            kind,
            validates: false,
            dependent_fields: FieldMask::EMPTY,
        }
    }

    pub fn is_region_level(&self) -> bool {
        self.previous_requirement != Self::NO_REQUIREMENT
            && self.next_requirement != Self::NO_REQUIREMENT
    }

    /// Two records merge when they differ only in fields.
    pub fn merges_with(&self, other: &DependenceRecord) -> bool {
        self.operation_index == other.operation_index
            && self.previous_requirement == other.previous_requirement
            && self.next_requirement == other.next_requirement
            && self.kind == other.kind
            && self.validates == other.validates
    }
}

/// A dependence supplied up front to a static trace, before field spaces are resolved.
///
/// `previous_offset` counts operations backwards from the dependent one. Field names are
/// resolved to a [`FieldMask`] lazily on first use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticDependence {
    pub previous_offset: u64,
    pub previous_requirement: u32,
    pub current_requirement: u32,
    pub kind: DependenceKind,
    pub validates: bool,
    pub dependent_fields: Vec<u32>,
}

// VIEW USER
// ================================================================================================

/// One recorded use of a data view by a trace operation.
///
/// `user` is the event slot holding the using operation's completion inside the owning template;
/// `owner_shard` names the shard whose template allocated that slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewUser {
    pub usage: Usage,
    pub user: usize,
    pub expr: crate::ExprId,
    pub mask: FieldMask,
    pub owner_shard: ShardId,
}

// TESTS
// ================================================================================================
