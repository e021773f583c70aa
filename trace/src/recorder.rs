//! Operation-level dependence recording: the dynamic recorder captures dependences on the first
//! execution of a trace and re-registers them on later executions; the static recorder is
//! seeded with caller-supplied dependences and materializes them lazily.

use std::sync::Arc;

use weft_core::{
    DependenceKind, DependenceRecord, Operation, OperationKind, ParentContext, StaticDependence,
    TraceId, UniqueId,
};

use crate::errors::TraceError;

// OPERATION SIGNATURES
// ================================================================================================

/// The structural identity of an operation at a trace index, checked on every replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OperationSignature {
    pub kind: OperationKind,
    pub region_count: usize,
}

fn verify_signature(
    tid: TraceId,
    index: u64,
    recorded: &OperationSignature,
    op: &dyn Operation,
) -> Result<(), TraceError> {
    if recorded.kind != op.kind() || recorded.region_count != op.region_count() {
        return Err(TraceError::StructureViolation {
            tid,
            index,
            recorded_kind: recorded.kind,
            recorded_regions: recorded.region_count,
            observed_kind: op.kind(),
            observed_regions: op.region_count(),
        });
    }
    Ok(())
}

// DYNAMIC RECORDER
// ================================================================================================

/// Records dependences between trace operations on the first execution and replays the
/// registrations on later ones.
pub struct DynamicRecorder {
    signatures: Vec<OperationSignature>,
    /// Per operation index, the deduplicated records of its dependences on earlier indices.
    dependences: Vec<Vec<DependenceRecord>>,
    fixed: bool,
}

impl DynamicRecorder {
    pub fn new() -> Self {
        Self { signatures: Vec::new(), dependences: Vec::new(), fixed: false }
    }

    /// True once the first execution has completed and the recording is frozen.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn fix(&mut self) {
        self.fixed = true;
    }

    pub fn operation_count(&self) -> usize {
        self.signatures.len()
    }

    /// Assigns the next index to `op` while recording, or verifies `op` against its recorded
    /// slot while replaying. Returns the operation's trace index.
    pub fn enter_operation(
        &mut self,
        tid: TraceId,
        index: u64,
        op: &dyn Operation,
    ) -> Result<u64, TraceError> {
        if self.fixed {
            let Some(recorded) = self.signatures.get(index as usize) else {
                return Err(TraceError::StructureViolation {
                    tid,
                    index,
                    recorded_kind: OperationKind::TraceControl,
                    recorded_regions: 0,
                    observed_kind: op.kind(),
                    observed_regions: op.region_count(),
                });
            };
            verify_signature(tid, index, recorded, op)?;
        } else {
            debug_assert_eq!(index as usize, self.signatures.len());
            self.signatures.push(OperationSignature {
                kind: op.kind(),
                region_count: op.region_count(),
            });
            self.dependences.push(Vec::new());
        }
        Ok(index)
    }

    /// Records a dependence of the operation at `next_index` on an earlier index, merging with
    /// an existing record that differs only in fields.
    pub fn record_dependence(&mut self, next_index: u64, record: DependenceRecord) {
        debug_assert!(!self.fixed, "recording into a fixed trace");
        debug_assert!(record.operation_index <= next_index);
        let records = &mut self.dependences[next_index as usize];
        for existing in records.iter_mut() {
            if existing.merges_with(&record) {
                existing.dependent_fields |= record.dependent_fields;
                return;
            }
        }
        records.push(record);
    }

    /// Re-registers the recorded dependences of the operation at `index` with the parent
    /// context. `uids` carries the unique ids of this execution's earlier operations.
    pub fn replay_dependences(
        &self,
        index: u64,
        op: &dyn Operation,
        uids: &[UniqueId],
        parent: &Arc<dyn ParentContext>,
    ) {
        for record in self.dependences[index as usize].iter() {
            // Records kept only for internal-operation inheritance are skipped here.
            if record.kind == DependenceKind::None {
                continue;
            }
            let previous = uids[record.operation_index as usize];
            if record.is_region_level() {
                parent.register_region_dependence(
                    previous,
                    record.previous_requirement,
                    op.unique_id(),
                    record.next_requirement,
                    record.kind,
                    record.validates,
                    &record.dependent_fields,
                );
            } else {
                parent.register_dependence(previous, op.unique_id(), record.kind);
            }
        }
    }

    /// Registers the dependences an internal operation inherits from its creator: the creator's
    /// records filtered to `internal_index`, with `NO_DEPENDENCE` promoted to a true
    /// dependence.
    pub fn replay_internal_dependences(
        &self,
        creator_index: u64,
        internal_index: u32,
        op: &dyn Operation,
        uids: &[UniqueId],
        parent: &Arc<dyn ParentContext>,
    ) {
        for record in self.dependences[creator_index as usize].iter() {
            if record.next_requirement != internal_index {
                continue;
            }
            let kind = match record.kind {
                DependenceKind::None => DependenceKind::True,
                other => other,
            };
            parent.register_region_dependence(
                uids[record.operation_index as usize],
                record.previous_requirement,
                op.unique_id(),
                0,
                kind,
                record.validates,
                &record.dependent_fields,
            );
        }
    }
}

impl Default for DynamicRecorder {
    fn default() -> Self {
        Self::new()
    }
}

// STATIC RECORDER
// ================================================================================================

/// A recorder seeded with caller-supplied dependences before the trace runs.
///
/// Static dependences name fields symbolically and count operations backwards from the
/// dependent one; both are resolved to [`DependenceRecord`]s the first time an index is
/// replayed.
pub struct StaticRecorder {
    static_dependences: Vec<Vec<StaticDependence>>,
    materialized: Vec<Option<Vec<DependenceRecord>>>,
    signatures: Vec<OperationSignature>,
}

impl StaticRecorder {
    pub fn new(static_dependences: Vec<Vec<StaticDependence>>) -> Self {
        let count = static_dependences.len();
        Self {
            static_dependences,
            materialized: vec![None; count],
            signatures: Vec::new(),
        }
    }

    pub fn operation_count(&self) -> usize {
        self.static_dependences.len()
    }

    /// Verifies `op` against the static slot at `index`; the first execution seeds the
    /// signatures.
    pub fn enter_operation(
        &mut self,
        tid: TraceId,
        index: u64,
        op: &dyn Operation,
    ) -> Result<u64, TraceError> {
        if let Some(recorded) = self.signatures.get(index as usize) {
            verify_signature(tid, index, recorded, op)?;
        } else {
            debug_assert_eq!(index as usize, self.signatures.len());
            self.signatures.push(OperationSignature {
                kind: op.kind(),
                region_count: op.region_count(),
            });
        }
        Ok(index)
    }

    /// Registers the dependences of the operation at `index`, materializing the static tuples
    /// on first use.
    pub fn replay_dependences(
        &mut self,
        index: u64,
        op: &dyn Operation,
        uids: &[UniqueId],
        parent: &Arc<dyn ParentContext>,
    ) {
        let records = self.materialize(index, parent);
        for record in records {
            let previous = uids[record.operation_index as usize];
            if record.is_region_level() {
                parent.register_region_dependence(
                    previous,
                    record.previous_requirement,
                    op.unique_id(),
                    record.next_requirement,
                    record.kind,
                    record.validates,
                    &record.dependent_fields,
                );
            } else {
                parent.register_dependence(previous, op.unique_id(), record.kind);
            }
        }
    }

    fn materialize(&mut self, index: u64, parent: &Arc<dyn ParentContext>) -> Vec<DependenceRecord> {
        let slot = &mut self.materialized[index as usize];
        if let Some(records) = slot {
            return records.clone();
        }
        let mut records = Vec::new();
        for dependence in self.static_dependences[index as usize].iter() {
            // Offsets past the start of the trace name operations outside the window; those
            // dependences are handled by the trace fence.
            let Some(previous) = index.checked_sub(dependence.previous_offset) else {
                continue;
            };
            let record = DependenceRecord {
                operation_index: previous,
                previous_requirement: dependence.previous_requirement,
                next_requirement: dependence.current_requirement,
                kind: dependence.kind,
                validates: dependence.validates,
                dependent_fields: parent.resolve_static_fields(&dependence.dependent_fields),
            };
            let merged = records
                .iter_mut()
                .find(|existing: &&mut DependenceRecord| existing.merges_with(&record));
            match merged {
                Some(existing) => existing.dependent_fields |= record.dependent_fields,
                None => records.push(record),
            }
        }
        *slot = Some(records.clone());
        records
    }
}

// RECORDER DISPATCH
// ================================================================================================

/// The per-trace recorder variant.
pub enum TraceRecorder {
    Dynamic(DynamicRecorder),
    Static(StaticRecorder),
}

impl TraceRecorder {
    pub fn enter_operation(
        &mut self,
        tid: TraceId,
        index: u64,
        op: &dyn Operation,
    ) -> Result<u64, TraceError> {
        match self {
            TraceRecorder::Dynamic(recorder) => recorder.enter_operation(tid, index, op),
            TraceRecorder::Static(recorder) => recorder.enter_operation(tid, index, op),
        }
    }

    /// True when dependences must be captured rather than replayed.
    pub fn is_recording(&self) -> bool {
        match self {
            TraceRecorder::Dynamic(recorder) => !recorder.is_fixed(),
            TraceRecorder::Static(_) => false,
        }
    }

    pub fn replay_dependences(
        &mut self,
        index: u64,
        op: &dyn Operation,
        uids: &[UniqueId],
        parent: &Arc<dyn ParentContext>,
    ) {
        match self {
            TraceRecorder::Dynamic(recorder) => {
                recorder.replay_dependences(index, op, uids, parent)
            },
            TraceRecorder::Static(recorder) => {
                recorder.replay_dependences(index, op, uids, parent)
            },
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use weft_core::FieldMask;

    use super::*;
    use crate::test_utils::{MockOperation, MockParentContext, MockRuntime, RecordedDependence};
    use weft_core::ShardId;

    const TID: TraceId = TraceId(7);

    fn region_record(
        previous: u64,
        prev_req: u32,
        next_req: u32,
        kind: DependenceKind,
        fields: &[usize],
    ) -> DependenceRecord {
        DependenceRecord {
            operation_index: previous,
            previous_requirement: prev_req,
            next_requirement: next_req,
            kind,
            validates: false,
            dependent_fields: FieldMask::of(fields),
        }
    }

    #[test]
    fn dynamic_recorder_merges_field_masks() {
        let mut recorder = DynamicRecorder::new();
        let runtime = MockRuntime::new(ShardId(0));
        for index in 0..2 {
            let op = MockOperation::task(&runtime, index);
            recorder.enter_operation(TID, index, op.as_ref()).unwrap();
        }
        recorder.record_dependence(1, region_record(0, 0, 0, DependenceKind::True, &[0]));
        recorder.record_dependence(1, region_record(0, 0, 0, DependenceKind::True, &[1]));
        recorder.record_dependence(1, region_record(0, 0, 1, DependenceKind::Anti, &[0]));

        assert_eq!(recorder.dependences[1].len(), 2);
        assert_eq!(recorder.dependences[1][0].dependent_fields, FieldMask::of(&[0, 1]));
    }

    #[test]
    fn replay_registers_recorded_dependences() {
        let runtime = MockRuntime::new(ShardId(0));
        let parent = MockParentContext::new();
        let parent_dyn: Arc<dyn ParentContext> = parent.clone();

        let mut recorder = DynamicRecorder::new();
        let first = MockOperation::task(&runtime, 0);
        let second = MockOperation::task(&runtime, 1);
        recorder.enter_operation(TID, 0, first.as_ref()).unwrap();
        recorder.enter_operation(TID, 1, second.as_ref()).unwrap();
        recorder.record_dependence(1, region_record(0, 0, 1, DependenceKind::True, &[2]));
        recorder.fix();

        // Second execution: fresh operations, same structure.
        let first_replay = MockOperation::task(&runtime, 0);
        let second_replay = MockOperation::task(&runtime, 1);
        recorder.enter_operation(TID, 0, first_replay.as_ref()).unwrap();
        recorder.enter_operation(TID, 1, second_replay.as_ref()).unwrap();

        let uids = vec![first_replay.unique_id(), second_replay.unique_id()];
        recorder.replay_dependences(1, second_replay.as_ref(), &uids, &parent_dyn);

        assert_eq!(parent.dependences(), vec![RecordedDependence {
            previous: first_replay.unique_id(),
            previous_requirement: Some(0),
            next: second_replay.unique_id(),
            next_requirement: Some(1),
            kind: DependenceKind::True,
            validates: false,
            dependent_fields: FieldMask::of(&[2]),
        }]);
    }

    #[test]
    fn replay_rejects_structural_mismatch() {
        let runtime = MockRuntime::new(ShardId(0));
        let mut recorder = DynamicRecorder::new();
        let op = MockOperation::task(&runtime, 0);
        recorder.enter_operation(TID, 0, op.as_ref()).unwrap();
        recorder.fix();

        let copy = MockOperation::with_kind(&runtime, 0, OperationKind::Copy, 2);
        let err = recorder.enter_operation(TID, 0, copy.as_ref()).unwrap_err();
        assert_eq!(err, TraceError::StructureViolation {
            tid: TID,
            index: 0,
            recorded_kind: OperationKind::Task,
            recorded_regions: 1,
            observed_kind: OperationKind::Copy,
            observed_regions: 2,
        });
    }

    #[test]
    fn internal_operations_promote_no_dependence() {
        let runtime = MockRuntime::new(ShardId(0));
        let parent = MockParentContext::new();
        let parent_dyn: Arc<dyn ParentContext> = parent.clone();

        let mut recorder = DynamicRecorder::new();
        let producer = MockOperation::task(&runtime, 0);
        let consumer = MockOperation::task(&runtime, 1);
        recorder.enter_operation(TID, 0, producer.as_ref()).unwrap();
        recorder.enter_operation(TID, 1, consumer.as_ref()).unwrap();
        recorder.record_dependence(1, region_record(0, 0, 0, DependenceKind::None, &[0]));
        recorder.record_dependence(1, region_record(0, 1, 1, DependenceKind::Anti, &[1]));
        recorder.fix();

        let close = MockOperation::with_kind(&runtime, 1, OperationKind::InternalClose, 1);
        let uids = vec![producer.unique_id(), consumer.unique_id()];
        recorder.replay_internal_dependences(1, 0, close.as_ref(), &uids, &parent_dyn);

        let registered = parent.dependences();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].kind, DependenceKind::True);
        assert_eq!(registered[0].previous, producer.unique_id());
        assert_eq!(registered[0].next, close.unique_id());
    }

    #[test]
    fn static_recorder_materializes_lazily() {
        let runtime = MockRuntime::new(ShardId(0));
        let parent = MockParentContext::new();
        let parent_dyn: Arc<dyn ParentContext> = parent.clone();

        let deps = vec![
            vec![],
            vec![StaticDependence {
                previous_offset: 1,
                previous_requirement: 0,
                current_requirement: 0,
                kind: DependenceKind::True,
                validates: false,
                dependent_fields: vec![3, 4],
            }],
        ];
        let mut recorder = StaticRecorder::new(deps);

        let first = MockOperation::task(&runtime, 0);
        let second = MockOperation::task(&runtime, 1);
        recorder.enter_operation(TID, 0, first.as_ref()).unwrap();
        recorder.enter_operation(TID, 1, second.as_ref()).unwrap();

        let uids = vec![first.unique_id(), second.unique_id()];
        recorder.replay_dependences(1, second.as_ref(), &uids, &parent_dyn);

        let registered = parent.dependences();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].dependent_fields, FieldMask::of(&[3, 4]));
        assert!(recorder.materialized[1].is_some());
    }
}
