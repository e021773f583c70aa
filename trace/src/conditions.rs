//! Pre/anti/post conditions of a captured template, rooted at one region, checked and enforced
//! against the runtime's equivalence sets.

use std::sync::Arc;

use parking_lot::RwLock;
use weft_core::{
    ConditionSetId, EquivalenceSet, ExprId, FieldMask, FieldMaskSet, ParentContext, RegionForest,
    ViewId,
};

use crate::{
    errors::{NotReplayableReason, Replayable},
    view_set::TraceViewSet,
};

// TRACE CONDITION SET
// ================================================================================================

/// The conditions a template imposes on one root region of its footprint.
///
/// After capture the set holds three view sets: *preconditions* (views replay reads), *anti-
/// conditions* (partially valid views replay must not disturb), and *postconditions* (views
/// replay leaves valid). The unique-expression transposes drive the per-expression analyses
/// dispatched before and after a replay.
pub struct TraceConditionSet {
    id: ConditionSetId,
    forest: Arc<dyn RegionForest>,
    root_expr: ExprId,
    preconditions: TraceViewSet,
    anticonditions: TraceViewSet,
    postconditions: TraceViewSet,
    unique_pre: Vec<(ExprId, FieldMaskSet<ViewId>)>,
    unique_anti: Vec<(ExprId, FieldMaskSet<ViewId>)>,
    unique_post: Vec<(ExprId, FieldMaskSet<ViewId>)>,
    subscriptions: RwLock<SubscriptionState>,
}

struct SubscriptionState {
    sets: Vec<(Arc<dyn EquivalenceSet>, FieldMask)>,
    /// Fields whose equivalence sets were filtered by outside activity and need recomputation
    /// before the next test.
    invalid_mask: FieldMask,
}

/// The in-flight result of [`TraceConditionSet::test_require`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionTest {
    precondition_failed: bool,
    anticondition_failed: bool,
}

impl ConditionTest {
    pub fn succeeded(&self) -> bool {
        !self.precondition_failed && !self.anticondition_failed
    }
}

impl TraceConditionSet {
    /// Captures conditions from the equivalence sets recorded under `root_expr` and subscribes
    /// to each of them.
    pub fn capture(
        forest: Arc<dyn RegionForest>,
        root_expr: ExprId,
        sets: Vec<(Arc<dyn EquivalenceSet>, FieldMask)>,
        id: ConditionSetId,
    ) -> Self {
        let mut preconditions = TraceViewSet::new(Arc::clone(&forest), root_expr);
        let mut anticonditions = TraceViewSet::new(Arc::clone(&forest), root_expr);
        let mut postconditions = TraceViewSet::new(Arc::clone(&forest), root_expr);

        for (set, mask) in sets.iter() {
            let captured = set.capture_trace_conditions(set.expression(), mask);
            for entry in captured.preconditions {
                preconditions.insert(entry.view, entry.expr, entry.mask);
            }
            for entry in captured.anticonditions {
                anticonditions.insert(entry.view, entry.expr, entry.mask);
            }
            for entry in captured.postconditions {
                postconditions.insert(entry.view, entry.expr, entry.mask);
            }
            set.subscribe(id, mask);
        }

        let unique_pre = Self::pin_transpose(&forest, preconditions.transpose_uniquely());
        let unique_anti = Self::pin_transpose(&forest, anticonditions.transpose_uniquely());
        let unique_post = Self::pin_transpose(&forest, postconditions.transpose_uniquely());

        Self {
            id,
            forest,
            root_expr,
            preconditions,
            anticonditions,
            postconditions,
            unique_pre,
            unique_anti,
            unique_post,
            subscriptions: RwLock::new(SubscriptionState {
                sets,
                invalid_mask: FieldMask::EMPTY,
            }),
        }
    }

    pub fn root_expr(&self) -> ExprId {
        self.root_expr
    }

    /// Replay is admissible when every precondition is reproduced by the postconditions (with
    /// read-only preconditions admitted through independence) and no postcondition disturbs an
    /// anticondition.
    pub fn is_replayable(&self) -> Replayable {
        if let Err(failure) = self.preconditions.subsumed_by(&self.postconditions, true) {
            return Replayable::No(NotReplayableReason::NotSubsumed(failure));
        }
        if let Err(failure) = self.postconditions.independent_of(&self.anticonditions) {
            return Replayable::No(NotReplayableReason::NotIndependent(failure));
        }
        Replayable::Yes
    }

    /// Dispatches the validity analyses for the current equivalence-set state: preconditions
    /// must have valid instances, anticonditions must not.
    pub fn test_require(&self, parent: &Arc<dyn ParentContext>) -> ConditionTest {
        self.refresh_subscriptions(parent);

        let subscriptions = self.subscriptions.read();
        let mut test = ConditionTest::default();
        'pre: for (expr, views) in self.unique_pre.iter() {
            for (view, mask) in views.iter() {
                if !self.instance_valid(&subscriptions.sets, *view, *expr, mask) {
                    test.precondition_failed = true;
                    break 'pre;
                }
            }
        }
        'anti: for (expr, views) in self.unique_anti.iter() {
            for (view, mask) in views.iter() {
                if self.instance_antivalid(&subscriptions.sets, *view, *expr, mask) {
                    test.anticondition_failed = true;
                    break 'anti;
                }
            }
        }
        test
    }

    /// Reports the outcome of a previously dispatched [`TraceConditionSet::test_require`].
    pub fn check_require(&self, test: ConditionTest) -> bool {
        test.succeeded()
    }

    /// Overwrites the subscribed equivalence sets with the postconditions, one overwrite per
    /// unique expression.
    pub fn ensure(&self) {
        let subscriptions = self.subscriptions.read();
        for (expr, views) in self.unique_post.iter() {
            let entries: Vec<(ViewId, FieldMask)> =
                views.iter().map(|(view, mask)| (*view, *mask)).collect();
            for (set, set_mask) in subscriptions.sets.iter() {
                if !set_mask.overlaps(views.valid_fields()) {
                    continue;
                }
                let covered = self.forest.intersect_exprs(*expr, set.expression());
                if self.forest.expr_is_empty(covered) {
                    continue;
                }
                set.overwrite(covered, &entries);
            }
        }
    }

    /// Marks `mask` fields as needing equivalence-set recomputation before the next test.
    pub fn invalidate_equivalence_sets(&self, mask: &FieldMask) {
        self.subscriptions.write().invalid_mask |= *mask;
    }

    /// Cancels every outstanding subscription. Must run before the condition set is dropped so
    /// equivalence sets hold no dangling back-pointers.
    pub fn cancel_subscriptions(&self) {
        let mut subscriptions = self.subscriptions.write();
        for (set, mask) in subscriptions.sets.drain(..) {
            set.cancel_subscription(self.id, &mask);
        }
    }

    // INTERNAL
    // --------------------------------------------------------------------------------------------

    fn pin_transpose(
        forest: &Arc<dyn RegionForest>,
        transposed: Vec<(ExprId, FieldMaskSet<ViewId>)>,
    ) -> Vec<(ExprId, FieldMaskSet<ViewId>)> {
        for (expr, views) in transposed.iter() {
            forest.pin_expr(*expr);
            for (view, _) in views.iter() {
                forest.pin_view(*view);
            }
        }
        transposed
    }

    /// Re-fetches the equivalence sets for fields invalidated by outside activity.
    fn refresh_subscriptions(&self, parent: &Arc<dyn ParentContext>) {
        let invalid = {
            let subscriptions = self.subscriptions.read();
            subscriptions.invalid_mask
        };
        if invalid.is_empty() {
            return;
        }
        let mut subscriptions = self.subscriptions.write();
        let mut index = 0;
        while index < subscriptions.sets.len() {
            let (set, mask) = &subscriptions.sets[index];
            if mask.overlaps(&invalid) {
                set.cancel_subscription(self.id, mask);
                subscriptions.sets.swap_remove(index);
            } else {
                index += 1;
            }
        }
        for (set, mask) in parent.find_equivalence_sets(self.root_expr, &invalid) {
            set.subscribe(self.id, &mask);
            subscriptions.sets.push((set, mask));
        }
        subscriptions.invalid_mask = FieldMask::EMPTY;
    }

    fn instance_valid(
        &self,
        sets: &[(Arc<dyn EquivalenceSet>, FieldMask)],
        view: ViewId,
        expr: ExprId,
        mask: &FieldMask,
    ) -> bool {
        let mut remaining = *mask;
        for (set, set_mask) in sets {
            let shared = remaining & *set_mask;
            if shared.is_empty() {
                continue;
            }
            let covered = self.forest.intersect_exprs(expr, set.expression());
            if self.forest.expr_is_empty(covered) {
                continue;
            }
            if !set.has_valid_instance(view, covered, &shared) {
                return false;
            }
            remaining -= shared;
        }
        // Fields with no covering equivalence set have no instance to read from.
        remaining.is_empty()
    }

    fn instance_antivalid(
        &self,
        sets: &[(Arc<dyn EquivalenceSet>, FieldMask)],
        view: ViewId,
        expr: ExprId,
        mask: &FieldMask,
    ) -> bool {
        for (set, set_mask) in sets {
            let shared = *mask & *set_mask;
            if shared.is_empty() {
                continue;
            }
            let covered = self.forest.intersect_exprs(expr, set.expression());
            if self.forest.expr_is_empty(covered) {
                continue;
            }
            if set.has_antivalid_instance(view, covered, &shared) {
                return true;
            }
        }
        false
    }
}

impl Drop for TraceConditionSet {
    fn drop(&mut self) {
        // Defensive: teardown should have cancelled already.
        self.cancel_subscriptions();
        for (expr, views) in self
            .unique_pre
            .iter()
            .chain(self.unique_anti.iter())
            .chain(self.unique_post.iter())
        {
            self.forest.unpin_expr(*expr);
            for (view, _) in views.iter() {
                self.forest.unpin_view(*view);
            }
        }
    }
}

// TESTS
// ================================================================================================
