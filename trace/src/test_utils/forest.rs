use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use weft_core::{
    CopySrcDstField, Event, ExprId, RegionForest, ReservationId, ShardId, ViewId,
};

use super::MockRuntime;

// MOCK FOREST
// ================================================================================================

/// A region forest over explicit point sets.
///
/// Expressions are interned `BTreeSet<u64>`s, so union/intersection/difference/volume are exact
/// and equal sets share a handle. Pins are counted and asserted balanced by tests.
pub struct MockForest {
    runtime: Option<Arc<MockRuntime>>,
    state: Mutex<ForestState>,
}

#[derive(Default)]
struct ForestState {
    exprs: Vec<BTreeSet<u64>>,
    intern: HashMap<Vec<u64>, ExprId>,
    expr_pins: HashMap<ExprId, i64>,
    view_pins: HashMap<ViewId, i64>,
    view_owners: HashMap<ViewId, ShardId>,
    copies: Vec<IssuedCopy>,
    fills: Vec<IssuedFill>,
}

/// A copy issued through the forest during replay, kept for assertions.
#[derive(Clone, Debug)]
pub struct IssuedCopy {
    pub expr: ExprId,
    pub src_fields: Vec<CopySrcDstField>,
    pub dst_fields: Vec<CopySrcDstField>,
    pub reservations: Vec<(ReservationId, bool)>,
    pub precondition: Event,
    pub completion: Event,
}

#[derive(Clone, Debug)]
pub struct IssuedFill {
    pub expr: ExprId,
    pub dst_fields: Vec<CopySrcDstField>,
    pub fill_value: Vec<u8>,
    pub precondition: Event,
    pub completion: Event,
}

impl MockForest {
    /// A forest with no runtime attached; issuing copies or fills panics.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self { runtime: None, state: Mutex::new(ForestState::default()) })
    }

    /// A forest that issues copies and fills through `runtime`.
    pub fn with_runtime(runtime: Arc<MockRuntime>) -> Arc<Self> {
        Arc::new(Self { runtime: Some(runtime), state: Mutex::new(ForestState::default()) })
    }

    /// Interns the half-open interval `[start, end)`.
    pub fn interval(&self, start: u64, end: u64) -> ExprId {
        self.intern_set((start..end).collect())
    }

    /// Interns an explicit point set.
    pub fn points(&self, points: &[u64]) -> ExprId {
        self.intern_set(points.iter().copied().collect())
    }

    pub fn set_view_owner(&self, view: ViewId, shard: ShardId) {
        self.state.lock().view_owners.insert(view, shard);
    }

    pub fn issued_copies(&self) -> Vec<IssuedCopy> {
        self.state.lock().copies.clone()
    }

    pub fn issued_fills(&self) -> Vec<IssuedFill> {
        self.state.lock().fills.clone()
    }

    /// Asserts that every pin taken on an expression or view has been released.
    pub fn assert_pins_balanced(&self) {
        let state = self.state.lock();
        for (expr, pins) in state.expr_pins.iter() {
            assert_eq!(*pins, 0, "expression x{} has {} outstanding pins", expr.0, pins);
        }
        for (view, pins) in state.view_pins.iter() {
            assert_eq!(*pins, 0, "view v{} has {} outstanding pins", view.0, pins);
        }
    }

    fn intern_set(&self, points: BTreeSet<u64>) -> ExprId {
        if points.is_empty() {
            return ExprId::EMPTY;
        }
        let mut state = self.state.lock();
        let key: Vec<u64> = points.iter().copied().collect();
        if let Some(id) = state.intern.get(&key) {
            return *id;
        }
        state.exprs.push(points);
        let id = ExprId(state.exprs.len() as u64);
        state.intern.insert(key, id);
        id
    }

    fn resolve(&self, expr: ExprId) -> BTreeSet<u64> {
        if expr == ExprId::EMPTY {
            return BTreeSet::new();
        }
        let state = self.state.lock();
        state.exprs[expr.0 as usize - 1].clone()
    }
}

impl RegionForest for MockForest {
    fn union_exprs(&self, a: ExprId, b: ExprId) -> ExprId {
        let result: BTreeSet<u64> = self.resolve(a).union(&self.resolve(b)).copied().collect();
        self.intern_set(result)
    }

    fn intersect_exprs(&self, a: ExprId, b: ExprId) -> ExprId {
        let result: BTreeSet<u64> =
            self.resolve(a).intersection(&self.resolve(b)).copied().collect();
        self.intern_set(result)
    }

    fn subtract_exprs(&self, a: ExprId, b: ExprId) -> ExprId {
        let result: BTreeSet<u64> = self.resolve(a).difference(&self.resolve(b)).copied().collect();
        self.intern_set(result)
    }

    fn expr_volume(&self, expr: ExprId) -> u64 {
        if expr == ExprId::EMPTY {
            return 0;
        }
        let state = self.state.lock();
        state.exprs[expr.0 as usize - 1].len() as u64
    }

    fn pin_expr(&self, expr: ExprId) {
        *self.state.lock().expr_pins.entry(expr).or_insert(0) += 1;
    }

    fn unpin_expr(&self, expr: ExprId) {
        let mut state = self.state.lock();
        let pins = state.expr_pins.entry(expr).or_insert(0);
        *pins -= 1;
        assert!(*pins >= 0, "expression x{} unpinned more often than pinned", expr.0);
    }

    fn pin_view(&self, view: ViewId) {
        *self.state.lock().view_pins.entry(view).or_insert(0) += 1;
    }

    fn unpin_view(&self, view: ViewId) {
        let mut state = self.state.lock();
        let pins = state.view_pins.entry(view).or_insert(0);
        *pins -= 1;
        assert!(*pins >= 0, "view v{} unpinned more often than pinned", view.0);
    }

    fn view_owner_shard(&self, view: ViewId) -> ShardId {
        self.state.lock().view_owners.get(&view).copied().unwrap_or_default()
    }

    fn issue_copy(
        &self,
        expr: ExprId,
        src_fields: &[CopySrcDstField],
        dst_fields: &[CopySrcDstField],
        reservations: &[(ReservationId, bool)],
        precondition: Event,
    ) -> Event {
        let runtime = self.runtime.as_ref().expect("forest has no runtime to issue copies");
        let completion = runtime.derived_event(precondition);
        self.state.lock().copies.push(IssuedCopy {
            expr,
            src_fields: src_fields.to_vec(),
            dst_fields: dst_fields.to_vec(),
            reservations: reservations.to_vec(),
            precondition,
            completion,
        });
        completion
    }

    fn issue_fill(
        &self,
        expr: ExprId,
        dst_fields: &[CopySrcDstField],
        fill_value: &[u8],
        precondition: Event,
    ) -> Event {
        let runtime = self.runtime.as_ref().expect("forest has no runtime to issue fills");
        let completion = runtime.derived_event(precondition);
        self.state.lock().fills.push(IssuedFill {
            expr,
            dst_fields: dst_fields.to_vec(),
            fill_value: fill_value.to_vec(),
            precondition,
            completion,
        });
        completion
    }
}
