use std::{collections::BTreeMap, fmt, sync::Arc};

use weft_core::{ExprId, FieldMask, FieldMaskSet, RegionForest, ViewId};

use crate::errors::ConditionFailure;

// TRACE VIEW SET
// ================================================================================================

/// A field-masked, expression-aware mapping from data views to index-space expressions.
///
/// The set answers "which part of the region does this view hold valid data for, on which
/// fields". Its governing invariant is *one expression per (view, field)*: for any view, the
/// expressions stored for it carry pairwise-disjoint field masks. Every public operation
/// preserves this on exit.
///
/// Stored view and expression handles are pinned in the region forest; pins are released when
/// entries are displaced and when the set is dropped.
pub struct TraceViewSet {
    forest: Arc<dyn RegionForest>,
    /// The expression of the root region this set is scoped to. Any stored expression whose
    /// volume reaches the root volume is canonicalized to this handle.
    region_expr: ExprId,
    views: BTreeMap<ViewId, FieldMaskSet<ExprId>>,
}

impl TraceViewSet {
    pub fn new(forest: Arc<dyn RegionForest>, region_expr: ExprId) -> Self {
        forest.pin_expr(region_expr);
        Self { forest, region_expr, views: BTreeMap::new() }
    }

    pub fn region_expr(&self) -> ExprId {
        self.region_expr
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Iterates every `(view, expr, mask)` triple currently stored.
    pub fn iter(&self) -> impl Iterator<Item = (ViewId, ExprId, &FieldMask)> {
        self.views
            .iter()
            .flat_map(|(view, exprs)| exprs.iter().map(|(expr, mask)| (*view, *expr, mask)))
    }

    // MUTATION
    // --------------------------------------------------------------------------------------------

    /// Records that `view` holds valid data over `expr` for `mask`.
    ///
    /// Fields already present under a different expression are re-homed to a single expression
    /// covering both: the stored one if it already contains `expr`, the incoming one if it
    /// contains the stored one, and their union otherwise. Expressions covering the whole root
    /// region are canonicalized to the region expression by volume comparison.
    pub fn insert(&mut self, view: ViewId, expr: ExprId, mask: FieldMask) {
        if mask.is_empty() {
            return;
        }
        let expr = self.canonicalize(expr);

        // Fields colliding with an existing entry move to the covering expression; the rest of
        // the incoming mask lands on `expr` directly.
        let mut remaining = mask;
        let mut moves: Vec<(ExprId, ExprId, FieldMask)> = Vec::new();
        if let Some(exprs) = self.views.get(&view) {
            for (stored, stored_mask) in exprs.iter() {
                let shared = *stored_mask & mask;
                if shared.is_empty() {
                    continue;
                }
                remaining -= shared;
                if *stored == expr {
                    continue;
                }
                let union = self.canonicalize(self.forest.union_exprs(*stored, expr));
                let union_volume = self.forest.expr_volume(union);
                let merged = if union_volume == self.forest.expr_volume(*stored) {
                    *stored
                } else if union_volume == self.forest.expr_volume(expr) {
                    expr
                } else {
                    union
                };
                if merged != *stored {
                    moves.push((*stored, merged, shared));
                }
            }
        }
        for (from, to, shared) in moves {
            self.remove_entry_fields(view, from, &shared);
            self.add_entry(view, to, shared);
        }
        if !remaining.is_empty() {
            self.add_entry(view, expr, remaining);
        }
    }

    /// Removes `expr` from what `view` holds valid over `mask`.
    ///
    /// Stored expressions fully covered by `expr` lose the affected fields; partially covered
    /// ones keep the difference.
    pub fn invalidate(&mut self, view: ViewId, expr: ExprId, mask: FieldMask) {
        let Some(exprs) = self.views.get(&view) else {
            return;
        };
        if !exprs.valid_fields().overlaps(&mask) {
            return;
        }

        let mut removals: Vec<(ExprId, FieldMask)> = Vec::new();
        let mut rewrites: Vec<(ExprId, ExprId, FieldMask)> = Vec::new();
        for (stored, stored_mask) in exprs.iter() {
            let shared = *stored_mask & mask;
            if shared.is_empty() {
                continue;
            }
            let overlap = self.forest.intersect_exprs(*stored, expr);
            if self.forest.expr_is_empty(overlap) {
                continue;
            }
            let difference = self.forest.subtract_exprs(*stored, expr);
            if self.forest.expr_is_empty(difference) {
                removals.push((*stored, shared));
            } else {
                rewrites.push((*stored, difference, shared));
            }
        }
        for (stored, shared) in removals {
            self.remove_entry_fields(view, stored, &shared);
        }
        for (stored, difference, shared) in rewrites {
            self.remove_entry_fields(view, stored, &shared);
            self.add_entry(view, difference, shared);
        }
    }

    /// Applies [`TraceViewSet::invalidate`] to every view other than `except`.
    pub fn invalidate_all_but(&mut self, except: ViewId, expr: ExprId, mask: FieldMask) {
        let views: Vec<ViewId> = self.views.keys().copied().filter(|v| *v != except).collect();
        for view in views {
            self.invalidate(view, expr, mask);
        }
    }

    // QUERIES
    // --------------------------------------------------------------------------------------------

    /// Splits a query into the fields whose expression is fully covered by the stored entries
    /// and the `(expr, mask)` residues that are not.
    pub fn dominates(
        &self,
        view: ViewId,
        expr: ExprId,
        mask: FieldMask,
    ) -> (FieldMask, Vec<(ExprId, FieldMask)>) {
        let mut dominated = FieldMask::EMPTY;
        let mut residues: Vec<(ExprId, FieldMask)> = Vec::new();
        let Some(exprs) = self.views.get(&view) else {
            return (dominated, vec![(expr, mask)]);
        };

        let mut uncovered = mask;
        for (stored, stored_mask) in exprs.iter() {
            let shared = *stored_mask & mask;
            if shared.is_empty() {
                continue;
            }
            uncovered -= shared;
            let residue = self.forest.subtract_exprs(expr, *stored);
            if self.forest.expr_is_empty(residue) {
                dominated |= shared;
            } else {
                residues.push((residue, shared));
            }
        }
        if !uncovered.is_empty() {
            residues.push((expr, uncovered));
        }
        (dominated, residues)
    }

    /// Removes from `mask` every field that appears in a stored entry whose expression overlaps
    /// `expr`, leaving the fields the query is independent of.
    pub fn filter_independent_fields(&self, expr: ExprId, mask: FieldMask) -> FieldMask {
        let mut independent = mask;
        for (_, exprs) in self.views.iter() {
            if !exprs.valid_fields().overlaps(&independent) {
                continue;
            }
            for (stored, stored_mask) in exprs.iter() {
                if !stored_mask.overlaps(&independent) {
                    continue;
                }
                if self.forest.exprs_overlap(*stored, expr) {
                    independent -= *stored_mask;
                    if independent.is_empty() {
                        return independent;
                    }
                }
            }
        }
        independent
    }

    /// Checks that every entry of `self` is dominated by `other`.
    ///
    /// With `allow_independent`, fields whose *original* entry expression overlaps nothing
    /// stored in `other` also count as dominated; this admits read-only preconditions that no
    /// postcondition rewrites. The independence test deliberately runs against the entry's own
    /// expression, not the dominance residue: the residue is disjoint from the entries that
    /// carved it out, so testing it would wave through any partially rewritten field.
    pub fn subsumed_by(
        &self,
        other: &TraceViewSet,
        allow_independent: bool,
    ) -> Result<(), ConditionFailure> {
        for (view, expr, mask) in self.iter() {
            let (_, residues) = other.dominates(view, expr, *mask);
            for (residue, residue_mask) in residues {
                let failed = if allow_independent {
                    residue_mask - other.filter_independent_fields(expr, residue_mask)
                } else {
                    residue_mask
                };
                if !failed.is_empty() {
                    return Err(ConditionFailure { view, expr: residue, fields: failed });
                }
            }
        }
        Ok(())
    }

    /// Checks that no `(view, field)` pair is stored in both sets with overlapping expressions.
    pub fn independent_of(&self, other: &TraceViewSet) -> Result<(), ConditionFailure> {
        for (view, exprs) in self.views.iter() {
            let Some(other_exprs) = other.views.get(view) else {
                continue;
            };
            if !exprs.valid_fields().overlaps(other_exprs.valid_fields()) {
                continue;
            }
            for (expr, mask) in exprs.iter() {
                for (other_expr, other_mask) in other_exprs.iter() {
                    let shared = *mask & *other_mask;
                    if shared.is_empty() {
                        continue;
                    }
                    if self.forest.exprs_overlap(*expr, *other_expr) {
                        return Err(ConditionFailure { view: *view, expr: *expr, fields: shared });
                    }
                }
            }
        }
        Ok(())
    }

    // TRANSPOSE
    // --------------------------------------------------------------------------------------------

    /// Inverts the mapping to expression ↦ views, splitting overlapping expressions into
    /// pairwise-disjoint pieces so each output expression names a well-defined view set per
    /// field.
    ///
    /// Returned handles are not pinned; callers that store them take their own pins.
    pub fn transpose_uniquely(&self) -> Vec<(ExprId, FieldMaskSet<ViewId>)> {
        let mut out: Vec<(ExprId, FieldMaskSet<ViewId>)> = Vec::new();
        for (view, expr, mask) in self.iter() {
            // Split the incoming expression against every existing key, attributing the view to
            // shared pieces and carrying the remainder forward.
            let mut pending: Vec<ExprId> = vec![expr];
            let mut index = 0;
            while index < out.len() && !pending.is_empty() {
                let key = out[index].0;
                let mut next_pending = Vec::new();
                for piece in pending {
                    let overlap = self.forest.intersect_exprs(piece, key);
                    if self.forest.expr_is_empty(overlap) {
                        next_pending.push(piece);
                        continue;
                    }
                    if self.forest.expr_volume(overlap) == self.forest.expr_volume(key) {
                        // The piece covers the key entirely.
                        out[index].1.insert(view, *mask);
                    } else {
                        // Split the key; both halves keep the previously attributed views.
                        let key_rest = self.forest.subtract_exprs(key, piece);
                        let mut overlap_views = out[index].1.clone();
                        overlap_views.insert(view, *mask);
                        out[index].0 = key_rest;
                        out.push((overlap, overlap_views));
                    }
                    let residue = self.forest.subtract_exprs(piece, key);
                    if !self.forest.expr_is_empty(residue) {
                        next_pending.push(residue);
                    }
                }
                pending = next_pending;
                index += 1;
            }
            for piece in pending {
                let mut views = FieldMaskSet::new();
                views.insert(view, *mask);
                out.push((piece, views));
            }
        }
        out
    }

    // ENTRY BOOKKEEPING
    // --------------------------------------------------------------------------------------------

    fn canonicalize(&self, expr: ExprId) -> ExprId {
        if expr != self.region_expr
            && self.forest.expr_volume(expr) == self.forest.expr_volume(self.region_expr)
        {
            self.region_expr
        } else {
            expr
        }
    }

    fn add_entry(&mut self, view: ViewId, expr: ExprId, mask: FieldMask) {
        let forest = Arc::clone(&self.forest);
        let exprs = self.views.entry(view).or_insert_with(|| {
            forest.pin_view(view);
            FieldMaskSet::new()
        });
        if exprs.insert(expr, mask) {
            forest.pin_expr(expr);
        }
    }

    fn remove_entry_fields(&mut self, view: ViewId, expr: ExprId, mask: &FieldMask) {
        let forest = Arc::clone(&self.forest);
        let Some(exprs) = self.views.get_mut(&view) else {
            return;
        };
        let gone = exprs.get(&expr).is_some_and(|m| (*m - *mask).is_empty());
        exprs.remove(&expr, mask);
        let view_gone = exprs.is_empty();
        if gone {
            forest.unpin_expr(expr);
        }
        if view_gone {
            self.views.remove(&view);
            forest.unpin_view(view);
        }
    }
}

impl Drop for TraceViewSet {
    fn drop(&mut self) {
        for (view, exprs) in self.views.iter() {
            for (expr, _) in exprs.iter() {
                self.forest.unpin_expr(*expr);
            }
            self.forest.unpin_view(*view);
        }
        self.forest.unpin_expr(self.region_expr);
    }
}

impl fmt::Debug for TraceViewSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (view, exprs) in self.views.iter() {
            for (expr, mask) in exprs.iter() {
                map.entry(&format_args!("v{}/x{}", view.0, expr.0), mask);
            }
        }
        map.finish()
    }
}

// TESTS
// ================================================================================================
