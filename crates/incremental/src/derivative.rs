//! The relation differentiator.
//!
//! Given a root expression, `RelationDifferentiator::derivative` walks the
//! tree once and produces a `Derivative`: the set of leaf variables the root
//! depends on, the select predicates bounding each variable's reachable
//! region, and an accumulator for base-level changes. After changes are
//! recorded, `change()` builds the root's `(added, removed)` pair as lazy
//! relations in the same algebra. No part of the tree is re-evaluated
//! wholesale; operand state before the change is reconstructed
//! algebraically from the recorded deltas.

use crate::consistency::provably_inconsistent;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use ravel_core::{Renames, Result, Row, SelectExpression};
use ravel_relation::{
    ChangeAccumulator, Operator, Relation, RelationChange, RelationId, RelationView,
};

/// Builds derivatives for root expressions.
pub struct RelationDifferentiator;

impl RelationDifferentiator {
    /// Walks the expression tree and prepares its derivative.
    pub fn derivative(root: &Relation) -> Derivative {
        let mut variables = HashMap::new();
        let mut filters: HashMap<RelationId, Vec<Option<SelectExpression>>> = HashMap::new();
        collect_variables(root, None, &mut variables, &mut filters);
        Derivative {
            root: root.clone(),
            variables,
            filters,
            changes: Mutex::new(HashMap::new()),
        }
    }
}

/// Accumulates filter predicates down one path of the tree. `None` means the
/// path is unfiltered (a mutation can never be proven irrelevant through
/// it).
fn collect_variables(
    relation: &Relation,
    filter: Option<SelectExpression>,
    variables: &mut HashMap<RelationId, Relation>,
    filters: &mut HashMap<RelationId, Vec<Option<SelectExpression>>>,
) {
    match relation.view() {
        RelationView::Source(_) => {
            variables.insert(relation.id(), relation.clone());
            filters.entry(relation.id()).or_default().push(filter);
        }
        RelationView::Derived { op, left, right } => {
            let child_filter = match op {
                Operator::Select(predicate) => Some(match filter {
                    Some(existing) => existing.and(predicate.clone()),
                    None => predicate.clone(),
                }),
                // Translate the filter back through the rename so it speaks
                // the variable's attribute names.
                Operator::Rename(renames) => filter.map(|f| f.renamed(&invert(renames))),
                // These operators can change which rows are visible in ways
                // a per-attribute equality cannot bound; drop the filter.
                Operator::Aggregate(_)
                | Operator::Otherwise
                | Operator::Unique { .. } => None,
                // An update rewrites the attributes it names; a filter
                // mentioning one of them no longer constrains the operand.
                Operator::Update(new_values) => filter.filter(|f| {
                    !f.attributes()
                        .iter()
                        .any(|a| new_values.scheme().contains(a))
                }),
                _ => filter,
            };
            collect_variables(left, child_filter.clone(), variables, filters);
            if let Some(right) = right {
                collect_variables(right, child_filter, variables, filters);
            }
        }
    }
}

fn invert(renames: &Renames) -> Renames {
    renames.iter().map(|(k, v)| (v.clone(), k.clone())).collect()
}

/// The derivative of a root expression: per-variable recorded changes plus
/// the machinery to turn them into the root's delta.
pub struct Derivative {
    root: Relation,
    variables: HashMap<RelationId, Relation>,
    filters: HashMap<RelationId, Vec<Option<SelectExpression>>>,
    changes: Mutex<HashMap<RelationId, ChangeAccumulator>>,
}

impl Derivative {
    /// The root expression this derivative serves.
    pub fn root(&self) -> &Relation {
        &self.root
    }

    /// The leaf variables reachable from the root.
    pub fn variables(&self) -> Vec<Relation> {
        self.variables.values().cloned().collect()
    }

    /// Returns true if the given base relation is one of the root's
    /// variables.
    pub fn has_variable(&self, id: RelationId) -> bool {
        self.variables.contains_key(&id)
    }

    /// Decides whether a mutation described by `predicate` on `variable` can
    /// affect the root. `None` means the mutation is unbounded (always
    /// relevant). The answer errs on the side of relevance: only a mutation
    /// provably inconsistent with the filters of every path to the variable
    /// is skipped.
    pub fn mutation_may_affect(
        &self,
        variable: RelationId,
        predicate: Option<&SelectExpression>,
    ) -> bool {
        if !self.variables.contains_key(&variable) {
            return false;
        }
        let predicate = match predicate {
            Some(p) => p,
            None => return true,
        };
        let paths = match self.filters.get(&variable) {
            Some(paths) => paths,
            None => return true,
        };
        paths.iter().any(|path| match path {
            Some(filter) => !provably_inconsistent(predicate, filter),
            None => true,
        })
    }

    /// Records a base-level change on one of the variables.
    pub fn add_change(&self, variable: RelationId, change: &RelationChange) -> Result<()> {
        let scheme = match self.variables.get(&variable) {
            Some(relation) => relation.scheme().clone(),
            None => return Ok(()),
        };
        let mut changes = self.changes.lock();
        changes
            .entry(variable)
            .or_insert_with(|| ChangeAccumulator::new(scheme))
            .record(change)
    }

    /// Discards all recorded changes. Called after each batch executes.
    pub fn clear(&self) {
        self.changes.lock().clear();
    }

    /// Returns true if any variable has a pending recorded change.
    pub fn has_changes(&self) -> bool {
        self.changes.lock().values().any(|acc| !acc.is_empty())
    }

    /// Builds the root's `(added, removed)` delta from the recorded changes
    /// without re-evaluating the tree. Returns `None` when nothing changed.
    pub fn change(&self) -> Result<Option<RelationChange>> {
        let changes = self.changes.lock();
        let leaf_changes: HashMap<RelationId, (HashSet<Row>, HashSet<Row>)> = changes
            .iter()
            .filter(|(_, acc)| !acc.is_empty())
            .map(|(id, acc)| (*id, (acc.added().clone(), acc.removed().clone())))
            .collect();
        drop(changes);

        if leaf_changes.is_empty() {
            return Ok(None);
        }

        let mut builder = DeltaBuilder {
            leaf_changes,
            prestates: HashMap::new(),
            deltas: HashMap::new(),
        };
        let delta = builder.node_delta(&self.root)?;
        if delta.added.is_none() && delta.removed.is_none() {
            return Ok(None);
        }
        Ok(Some(RelationChange::new(delta.added, delta.removed)))
    }
}

/// The (added, removed) pair for one node; `None` sides are empty.
#[derive(Clone)]
struct Delta {
    added: Option<Relation>,
    removed: Option<Relation>,
}

impl Delta {
    fn empty() -> Self {
        Self {
            added: None,
            removed: None,
        }
    }
}

struct DeltaBuilder {
    leaf_changes: HashMap<RelationId, (HashSet<Row>, HashSet<Row>)>,
    prestates: HashMap<RelationId, Relation>,
    deltas: HashMap<RelationId, Delta>,
}

impl DeltaBuilder {
    fn subtree_changed(&self, relation: &Relation) -> bool {
        match relation.view() {
            RelationView::Source(_) => self.leaf_changes.contains_key(&relation.id()),
            RelationView::Derived { left, right, .. } => {
                self.subtree_changed(left)
                    || right.map(|r| self.subtree_changed(r)).unwrap_or(false)
            }
        }
    }

    /// Rebuilds the expression as it stood before the recorded changes:
    /// each changed leaf `V` becomes `(V - added) + removed`.
    fn prestate(&mut self, relation: &Relation) -> Result<Relation> {
        if let Some(cached) = self.prestates.get(&relation.id()) {
            return Ok(cached.clone());
        }
        if !self.subtree_changed(relation) {
            return Ok(relation.clone());
        }

        let result = match relation.view() {
            RelationView::Source(_) => {
                let (added, removed) = &self.leaf_changes[&relation.id()];
                let scheme = relation.scheme().clone();
                let mut pre = relation.clone();
                if !added.is_empty() {
                    let added = Relation::with_rows(scheme.clone(), added.iter().cloned())?;
                    pre = pre.difference(&added)?;
                }
                if !removed.is_empty() {
                    let removed = Relation::with_rows(scheme, removed.iter().cloned())?;
                    pre = pre.union(&removed)?;
                }
                pre
            }
            RelationView::Derived { op, left, right } => {
                let pre_left = self.prestate(left)?;
                let pre_right = match right {
                    Some(r) => Some(self.prestate(r)?),
                    None => None,
                };
                Relation::derived(op.clone(), pre_left, pre_right)?
            }
        };
        self.prestates.insert(relation.id(), result.clone());
        Ok(result)
    }

    fn node_delta(&mut self, relation: &Relation) -> Result<Delta> {
        if let Some(cached) = self.deltas.get(&relation.id()) {
            return Ok(cached.clone());
        }
        if !self.subtree_changed(relation) {
            return Ok(Delta::empty());
        }

        let delta = match relation.view() {
            RelationView::Source(_) => {
                let (added, removed) = self.leaf_changes[&relation.id()].clone();
                let scheme = relation.scheme().clone();
                Delta {
                    added: if added.is_empty() {
                        None
                    } else {
                        Some(Relation::with_rows(scheme.clone(), added)?)
                    },
                    removed: if removed.is_empty() {
                        None
                    } else {
                        Some(Relation::with_rows(scheme, removed)?)
                    },
                }
            }
            RelationView::Derived { op, left, right } => {
                let op = op.clone();
                let left = left.clone();
                let right = right.cloned();
                self.derived_delta(relation, &op, &left, right.as_ref())?
            }
        };
        self.deltas.insert(relation.id(), delta.clone());
        Ok(delta)
    }

    fn derived_delta(
        &mut self,
        node: &Relation,
        op: &Operator,
        left: &Relation,
        right: Option<&Relation>,
    ) -> Result<Delta> {
        match op {
            Operator::Union => {
                let da = self.node_delta(left)?;
                let db = self.node_delta(right.expect("union is binary"))?;
                let node_pre = self.prestate(node)?;

                let added_raw = union_opt(da.added, db.added)?;
                let added = difference_opt(added_raw, Some(node_pre))?;

                let removed_raw = union_opt(da.removed, db.removed)?;
                let removed = difference_opt(removed_raw, Some(node.clone()))?;
                Ok(Delta { added, removed })
            }
            Operator::Intersection => {
                let right = right.expect("intersection is binary");
                let da = self.node_delta(left)?;
                let db = self.node_delta(right)?;
                let pre_left = self.prestate(left)?;
                let pre_right = self.prestate(right)?;
                let node_pre = self.prestate(node)?;

                let added_raw = union_opt(
                    intersection_opt(da.added, Some(right.clone()))?,
                    intersection_opt(db.added, Some(left.clone()))?,
                )?;
                let added = difference_opt(added_raw, Some(node_pre))?;

                let removed_raw = union_opt(
                    intersection_opt(da.removed, Some(pre_right))?,
                    intersection_opt(db.removed, Some(pre_left))?,
                )?;
                let removed = difference_opt(removed_raw, Some(node.clone()))?;
                Ok(Delta { added, removed })
            }
            Operator::Difference => {
                let right = right.expect("difference is binary");
                let da = self.node_delta(left)?;
                let db = self.node_delta(right)?;
                let pre_left = self.prestate(left)?;
                let pre_right = self.prestate(right)?;

                // d(A - B).added = (dA.added - B_after) + (A_before & dB.removed)
                let added = union_opt(
                    difference_opt(da.added, Some(right.clone()))?,
                    intersection_opt(db.removed, Some(pre_left))?,
                )?;
                // d(A - B).removed = (dA.removed - B_before) + (A_after & dB.added)
                let removed = union_opt(
                    difference_opt(da.removed, Some(pre_right))?,
                    intersection_opt(db.added, Some(left.clone()))?,
                )?;
                Ok(Delta { added, removed })
            }
            Operator::Project(scheme) => {
                let dr = self.node_delta(left)?;
                let pre = self.prestate(left)?;

                // A projected addition only surfaces if its image was not
                // there before; a projected removal only counts if its image
                // is gone afterwards.
                let added = difference_opt(
                    project_opt(dr.added, scheme)?,
                    Some(pre.project(scheme.clone())?),
                )?;
                let removed = difference_opt(
                    project_opt(dr.removed, scheme)?,
                    Some(left.project(scheme.clone())?),
                )?;
                Ok(Delta { added, removed })
            }
            Operator::Select(predicate) => {
                let dr = self.node_delta(left)?;
                Ok(Delta {
                    added: select_opt(dr.added, predicate)?,
                    removed: select_opt(dr.removed, predicate)?,
                })
            }
            Operator::Rename(renames) => {
                let dr = self.node_delta(left)?;
                Ok(Delta {
                    added: rename_opt(dr.added, renames)?,
                    removed: rename_opt(dr.removed, renames)?,
                })
            }
            Operator::Equijoin(matching) => {
                let right = right.expect("equijoin is binary");
                let da = self.node_delta(left)?;
                let db = self.node_delta(right)?;
                let pre_left = self.prestate(left)?;
                let pre_right = self.prestate(right)?;

                // added = dA.added ⋈ B_after ∪ A_before ⋈ dB.added
                let added = union_opt(
                    join_left_opt(da.added, right, matching)?,
                    join_right_opt(&pre_left, db.added, matching)?,
                )?;
                // removed = dA.removed ⋈ B_before ∪ A_after ⋈ dB.removed
                let removed = union_opt(
                    join_left_opt(da.removed, &pre_right, matching)?,
                    join_right_opt(left, db.removed, matching)?,
                )?;
                Ok(Delta { added, removed })
            }
            // Aggregates do not decompose incrementally: recompute the tiny
            // result from the pre and post states.
            Operator::Aggregate(_) | Operator::Unique { .. } => self.recomputed_delta(node),
            Operator::Otherwise => {
                let left_pre = self.prestate(left)?;
                let pre_empty = left_pre.is_empty()?;
                let post_empty = left.is_empty()?;
                if pre_empty != post_empty {
                    // The active branch flipped: recompute across the
                    // transition boundary.
                    self.recomputed_delta(node)
                } else if post_empty {
                    self.node_delta(right.expect("otherwise is binary"))
                } else {
                    self.node_delta(left)
                }
            }
            Operator::Update(new_values) => {
                let dr = self.node_delta(left)?;
                let pre = self.prestate(left)?;

                let added = difference_opt(
                    update_opt(dr.added, new_values)?,
                    Some(pre.updating(new_values.clone())?),
                )?;
                let removed = difference_opt(
                    update_opt(dr.removed, new_values)?,
                    Some(left.updating(new_values.clone())?),
                )?;
                Ok(Delta { added, removed })
            }
        }
    }

    fn recomputed_delta(&mut self, node: &Relation) -> Result<Delta> {
        let pre = self.prestate(node)?;
        Ok(Delta {
            added: Some(node.difference(&pre)?),
            removed: Some(pre.difference(node)?),
        })
    }
}

// ===== option-lifted combinators (None means the empty relation) =====

fn union_opt(a: Option<Relation>, b: Option<Relation>) -> Result<Option<Relation>> {
    Ok(match (a, b) {
        (Some(a), Some(b)) => Some(a.union(&b)?),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    })
}

fn intersection_opt(a: Option<Relation>, b: Option<Relation>) -> Result<Option<Relation>> {
    Ok(match (a, b) {
        (Some(a), Some(b)) => Some(a.intersection(&b)?),
        _ => None,
    })
}

fn difference_opt(a: Option<Relation>, b: Option<Relation>) -> Result<Option<Relation>> {
    Ok(match (a, b) {
        (Some(a), Some(b)) => Some(a.difference(&b)?),
        (a, None) => a,
        (None, _) => None,
    })
}

fn project_opt(a: Option<Relation>, scheme: &ravel_core::Scheme) -> Result<Option<Relation>> {
    Ok(match a {
        Some(a) => Some(a.project(scheme.clone())?),
        None => None,
    })
}

fn select_opt(a: Option<Relation>, predicate: &SelectExpression) -> Result<Option<Relation>> {
    Ok(match a {
        Some(a) => Some(a.select(predicate.clone())?),
        None => None,
    })
}

fn rename_opt(a: Option<Relation>, renames: &Renames) -> Result<Option<Relation>> {
    Ok(match a {
        Some(a) => Some(a.rename(renames.clone())?),
        None => None,
    })
}

fn update_opt(a: Option<Relation>, new_values: &Row) -> Result<Option<Relation>> {
    Ok(match a {
        Some(a) => Some(a.updating(new_values.clone())?),
        None => None,
    })
}

fn join_left_opt(
    a: Option<Relation>,
    b: &Relation,
    matching: &ravel_relation::JoinMatching,
) -> Result<Option<Relation>> {
    Ok(match a {
        Some(a) => Some(a.equijoin(b, matching.clone())?),
        None => None,
    })
}

fn join_right_opt(
    a: &Relation,
    b: Option<Relation>,
    matching: &ravel_relation::JoinMatching,
) -> Result<Option<Relation>> {
    Ok(match b {
        Some(b) => Some(a.equijoin(&b, matching.clone())?),
        None => None,
    })
}
