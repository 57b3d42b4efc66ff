//! Relation changes: the (added, removed) delta delivered to observers.

use crate::relation::Relation;
use hashbrown::HashSet;
use ravel_core::{Result, Row, Scheme};

/// The precise delta of a mutation or derivative: rows that appeared and
/// rows that disappeared. Either side may be absent (meaning empty); the
/// relations are evaluated lazily like any other.
#[derive(Clone, Debug)]
pub struct RelationChange {
    pub added: Option<Relation>,
    pub removed: Option<Relation>,
}

impl RelationChange {
    /// Creates a change from optional added/removed relations.
    pub fn new(added: Option<Relation>, removed: Option<Relation>) -> Self {
        Self { added, removed }
    }

    /// Creates a change from concrete row sets over the given scheme.
    pub fn from_rows<A, R>(scheme: &Scheme, added: A, removed: R) -> Result<Self>
    where
        A: IntoIterator<Item = Row>,
        R: IntoIterator<Item = Row>,
    {
        let added: Vec<Row> = added.into_iter().collect();
        let removed: Vec<Row> = removed.into_iter().collect();
        Ok(Self {
            added: if added.is_empty() {
                None
            } else {
                Some(Relation::with_rows(scheme.clone(), added)?)
            },
            removed: if removed.is_empty() {
                None
            } else {
                Some(Relation::with_rows(scheme.clone(), removed)?)
            },
        })
    }

    /// Evaluates the added side to a row set (empty when absent).
    pub fn added_rows(&self) -> Result<HashSet<Row>> {
        match &self.added {
            Some(relation) => relation.contents(),
            None => Ok(HashSet::new()),
        }
    }

    /// Evaluates the removed side to a row set (empty when absent).
    pub fn removed_rows(&self) -> Result<HashSet<Row>> {
        match &self.removed {
            Some(relation) => relation.contents(),
            None => Ok(HashSet::new()),
        }
    }

    /// Returns true if both sides evaluate to nothing.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.added_rows()?.is_empty() && self.removed_rows()?.is_empty())
    }
}

/// Accumulates a sequence of changes into one net change, cancelling a
/// removal against a prior addition of the same row and vice versa.
#[derive(Clone, Debug)]
pub struct ChangeAccumulator {
    scheme: Scheme,
    added: HashSet<Row>,
    removed: HashSet<Row>,
}

impl ChangeAccumulator {
    /// Creates an empty accumulator for changes over the given scheme.
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            added: HashSet::new(),
            removed: HashSet::new(),
        }
    }

    /// Folds in one change's rows. Removals are applied before additions,
    /// matching how an update replaces a row.
    pub fn record(&mut self, change: &RelationChange) -> Result<()> {
        let removed = change.removed_rows()?;
        let added = change.added_rows()?;
        self.record_rows(added, removed);
        Ok(())
    }

    /// Folds in raw added/removed row sets.
    pub fn record_rows<A, R>(&mut self, added: A, removed: R)
    where
        A: IntoIterator<Item = Row>,
        R: IntoIterator<Item = Row>,
    {
        for row in removed {
            if !self.added.remove(&row) {
                self.removed.insert(row);
            }
        }
        for row in added {
            if !self.removed.remove(&row) {
                self.added.insert(row);
            }
        }
    }

    /// The net added rows so far.
    pub fn added(&self) -> &HashSet<Row> {
        &self.added
    }

    /// The net removed rows so far.
    pub fn removed(&self) -> &HashSet<Row> {
        &self.removed
    }

    /// Returns true if everything cancelled out.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Discards the accumulated rows.
    pub fn clear(&mut self) {
        self.added.clear();
        self.removed.clear();
    }

    /// Converts the net rows into a `RelationChange`.
    pub fn to_change(&self) -> Result<RelationChange> {
        RelationChange::from_rows(
            &self.scheme,
            self.added.iter().cloned(),
            self.removed.iter().cloned(),
        )
    }
}
