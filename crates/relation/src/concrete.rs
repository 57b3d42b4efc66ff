//! Concrete relations: in-memory sets of rows.
//!
//! `ConcreteTable` is the baseline base-relation implementation: a scheme,
//! a set of rows behind a lock, and an observer registry notified with the
//! precise delta of every mutation.

use crate::change::RelationChange;
use crate::observer::ObserverRegistry;
use crate::relation::{next_relation_id, Relation, RelationId, Source};
use hashbrown::HashSet;
use parking_lot::RwLock;
use ravel_core::{Error, Result, Row, Scheme, SelectExpression};
use std::any::Any;
use std::sync::Arc;

/// An in-memory base relation.
pub struct ConcreteTable {
    id: RelationId,
    scheme: Scheme,
    rows: RwLock<HashSet<Row>>,
    observers: ObserverRegistry,
}

impl ConcreteTable {
    /// Creates an empty table with the given scheme.
    pub fn new(scheme: Scheme) -> Self {
        Self {
            id: next_relation_id(),
            scheme,
            rows: RwLock::new(HashSet::new()),
            observers: ObserverRegistry::new(),
        }
    }

    /// Creates a table seeded with rows, validating them against the scheme.
    pub fn with_rows<I: IntoIterator<Item = Row>>(scheme: Scheme, rows: I) -> Result<Self> {
        let table = Self::new(scheme);
        {
            let mut set = table.rows.write();
            for row in rows {
                table.check_row(&row)?;
                set.insert(row);
            }
        }
        Ok(table)
    }

    fn check_row(&self, row: &Row) -> Result<()> {
        if !row.satisfies(&self.scheme) {
            return Err(Error::scheme_violation(format!(
                "row attributes do not match the scheme {:?}",
                self.scheme
            )));
        }
        Ok(())
    }

    /// Replaces the contents wholesale, notifying observers with the delta.
    pub fn replace_rows(&self, new_rows: HashSet<Row>) -> Result<()> {
        for row in &new_rows {
            self.check_row(row)?;
        }
        let (added, removed) = {
            let mut rows = self.rows.write();
            let added: Vec<Row> = new_rows.difference(&rows).cloned().collect();
            let removed: Vec<Row> = rows.difference(&new_rows).cloned().collect();
            *rows = new_rows;
            (added, removed)
        };
        self.notify(added, removed)
    }

    fn notify(&self, added: Vec<Row>, removed: Vec<Row>) -> Result<()> {
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let change = RelationChange::from_rows(&self.scheme, added, removed)?;
        self.observers.notify(&change);
        Ok(())
    }
}

impl Source for ConcreteTable {
    fn id(&self) -> RelationId {
        self.id
    }

    fn scheme(&self) -> Scheme {
        self.scheme.clone()
    }

    fn rows(&self) -> Vec<Result<Row>> {
        self.rows.read().iter().cloned().map(Ok).collect()
    }

    fn contains(&self, row: &Row) -> Result<bool> {
        Ok(self.rows.read().contains(row))
    }

    fn add_row(&self, row: Row) -> Result<()> {
        self.check_row(&row)?;
        let inserted = self.rows.write().insert(row.clone());
        if inserted {
            self.notify(vec![row], Vec::new())?;
        }
        Ok(())
    }

    fn delete_where(&self, predicate: &SelectExpression) -> Result<()> {
        let removed: Vec<Row> = {
            let mut rows = self.rows.write();
            let removed: Vec<Row> = rows.iter().filter(|r| predicate.matches(r)).cloned().collect();
            for row in &removed {
                rows.remove(row);
            }
            removed
        };
        self.notify(Vec::new(), removed)
    }

    fn update_where(&self, predicate: &SelectExpression, new_values: &Row) -> Result<()> {
        if !new_values.scheme().is_subset_of(&self.scheme) {
            return Err(Error::scheme_violation(
                "update attributes are not a subset of the scheme",
            ));
        }
        let (added, removed) = {
            let mut rows = self.rows.write();
            let matched: Vec<Row> = rows.iter().filter(|r| predicate.matches(r)).cloned().collect();
            let mut new_set: HashSet<Row> =
                rows.iter().filter(|r| !predicate.matches(r)).cloned().collect();
            for row in &matched {
                new_set.insert(row.updated_by(new_values));
            }
            let added: Vec<Row> = new_set.difference(&rows).cloned().collect();
            let removed: Vec<Row> = rows.difference(&new_set).cloned().collect();
            *rows = new_set;
            (added, removed)
        };
        self.notify(added, removed)
    }

    fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Relation {
    /// Creates an empty in-memory base relation with the given scheme.
    pub fn table(scheme: Scheme) -> Relation {
        Relation::from_source(Arc::new(ConcreteTable::new(scheme)))
    }

    /// Creates an in-memory base relation seeded with rows.
    pub fn with_rows<I: IntoIterator<Item = Row>>(scheme: Scheme, rows: I) -> Result<Relation> {
        Ok(Relation::from_source(Arc::new(ConcreteTable::with_rows(
            scheme, rows,
        )?)))
    }
}
