//! The storage adapter contract and the stored-relation wrapper.
//!
//! A `RowStore` is a persistent (or in-memory) row container satisfying the
//! adapter contract: scheme, row iteration, and in-place add/delete/update.
//! `StoredRelation` lifts a `RowStore` into a base relation: it serializes
//! mutations, computes each mutation's precise delta and notifies observers.

use crate::change::RelationChange;
use crate::observer::ObserverRegistry;
use crate::relation::{next_relation_id, Relation, RelationId, Source};
use hashbrown::HashSet;
use ravel_core::{Error, Result, Row, Scheme, SelectExpression};
use std::any::Any;
use std::sync::Arc;

/// The storage adapter contract every persistent adapter satisfies.
pub trait RowStore: Send + Sync {
    /// The scheme all stored rows satisfy.
    fn scheme(&self) -> Scheme;

    /// Iterates the stored rows; order is not specified and errors are
    /// per-row.
    fn rows(&self) -> Vec<Result<Row>>;

    /// Adds a row. Adding a duplicate of an existing row is a no-op.
    fn add(&self, row: Row) -> Result<()>;

    /// Deletes the rows matching the predicate.
    fn delete(&self, predicate: &SelectExpression) -> Result<()>;

    /// Overwrites attributes of the rows matching the predicate.
    fn update(&self, predicate: &SelectExpression, new_values: &Row) -> Result<()>;

    /// If the adapter can evaluate the predicate natively, returns a
    /// relation that pushes it down.
    fn select_native(&self, predicate: &SelectExpression) -> Option<Relation> {
        let _ = predicate;
        None
    }
}

/// A base relation backed by a storage adapter.
pub struct StoredRelation {
    id: RelationId,
    store: Arc<dyn RowStore>,
    observers: ObserverRegistry,
}

impl StoredRelation {
    /// Wraps a storage adapter as a base relation.
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            id: next_relation_id(),
            store,
            observers: ObserverRegistry::new(),
        }
    }

    /// Returns the backing adapter.
    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    fn current_rows(&self) -> Result<HashSet<Row>> {
        let mut result = HashSet::new();
        for row in self.store.rows() {
            result.insert(row?);
        }
        Ok(result)
    }

    fn notify(&self, scheme: &Scheme, added: Vec<Row>, removed: Vec<Row>) -> Result<()> {
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let change = RelationChange::from_rows(scheme, added, removed)?;
        self.observers.notify(&change);
        Ok(())
    }
}

impl Source for StoredRelation {
    fn id(&self) -> RelationId {
        self.id
    }

    fn scheme(&self) -> Scheme {
        self.store.scheme()
    }

    fn rows(&self) -> Vec<Result<Row>> {
        self.store.rows()
    }

    fn add_row(&self, row: Row) -> Result<()> {
        let scheme = self.store.scheme();
        if !row.satisfies(&scheme) {
            return Err(Error::scheme_violation(
                "row attributes do not match the stored scheme",
            ));
        }
        let present = self.current_rows()?.contains(&row);
        self.store.add(row.clone())?;
        if !present {
            self.notify(&scheme, vec![row], Vec::new())?;
        }
        Ok(())
    }

    fn delete_where(&self, predicate: &SelectExpression) -> Result<()> {
        let scheme = self.store.scheme();
        let removed: Vec<Row> = self
            .current_rows()?
            .into_iter()
            .filter(|row| predicate.matches(row))
            .collect();
        self.store.delete(predicate)?;
        self.notify(&scheme, Vec::new(), removed)
    }

    fn update_where(&self, predicate: &SelectExpression, new_values: &Row) -> Result<()> {
        let scheme = self.store.scheme();
        if !new_values.scheme().is_subset_of(&scheme) {
            return Err(Error::scheme_violation(
                "update attributes are not a subset of the stored scheme",
            ));
        }
        let before = self.current_rows()?;
        let matched: Vec<Row> = before
            .iter()
            .filter(|row| predicate.matches(row))
            .cloned()
            .collect();
        let mut after: HashSet<Row> = before
            .iter()
            .filter(|row| !predicate.matches(row))
            .cloned()
            .collect();
        for row in &matched {
            after.insert(row.updated_by(new_values));
        }

        self.store.update(predicate, new_values)?;

        let added: Vec<Row> = after.difference(&before).cloned().collect();
        let removed: Vec<Row> = before.difference(&after).cloned().collect();
        self.notify(&scheme, added, removed)
    }

    fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    fn select_native(&self, predicate: &SelectExpression) -> Option<Relation> {
        self.store.select_native(predicate)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Relation {
    /// Lifts a storage adapter into a base relation.
    pub fn stored(store: Arc<dyn RowStore>) -> Relation {
        Relation::from_source(Arc::new(StoredRelation::new(store)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use ravel_core::{attr, Value};

    /// Minimal in-memory adapter for exercising the wrapper.
    struct TestStore {
        scheme: Scheme,
        rows: RwLock<HashSet<Row>>,
    }

    impl TestStore {
        fn new(scheme: Scheme) -> Self {
            Self {
                scheme,
                rows: RwLock::new(HashSet::new()),
            }
        }
    }

    impl RowStore for TestStore {
        fn scheme(&self) -> Scheme {
            self.scheme.clone()
        }

        fn rows(&self) -> Vec<Result<Row>> {
            self.rows.read().iter().cloned().map(Ok).collect()
        }

        fn add(&self, row: Row) -> Result<()> {
            self.rows.write().insert(row);
            Ok(())
        }

        fn delete(&self, predicate: &SelectExpression) -> Result<()> {
            self.rows.write().retain(|row| !predicate.matches(row));
            Ok(())
        }

        fn update(&self, predicate: &SelectExpression, new_values: &Row) -> Result<()> {
            let mut rows = self.rows.write();
            let updated: HashSet<Row> = rows
                .iter()
                .map(|row| {
                    if predicate.matches(row) {
                        row.updated_by(new_values)
                    } else {
                        row.clone()
                    }
                })
                .collect();
            *rows = updated;
            Ok(())
        }
    }

    fn pet(id: i64, name: &str) -> Row {
        Row::new([("id", Value::Integer(id)), ("name", Value::from(name))])
    }

    #[test]
    fn test_stored_relation_mutations() {
        let store = Arc::new(TestStore::new(Scheme::from(["id", "name"])));
        let relation = Relation::stored(store);

        relation.add(pet(1, "cat")).unwrap();
        relation.add(pet(2, "dog")).unwrap();
        assert_eq!(relation.count_rows().unwrap(), 2);

        relation
            .update_where(&attr("id").eq(1i64), &Row::new([("name", Value::from("kat"))]))
            .unwrap();
        assert!(relation.contains(&pet(1, "kat")).unwrap());

        relation.delete_where(&attr("id").eq(2i64)).unwrap();
        assert_eq!(relation.count_rows().unwrap(), 1);
    }

    #[test]
    fn test_stored_relation_notifies_precise_delta() {
        let store = Arc::new(TestStore::new(Scheme::from(["id", "name"])));
        let relation = Relation::stored(store);
        relation.add(pet(1, "cat")).unwrap();

        let seen: Arc<parking_lot::Mutex<Vec<RelationChange>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _removal = relation
            .observe(move |change: &RelationChange| seen_clone.lock().push(change.clone()))
            .unwrap();

        relation
            .update_where(&attr("id").eq(1i64), &Row::new([("name", Value::from("kat"))]))
            .unwrap();

        let changes = seen.lock();
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].added_rows().unwrap(),
            [pet(1, "kat")].into_iter().collect()
        );
        assert_eq!(
            changes[0].removed_rows().unwrap(),
            [pet(1, "cat")].into_iter().collect()
        );
    }

    #[test]
    fn test_duplicate_add_does_not_notify() {
        let store = Arc::new(TestStore::new(Scheme::from(["id", "name"])));
        let relation = Relation::stored(store);
        relation.add(pet(1, "cat")).unwrap();

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        let _removal = relation
            .observe(move |_| {
                count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
            .unwrap();

        relation.add(pet(1, "cat")).unwrap();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
