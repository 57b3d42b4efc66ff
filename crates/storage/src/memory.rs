//! In-memory storage adapter.
//!
//! `MemoryStore` is the reference `RowStore`: a scheme and a row set behind
//! a lock. It is the usual underlying store for change-logging relations in
//! tests and for ephemeral databases.

use hashbrown::HashSet;
use parking_lot::RwLock;
use ravel_core::{Error, Result, Row, Scheme, SelectExpression};
use ravel_relation::RowStore;

/// An in-memory row store.
pub struct MemoryStore {
    scheme: Scheme,
    rows: RwLock<HashSet<Row>>,
}

impl MemoryStore {
    /// Creates an empty store with the given scheme.
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            rows: RwLock::new(HashSet::new()),
        }
    }

    /// Creates a store seeded with rows.
    pub fn with_rows<I: IntoIterator<Item = Row>>(scheme: Scheme, rows: I) -> Result<Self> {
        let store = Self::new(scheme);
        {
            let mut set = store.rows.write();
            for row in rows {
                if !row.satisfies(&store.scheme) {
                    return Err(Error::scheme_violation(
                        "seed row does not match the scheme",
                    ));
                }
                set.insert(row);
            }
        }
        Ok(store)
    }

    /// Returns the number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if the store has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl RowStore for MemoryStore {
    fn scheme(&self) -> Scheme {
        self.scheme.clone()
    }

    fn rows(&self) -> Vec<Result<Row>> {
        self.rows.read().iter().cloned().map(Ok).collect()
    }

    fn add(&self, row: Row) -> Result<()> {
        if !row.satisfies(&self.scheme) {
            return Err(Error::scheme_violation(
                "row attributes do not match the scheme",
            ));
        }
        self.rows.write().insert(row);
        Ok(())
    }

    fn delete(&self, predicate: &SelectExpression) -> Result<()> {
        self.rows.write().retain(|row| !predicate.matches(row));
        Ok(())
    }

    fn update(&self, predicate: &SelectExpression, new_values: &Row) -> Result<()> {
        if !new_values.scheme().is_subset_of(&self.scheme) {
            return Err(Error::scheme_violation(
                "update attributes are not a subset of the scheme",
            ));
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_core::{attr, Value};

    fn pet(id: i64, name: &str) -> Row {
        Row::new([("id", Value::Integer(id)), ("name", Value::from(name))])
    }

    #[test]
    fn test_memory_store_crud() {
        let store = MemoryStore::new(Scheme::from(["id", "name"]));
        store.add(pet(1, "cat")).unwrap();
        store.add(pet(2, "dog")).unwrap();
        assert_eq!(store.len(), 2);

        store
            .update(&attr("id").eq(1i64), &Row::new([("name", Value::from("kat"))]))
            .unwrap();
        let rows: HashSet<Row> = store.rows().into_iter().map(|r| r.unwrap()).collect();
        assert!(rows.contains(&pet(1, "kat")));

        store.delete(&attr("id").eq(2i64)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_store_duplicate_add_is_noop() {
        let store = MemoryStore::new(Scheme::from(["id", "name"]));
        store.add(pet(1, "cat")).unwrap();
        store.add(pet(1, "cat")).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_store_scheme_check() {
        let store = MemoryStore::new(Scheme::from(["id", "name"]));
        assert!(store.add(Row::new([("id", Value::Integer(1))])).is_err());
    }
}
