//! The transactional database: a named group of change-logging relations.
//!
//! Transactions are nestable. While any transaction is open, observers of
//! member relations receive no notifications; the coalesced deltas flush
//! when the outermost transaction ends. Snapshots capture every member's
//! log atomically and restore the same way.

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use ravel_core::{Error, Result};
use ravel_relation::{next_relation_id, Relation, RelationId, RowStore, Source};
use std::sync::Arc;
use tracing::debug;

use crate::change_log::{ChangeLogSnapshot, ChangeLoggingRelation};

pub(crate) struct DbInner {
    pub(crate) id: u64,
    pub(crate) relations: RwLock<HashMap<String, Arc<ChangeLoggingRelation>>>,
    depth: Mutex<usize>,
}

/// An immutable, atomically taken copy of every member relation's log.
#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseSnapshot {
    logs: HashMap<RelationId, ChangeLogSnapshot>,
}

impl DatabaseSnapshot {
    /// Returns the number of member relations captured.
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    /// Returns true if no member relations were captured.
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

/// A group of change-logging relations with shared transactions and
/// snapshots.
#[derive(Clone)]
pub struct TransactionalDatabase {
    inner: Arc<DbInner>,
}

impl Default for TransactionalDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionalDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DbInner {
                id: next_relation_id(),
                relations: RwLock::new(HashMap::new()),
                depth: Mutex::new(0),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<DbInner>) -> Self {
        Self { inner }
    }

    /// A stable identity for this database.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns true if the two handles denote the same database.
    pub fn same_identity(&self, other: &TransactionalDatabase) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Adds a change-logging relation over `underlying` under `name` and
    /// returns it as a `Relation`.
    pub fn add_relation(&self, name: &str, underlying: Arc<dyn RowStore>) -> Result<Relation> {
        let mut relations = self.inner.relations.write();
        if relations.contains_key(name) {
            return Err(Error::invariant_violation(format!(
                "relation {:?} already exists",
                name
            )));
        }
        let (relation, logging) = ChangeLoggingRelation::relation(underlying);
        logging.set_database(&self.inner);
        // A relation added mid-transaction buffers like the others.
        if *self.inner.depth.lock() > 0 {
            logging.begin_buffering();
        }
        relations.insert(name.to_string(), logging);
        Ok(relation)
    }

    /// Looks up a member relation by name.
    pub fn relation(&self, name: &str) -> Option<Relation> {
        self.inner
            .relations
            .read()
            .get(name)
            .map(|logging| Relation::from_source(logging.clone() as Arc<dyn ravel_relation::Source>))
    }

    /// Returns the member names.
    pub fn relation_names(&self) -> Vec<String> {
        self.inner.relations.read().keys().cloned().collect()
    }

    fn members(&self) -> Vec<Arc<ChangeLoggingRelation>> {
        self.inner.relations.read().values().cloned().collect()
    }

    /// Returns true if a transaction is open.
    pub fn is_in_transaction(&self) -> bool {
        *self.inner.depth.lock() > 0
    }

    /// Opens a (nestable) transaction. Observer notifications are withheld
    /// until the outermost `end`.
    pub fn begin(&self) {
        let mut depth = self.inner.depth.lock();
        *depth += 1;
        if *depth == 1 {
            debug!(database = self.inner.id, "transaction begin");
            for member in self.members() {
                member.begin_buffering();
            }
        }
    }

    /// Closes the innermost transaction; the outermost close flushes the
    /// coalesced notifications.
    pub fn end(&self) -> Result<()> {
        let flush = {
            let mut depth = self.inner.depth.lock();
            if *depth == 0 {
                return Err(Error::invariant_violation("end without matching begin"));
            }
            *depth -= 1;
            *depth == 0
        };
        if flush {
            debug!(database = self.inner.id, "transaction end");
            for member in self.members() {
                member.end_buffering()?;
            }
        }
        Ok(())
    }

    /// Runs a closure inside a transaction, guaranteeing `end` on all exit
    /// paths.
    pub fn transaction<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        self.begin();
        let guard = EndGuard { database: self };
        let result = f();
        guard.finish()?;
        Ok(result)
    }

    /// Runs a closure inside a transaction and captures snapshots before
    /// and after it, for installing undo entries.
    pub fn transaction_with_snapshots<T>(
        &self,
        f: impl FnOnce() -> T,
    ) -> Result<(T, DatabaseSnapshot, DatabaseSnapshot)> {
        let before = self.take_snapshot();
        let result = self.transaction(f)?;
        let after = self.take_snapshot();
        Ok((result, before, after))
    }

    /// Captures every member relation's log.
    pub fn take_snapshot(&self) -> DatabaseSnapshot {
        let relations = self.inner.relations.read();
        DatabaseSnapshot {
            logs: relations
                .values()
                .map(|member| (member.id(), member.take_snapshot()))
                .collect(),
        }
    }

    /// Restores every member relation captured in the snapshot, atomically
    /// with respect to member addition.
    pub fn restore_snapshot(&self, snapshot: &DatabaseSnapshot) -> Result<()> {
        let relations = self.inner.relations.read();
        debug!(database = self.inner.id, members = snapshot.len(), "restoring snapshot");
        for member in relations.values() {
            if let Some(log) = snapshot.logs.get(&member.id()) {
                member.restore_snapshot(log)?;
            }
        }
        Ok(())
    }

    /// Saves every member relation to its underlying store.
    pub fn save(&self) -> Result<()> {
        for member in self.members() {
            member.save()?;
        }
        Ok(())
    }
}

/// Calls `end` when dropped, so panics unwind the transaction too.
struct EndGuard<'a> {
    database: &'a TransactionalDatabase,
}

impl EndGuard<'_> {
    fn finish(self) -> Result<()> {
        let result = self.database.end();
        std::mem::forget(self);
        result
    }
}

impl Drop for EndGuard<'_> {
    fn drop(&mut self) {
        let _ = self.database.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use hashbrown::HashSet;
    use ravel_core::{attr, Row, Scheme, Value};
    use ravel_relation::RelationChange;

    fn pet(id: i64, name: &str) -> Row {
        Row::new([("id", Value::Integer(id)), ("name", Value::from(name))])
    }

    fn fresh() -> (TransactionalDatabase, Relation) {
        let db = TransactionalDatabase::new();
        let relation = db
            .add_relation("pets", Arc::new(MemoryStore::new(Scheme::from(["id", "name"]))))
            .unwrap();
        (db, relation)
    }

    #[test]
    fn test_relation_lookup_shares_identity() {
        let (db, relation) = fresh();
        let looked_up = db.relation("pets").unwrap();
        assert!(relation.same_identity(&looked_up));
        assert!(db.relation("nope").is_none());
    }

    #[test]
    fn test_transaction_withholds_notifications() {
        let (db, relation) = fresh();

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        let _removal = relation
            .observe(move |_: &RelationChange| {
                count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
            .unwrap();

        db.transaction(|| {
            relation.add(pet(1, "cat")).unwrap();
            relation.add(pet(2, "dog")).unwrap();
            assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
        })
        .unwrap();

        // One coalesced notification after the outermost end.
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_transactions_flush_once() {
        let (db, relation) = fresh();

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        let _removal = relation
            .observe(move |_: &RelationChange| {
                count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
            .unwrap();

        db.begin();
        db.begin();
        relation.add(pet(1, "cat")).unwrap();
        db.end().unwrap();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
        db.end().unwrap();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_restore_is_atomic_across_members() {
        let db = TransactionalDatabase::new();
        let pets = db
            .add_relation("pets", Arc::new(MemoryStore::new(Scheme::from(["id", "name"]))))
            .unwrap();
        let people = db
            .add_relation("people", Arc::new(MemoryStore::new(Scheme::from(["id"]))))
            .unwrap();

        pets.add(pet(1, "cat")).unwrap();
        people.add(Row::new([("id", Value::Integer(10))])).unwrap();
        let snapshot = db.take_snapshot();

        pets.add(pet(2, "dog")).unwrap();
        people.delete_where(&attr("id").eq(10i64)).unwrap();

        db.restore_snapshot(&snapshot).unwrap();
        assert_eq!(pets.contents().unwrap(), [pet(1, "cat")].into_iter().collect());
        assert_eq!(
            people.contents().unwrap(),
            [Row::new([("id", Value::Integer(10))])]
                .into_iter()
                .collect::<HashSet<Row>>()
        );

        // Re-taking yields an equal snapshot.
        assert_eq!(db.take_snapshot(), snapshot);
    }

    #[test]
    fn test_transaction_with_snapshots_supports_undo() {
        let (db, relation) = fresh();
        relation.add(pet(2, "dog")).unwrap();

        let (_, before, after) = db
            .transaction_with_snapshots(|| {
                relation.add(pet(10, "x")).unwrap();
                relation.delete_where(&attr("id").eq(2i64)).unwrap();
            })
            .unwrap();

        let post_state: HashSet<Row> = [pet(10, "x")].into_iter().collect();
        assert_eq!(relation.contents().unwrap(), post_state);

        // backward: restore the before snapshot.
        db.restore_snapshot(&before).unwrap();
        assert_eq!(relation.contents().unwrap(), [pet(2, "dog")].into_iter().collect());

        // forward: restore the after snapshot.
        db.restore_snapshot(&after).unwrap();
        assert_eq!(relation.contents().unwrap(), post_state);
    }

    #[test]
    fn test_end_without_begin_errors() {
        let (db, _) = fresh();
        assert!(db.end().is_err());
    }

    #[test]
    fn test_save_persists_all_members() {
        let store = Arc::new(MemoryStore::new(Scheme::from(["id", "name"])));
        let db = TransactionalDatabase::new();
        let relation = db.add_relation("pets", store.clone()).unwrap();

        relation.add(pet(1, "cat")).unwrap();
        db.save().unwrap();

        let persisted: HashSet<Row> = store.rows().into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(persisted, [pet(1, "cat")].into_iter().collect());
    }
}
