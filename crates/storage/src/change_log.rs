//! Change-logging relations.
//!
//! A `ChangeLoggingRelation` wraps an underlying row store and records every
//! mutation in an append-only log instead of writing through. Its logical
//! content is the underlying rows with the log replayed on top; the replay
//! result is cached and maintained in place on each append. Snapshots copy
//! the log; `save` diffs the logical state against the underlying store,
//! writes the minimal add/delete set, and truncates the log.

use hashbrown::HashSet;
use parking_lot::Mutex;
use ravel_core::{Error, Result, Row, Scheme, SelectExpression};
use ravel_relation::{
    next_relation_id, ChangeAccumulator, ObserverRegistry, RelationChange, RelationId, Relation,
    RowStore, Source,
};
use std::any::Any;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::database::{DbInner, TransactionalDatabase};

/// One logged mutation.
///
/// A delete of predicate `p` is stored as `Select(!p)`: the log entry keeps
/// the rows that remain.
#[derive(Clone, Debug, PartialEq)]
pub enum LoggedChange {
    /// Union the given rows into the relation.
    Union(HashSet<Row>),
    /// Keep only the rows matching the expression.
    Select(SelectExpression),
    /// Overwrite attributes of the rows matching the expression.
    Update(SelectExpression, Row),
}

/// Applies one logged change to a row set in place.
pub fn apply_change(rows: &mut HashSet<Row>, change: &LoggedChange) {
    match change {
        LoggedChange::Union(added) => {
            for row in added {
                rows.insert(row.clone());
            }
        }
        LoggedChange::Select(keep) => {
            rows.retain(|row| keep.matches(row));
        }
        LoggedChange::Update(predicate, new_values) => {
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
        }
    }
}

/// Replays a log over a base row set.
pub fn materialize(mut base: HashSet<Row>, log: &[LoggedChange]) -> HashSet<Row> {
    for change in log {
        apply_change(&mut base, change);
    }
    base
}

/// An immutable copy of a change log, taken at a point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeLogSnapshot {
    entries: Vec<LoggedChange>,
}

impl ChangeLogSnapshot {
    /// Returns the number of logged changes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the snapshot has no logged changes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct LogState {
    log: Vec<LoggedChange>,
    /// The materialization of `underlying ++ log`, maintained in place on
    /// each append so replay cost is paid once.
    cache: Option<HashSet<Row>>,
}

/// A base relation that records mutations in a log over an underlying store.
pub struct ChangeLoggingRelation {
    id: RelationId,
    scheme: Scheme,
    underlying: Arc<dyn RowStore>,
    state: Mutex<LogState>,
    observers: ObserverRegistry,
    /// While a transaction is open, deltas coalesce here instead of
    /// notifying observers.
    buffer: Mutex<Option<ChangeAccumulator>>,
    /// Back-reference to the owning transactional database, if any.
    database: Mutex<Weak<DbInner>>,
}

impl ChangeLoggingRelation {
    /// Wraps an underlying store with an empty log.
    pub fn new(underlying: Arc<dyn RowStore>) -> Self {
        Self {
            id: next_relation_id(),
            scheme: underlying.scheme(),
            underlying,
            state: Mutex::new(LogState {
                log: Vec::new(),
                cache: None,
            }),
            observers: ObserverRegistry::new(),
            buffer: Mutex::new(None),
            database: Mutex::new(Weak::new()),
        }
    }

    /// Returns the underlying store.
    pub fn underlying(&self) -> &Arc<dyn RowStore> {
        &self.underlying
    }

    /// Returns the number of logged, unsaved changes.
    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Returns the owning transactional database, if this relation is a
    /// member of one.
    pub fn database(&self) -> Option<TransactionalDatabase> {
        self.database
            .lock()
            .upgrade()
            .map(TransactionalDatabase::from_inner)
    }

    pub(crate) fn set_database(&self, inner: &Arc<DbInner>) {
        *self.database.lock() = Arc::downgrade(inner);
    }

    fn underlying_rows(&self) -> Result<HashSet<Row>> {
        let mut rows = HashSet::new();
        for row in self.underlying.rows() {
            rows.insert(row?);
        }
        Ok(rows)
    }

    fn materialized_locked(&self, state: &mut LogState) -> Result<HashSet<Row>> {
        if state.cache.is_none() {
            state.cache = Some(materialize(self.underlying_rows()?, &state.log));
        }
        Ok(state.cache.clone().expect("cache was just filled"))
    }

    /// Returns the current logical content: the underlying rows with the
    /// log replayed on top.
    pub fn materialized(&self) -> Result<HashSet<Row>> {
        let mut state = self.state.lock();
        self.materialized_locked(&mut state)
    }

    fn notify_rows(&self, added: Vec<Row>, removed: Vec<Row>) -> Result<()> {
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let mut buffer = self.buffer.lock();
        if let Some(accumulator) = buffer.as_mut() {
            accumulator.record_rows(added, removed);
            return Ok(());
        }
        drop(buffer);
        let change = RelationChange::from_rows(&self.scheme, added, removed)?;
        self.observers.notify(&change);
        Ok(())
    }

    /// Starts buffering notifications (transaction entry).
    pub(crate) fn begin_buffering(&self) {
        let mut buffer = self.buffer.lock();
        if buffer.is_none() {
            *buffer = Some(ChangeAccumulator::new(self.scheme.clone()));
        }
    }

    /// Stops buffering and delivers the coalesced change (transaction exit).
    pub(crate) fn end_buffering(&self) -> Result<()> {
        let accumulator = self.buffer.lock().take();
        if let Some(accumulator) = accumulator {
            if !accumulator.is_empty() {
                self.observers.notify(&accumulator.to_change()?);
            }
        }
        Ok(())
    }

    /// Copies the current log.
    pub fn take_snapshot(&self) -> ChangeLogSnapshot {
        ChangeLogSnapshot {
            entries: self.state.lock().log.clone(),
        }
    }

    /// Replaces the log with a snapshot's copy, notifying observers with the
    /// delta between the old and new logical content.
    pub fn restore_snapshot(&self, snapshot: &ChangeLogSnapshot) -> Result<()> {
        let (added, removed) = {
            let mut state = self.state.lock();
            let before = self.materialized_locked(&mut state)?;
            state.log = snapshot.entries.clone();
            state.cache = None;
            let after = self.materialized_locked(&mut state)?;
            let added: Vec<Row> = after.difference(&before).cloned().collect();
            let removed: Vec<Row> = before.difference(&after).cloned().collect();
            (added, removed)
        };
        debug!(relation = self.id, "restored change log snapshot");
        self.notify_rows(added, removed)
    }

    /// Writes the minimal diff between the logical content and the
    /// underlying store, then truncates the log.
    ///
    /// A persistence error surfaces without mutating the log.
    pub fn save(&self) -> Result<()> {
        let mut state = self.state.lock();
        let current = self.materialized_locked(&mut state)?;
        let underlying = self.underlying_rows()?;

        for row in underlying.difference(&current) {
            self.underlying
                .delete(&SelectExpression::matching_row(row))?;
        }
        for row in current.difference(&underlying) {
            self.underlying.add(row.clone())?;
        }

        debug!(relation = self.id, entries = state.log.len(), "saved change log");
        state.log.clear();
        state.cache = Some(current);
        Ok(())
    }
}

impl Source for ChangeLoggingRelation {
    fn id(&self) -> RelationId {
        self.id
    }

    fn scheme(&self) -> Scheme {
        self.scheme.clone()
    }

    fn rows(&self) -> Vec<Result<Row>> {
        match self.materialized() {
            Ok(rows) => rows.into_iter().map(Ok).collect(),
            Err(err) => vec![Err(err)],
        }
    }

    fn contains(&self, row: &Row) -> Result<bool> {
        Ok(self.materialized()?.contains(row))
    }

    fn add_row(&self, row: Row) -> Result<()> {
        if !row.satisfies(&self.scheme) {
            return Err(Error::scheme_violation(
                "row attributes do not match the scheme",
            ));
        }
        let inserted = {
            let mut state = self.state.lock();
            let current = self.materialized_locked(&mut state)?;
            if current.contains(&row) {
                false
            } else {
                state
                    .log
                    .push(LoggedChange::Union([row.clone()].into_iter().collect()));
                state
                    .cache
                    .as_mut()
                    .expect("cache exists after materialization")
                    .insert(row.clone());
                true
            }
        };
        if inserted {
            self.notify_rows(vec![row], Vec::new())?;
        }
        Ok(())
    }

    fn delete_where(&self, predicate: &SelectExpression) -> Result<()> {
        let removed = {
            let mut state = self.state.lock();
            let current = self.materialized_locked(&mut state)?;
            let removed: Vec<Row> = current
                .iter()
                .filter(|row| predicate.matches(row))
                .cloned()
                .collect();
            if !removed.is_empty() {
                state
                    .log
                    .push(LoggedChange::Select(predicate.clone().negated()));
                let cache = state.cache.as_mut().expect("cache exists");
                for row in &removed {
                    cache.remove(row);
                }
            }
            removed
        };
        self.notify_rows(Vec::new(), removed)
    }

    fn update_where(&self, predicate: &SelectExpression, new_values: &Row) -> Result<()> {
        if !new_values.scheme().is_subset_of(&self.scheme) {
            return Err(Error::scheme_violation(
                "update attributes are not a subset of the scheme",
            ));
        }
        let (added, removed) = {
            let mut state = self.state.lock();
            let before = self.materialized_locked(&mut state)?;
            let matched: Vec<Row> = before
                .iter()
                .filter(|row| predicate.matches(row))
                .cloned()
                .collect();
            if matched.is_empty() {
                (Vec::new(), Vec::new())
            } else {
                state
                    .log
                    .push(LoggedChange::Update(predicate.clone(), new_values.clone()));
                let mut after: HashSet<Row> = before
                    .iter()
                    .filter(|row| !predicate.matches(row))
                    .cloned()
                    .collect();
                for row in &matched {
                    after.insert(row.updated_by(new_values));
                }
                let added: Vec<Row> = after.difference(&before).cloned().collect();
                let removed: Vec<Row> = before.difference(&after).cloned().collect();
                state.cache = Some(after);
                (added, removed)
            }
        };
        self.notify_rows(added, removed)
    }

    fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ChangeLoggingRelation {
    /// Wraps an underlying store and lifts the result into a `Relation`.
    pub fn relation(underlying: Arc<dyn RowStore>) -> (Relation, Arc<ChangeLoggingRelation>) {
        let logging = Arc::new(ChangeLoggingRelation::new(underlying));
        (Relation::from_source(logging.clone()), logging)
    }
}
