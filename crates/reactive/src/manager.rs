//! The asynchronous update manager.
//!
//! One manager instance is pinned to one dispatch context. Mutations and
//! queries are *registered*, not executed: registration enqueues an action
//! and schedules (at most once) a drain tick on the context. The drain
//! sends `willChange` to every observer the batch may affect, executes the
//! batch on the shared worker pool inside transactions, asks each observed
//! root's derivative for its `(added, removed)` delta, streams results back
//! to the context, and closes every open bracket with `didChange`.
//!
//! State machine:
//!
//! ```text
//! idle ──register──▶ pending ──tick──▶ running ──queries done──▶ stopping ──▶ idle
//!                                        ▲                          │
//!                                        └── actions registered ────┘
//! ```

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use ravel_core::{Error, Result, Row, SelectExpression};
use ravel_incremental::{Derivative, RelationDifferentiator};
use ravel_query::{QueryEvent, QueryOutput, QueryRunner, QuerySink};
use ravel_relation::{Relation, RelationId};
use ravel_storage::{ChangeLoggingRelation, DatabaseSnapshot, TransactionalDatabase};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::context::DispatchContext;
use crate::observer::{AsyncContentObserver, AsyncDeltaObserver};
use crate::worker::WorkerPool;

/// The manager's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerState {
    /// No pending work.
    Idle,
    /// Actions are registered and a drain tick is scheduled.
    Pending,
    /// A batch is executing on the worker pool.
    Running,
    /// All queries completed; didChange notifications are being dispatched.
    Stopping,
}

enum Action {
    Add {
        relation: Relation,
        row: Row,
    },
    Delete {
        relation: Relation,
        predicate: SelectExpression,
    },
    Update {
        relation: Relation,
        predicate: SelectExpression,
        new_values: Row,
    },
    RestoreSnapshot {
        database: TransactionalDatabase,
        snapshot: DatabaseSnapshot,
    },
    Query {
        relation: Relation,
        sink: QuerySink,
    },
}

/// Which observers an action error is routed to.
enum ErrorTarget {
    Variable(RelationId),
    Database(u64),
}

struct DeltaRegistration {
    observer: Arc<dyn AsyncDeltaObserver>,
    will_change_sent: bool,
}

struct ContentRegistration {
    observer: Arc<dyn AsyncContentObserver>,
    will_change_sent: bool,
}

struct ObserverEntry {
    relation: Relation,
    derivative: Arc<Derivative>,
    delta: HashMap<u64, DeltaRegistration>,
    content: HashMap<u64, ContentRegistration>,
}

struct Core {
    state: ManagerState,
    pending: Vec<Action>,
}

struct ManagerInner {
    context: Arc<dyn DispatchContext>,
    runner: QueryRunner,
    core: Mutex<Core>,
    idle: Condvar,
    observed: Mutex<HashMap<RelationId, ObserverEntry>>,
    next_observer_id: AtomicU64,
    accepting: AtomicBool,
}

/// Handle to a registered async observer; `remove` detaches it.
pub struct AsyncObserverRemoval {
    inner: Weak<ManagerInner>,
    relation: RelationId,
    id: u64,
    content: bool,
}

impl AsyncObserverRemoval {
    /// Detaches the observer for subsequent deliveries. A delivery already
    /// posted to the context is not recalled.
    pub fn remove(self) -> bool {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return false,
        };
        let mut observed = inner.observed.lock();
        let entry = match observed.get_mut(&self.relation) {
            Some(entry) => entry,
            None => return false,
        };
        let removed = if self.content {
            entry.content.remove(&self.id).is_some()
        } else {
            entry.delta.remove(&self.id).is_some()
        };
        if entry.delta.is_empty() && entry.content.is_empty() {
            observed.remove(&self.relation);
        }
        removed
    }
}

/// The per-context update manager.
#[derive(Clone)]
pub struct UpdateManager {
    inner: Arc<ManagerInner>,
}

impl UpdateManager {
    /// Creates a manager pinned to the given context.
    pub fn new(context: Arc<dyn DispatchContext>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                context,
                runner: QueryRunner::new(),
                core: Mutex::new(Core {
                    state: ManagerState::Idle,
                    pending: Vec::new(),
                }),
                idle: Condvar::new(),
                observed: Mutex::new(HashMap::new()),
                next_observer_id: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.inner.core.lock().state
    }

    /// Blocks until the manager is idle with no pending actions.
    pub fn wait_until_idle(&self) {
        let mut core = self.inner.core.lock();
        while !(core.state == ManagerState::Idle && core.pending.is_empty()) {
            self.inner.idle.wait(&mut core);
        }
    }

    /// Stops accepting registrations, then drains what is already queued.
    pub fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.wait_until_idle();
        debug!("update manager shut down");
    }

    // ===== observer registration =====

    fn entry_for<'a>(
        &self,
        observed: &'a mut HashMap<RelationId, ObserverEntry>,
        relation: &Relation,
    ) -> &'a mut ObserverEntry {
        observed.entry(relation.id()).or_insert_with(|| ObserverEntry {
            relation: relation.clone(),
            derivative: Arc::new(RelationDifferentiator::derivative(relation)),
            delta: HashMap::new(),
            content: HashMap::new(),
        })
    }

    /// Registers a delta observer on a root relation.
    pub fn observe_delta(
        &self,
        relation: &Relation,
        observer: Arc<dyn AsyncDeltaObserver>,
    ) -> AsyncObserverRemoval {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
        let mut observed = self.inner.observed.lock();
        self.entry_for(&mut observed, relation).delta.insert(
            id,
            DeltaRegistration {
                observer,
                will_change_sent: false,
            },
        );
        AsyncObserverRemoval {
            inner: Arc::downgrade(&self.inner),
            relation: relation.id(),
            id,
            content: false,
        }
    }

    /// Registers a content observer on a root relation.
    pub fn observe_content(
        &self,
        relation: &Relation,
        observer: Arc<dyn AsyncContentObserver>,
    ) -> AsyncObserverRemoval {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
        let mut observed = self.inner.observed.lock();
        self.entry_for(&mut observed, relation).content.insert(
            id,
            ContentRegistration {
                observer,
                will_change_sent: false,
            },
        );
        AsyncObserverRemoval {
            inner: Arc::downgrade(&self.inner),
            relation: relation.id(),
            id,
            content: true,
        }
    }

    // ===== action registration =====

    fn register(&self, action: Action) -> Result<()> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::invariant_violation(
                "update manager is shut down and refuses new actions",
            ));
        }
        let mut core = self.inner.core.lock();
        core.pending.push(action);
        if core.state == ManagerState::Idle {
            core.state = ManagerState::Pending;
            let manager = self.clone();
            self.inner.context.post(Box::new(move || manager.drain()));
        }
        Ok(())
    }

    /// Registers an asynchronous row addition.
    pub fn register_add(&self, relation: &Relation, row: Row) -> Result<()> {
        self.register(Action::Add {
            relation: relation.clone(),
            row,
        })
    }

    /// Registers an asynchronous predicate delete.
    pub fn register_delete(&self, relation: &Relation, predicate: SelectExpression) -> Result<()> {
        self.register(Action::Delete {
            relation: relation.clone(),
            predicate,
        })
    }

    /// Registers an asynchronous predicate update.
    pub fn register_update(
        &self,
        relation: &Relation,
        predicate: SelectExpression,
        new_values: Row,
    ) -> Result<()> {
        self.register(Action::Update {
            relation: relation.clone(),
            predicate,
            new_values,
        })
    }

    /// Registers an asynchronous whole-database snapshot restore.
    pub fn register_restore_snapshot(
        &self,
        database: &TransactionalDatabase,
        snapshot: DatabaseSnapshot,
    ) -> Result<()> {
        self.register(Action::RestoreSnapshot {
            database: database.clone(),
            snapshot,
        })
    }

    /// Registers a one-shot query; events stream to the sink on the
    /// manager's context.
    pub fn register_query<F>(&self, relation: &Relation, sink: F) -> Result<()>
    where
        F: FnMut(QueryEvent) + Send + 'static,
    {
        self.register(Action::Query {
            relation: relation.clone(),
            sink: Box::new(sink),
        })
    }

    // ===== the drain cycle =====

    fn action_affects(action: &Action, derivative: &Derivative) -> bool {
        match action {
            Action::Add { relation, row } => derivative
                .mutation_may_affect(relation.id(), Some(&SelectExpression::matching_row(row))),
            Action::Delete {
                relation,
                predicate,
            } => derivative.mutation_may_affect(relation.id(), Some(predicate)),
            Action::Update {
                relation,
                predicate,
                new_values,
            } => {
                // Matched rows leave via the predicate's region; their
                // replacements land in the region the new values describe.
                derivative.mutation_may_affect(relation.id(), Some(predicate))
                    || derivative.mutation_may_affect(
                        relation.id(),
                        Some(&SelectExpression::matching_row(new_values)),
                    )
            }
            Action::RestoreSnapshot { database, .. } => derivative
                .variables()
                .iter()
                .any(|v| variable_in_database(v, database)),
            Action::Query { .. } => false,
        }
    }

    /// Runs on the context: collects the batch, opens observer brackets and
    /// hands execution to the worker pool.
    fn drain(&self) {
        let actions: Vec<Action> = {
            let mut core = self.inner.core.lock();
            core.state = ManagerState::Running;
            std::mem::take(&mut core.pending)
        };
        debug!(actions = actions.len(), "drain begin");

        let mut relevant: Vec<RelationId> = Vec::new();
        let mut delta_targets: Vec<Arc<dyn AsyncDeltaObserver>> = Vec::new();
        let mut content_targets: Vec<Arc<dyn AsyncContentObserver>> = Vec::new();
        {
            let mut observed = self.inner.observed.lock();
            for (root, entry) in observed.iter_mut() {
                let affected = actions
                    .iter()
                    .any(|action| Self::action_affects(action, &entry.derivative));
                if !affected {
                    continue;
                }
                relevant.push(*root);
                for registration in entry.delta.values_mut() {
                    if !registration.will_change_sent {
                        registration.will_change_sent = true;
                        delta_targets.push(registration.observer.clone());
                    }
                }
                for registration in entry.content.values_mut() {
                    if !registration.will_change_sent {
                        registration.will_change_sent = true;
                        content_targets.push(registration.observer.clone());
                    }
                }
            }
        }
        // One willChange per observer per drain, delivered on the context
        // before any execution begins.
        for observer in delta_targets {
            observer.relation_will_change();
        }
        for observer in content_targets {
            observer.relation_will_change();
        }

        let manager = self.clone();
        WorkerPool::shared().submit(Box::new(move || manager.run_batch(actions, relevant)));
    }

    /// Runs on a worker: applies the batch inside transactions, derives
    /// per-observer deltas and streams all results in one combined
    /// execution.
    fn run_batch(&self, actions: Vec<Action>, relevant: Vec<RelationId>) {
        struct RootWork {
            relation: Relation,
            derivative: Arc<Derivative>,
            delta_observers: Vec<Arc<dyn AsyncDeltaObserver>>,
            content_observers: Vec<Arc<dyn AsyncContentObserver>>,
        }

        let work: Vec<RootWork> = {
            let observed = self.inner.observed.lock();
            relevant
                .iter()
                .filter_map(|root| observed.get(root))
                .map(|entry| RootWork {
                    relation: entry.relation.clone(),
                    derivative: entry.derivative.clone(),
                    delta_observers: entry
                        .delta
                        .values()
                        .filter(|r| r.will_change_sent)
                        .map(|r| r.observer.clone())
                        .collect(),
                    content_observers: entry
                        .content
                        .values()
                        .filter(|r| r.will_change_sent)
                        .map(|r| r.observer.clone())
                        .collect(),
                })
                .collect()
        };

        // Route every base-level change of this batch into the relevant
        // derivatives.
        let mut routings = Vec::new();
        for root_work in &work {
            root_work.derivative.clear();
            for variable in root_work.derivative.variables() {
                let derivative = root_work.derivative.clone();
                let id = variable.id();
                if let Ok(removal) = variable.observe(move |change| {
                    let _ = derivative.add_change(id, change);
                }) {
                    routings.push(removal);
                }
            }
        }

        // Bracket every touched database in a transaction. Atomicity is per
        // database; a batch crossing databases is applied in order but is
        // not atomic as a whole.
        let mut databases: Vec<TransactionalDatabase> = Vec::new();
        for action in &actions {
            let database = match action {
                Action::Add { relation, .. }
                | Action::Delete { relation, .. }
                | Action::Update { relation, .. } => database_of(relation),
                Action::RestoreSnapshot { database, .. } => Some(database.clone()),
                Action::Query { .. } => None,
            };
            if let Some(database) = database {
                if !databases.iter().any(|d| d.same_identity(&database)) {
                    databases.push(database);
                }
            }
        }
        for database in &databases {
            database.begin();
        }

        // Apply mutations in registration order. An error aborts that
        // action only; the rest of the batch still executes.
        let mut errors: Vec<(ErrorTarget, Error)> = Vec::new();
        let mut queries: Vec<(Relation, QuerySink)> = Vec::new();
        for action in actions {
            let result = match &action {
                Action::Add { relation, row } => relation.add(row.clone()),
                Action::Delete {
                    relation,
                    predicate,
                } => relation.delete_where(predicate),
                Action::Update {
                    relation,
                    predicate,
                    new_values,
                } => relation.update_where(predicate, new_values),
                Action::RestoreSnapshot { database, snapshot } => {
                    database.restore_snapshot(snapshot)
                }
                Action::Query { .. } => Ok(()),
            };
            match action {
                Action::Query { relation, sink } => queries.push((relation, sink)),
                action => {
                    if let Err(err) = result {
                        warn!(error = %err, "action failed; continuing with the batch");
                        let target = match &action {
                            Action::RestoreSnapshot { database, .. } => {
                                ErrorTarget::Database(database.id())
                            }
                            Action::Add { relation, .. }
                            | Action::Delete { relation, .. }
                            | Action::Update { relation, .. } => {
                                ErrorTarget::Variable(relation.id())
                            }
                            Action::Query { .. } => unreachable!("queries are infallible here"),
                        };
                        errors.push((target, err));
                    }
                }
            }
        }

        // Ending the transactions flushes the buffered, coalesced deltas
        // into the routing observers attached above.
        for database in &databases {
            if let Err(err) = database.end() {
                warn!(error = %err, "transaction end failed");
            }
        }
        for removal in routings {
            removal.remove();
        }

        // One combined execution: every derivative's delta, every content
        // refresh and every direct query.
        let mut outputs: Vec<QueryOutput> = Vec::new();
        for root_work in work {
            let root_errors: Vec<&Error> = errors
                .iter()
                .filter(|(target, _)| match target {
                    ErrorTarget::Variable(id) => root_work.derivative.has_variable(*id),
                    ErrorTarget::Database(db_id) => root_work
                        .derivative
                        .variables()
                        .iter()
                        .any(|v| database_of(v).map_or(false, |d| d.id() == *db_id)),
                })
                .map(|(_, err)| err)
                .collect();

            if !root_errors.is_empty() {
                // Errors are a terminal alternative to row delivery; the
                // didChange bracket still closes later.
                for err in root_errors {
                    self.post_error(&root_work.delta_observers, &root_work.content_observers, err);
                }
                root_work.derivative.clear();
                continue;
            }

            let change = match root_work.derivative.change() {
                Ok(change) => change,
                Err(err) => {
                    self.post_error(
                        &root_work.delta_observers,
                        &root_work.content_observers,
                        &err,
                    );
                    root_work.derivative.clear();
                    continue;
                }
            };
            root_work.derivative.clear();

            let change = match change {
                Some(change) => change,
                None => continue,
            };

            if !root_work.delta_observers.is_empty() {
                if let Some(added) = change.added.clone() {
                    outputs.push(self.delta_output(added, root_work.delta_observers.clone(), true));
                }
                if let Some(removed) = change.removed.clone() {
                    outputs.push(self.delta_output(
                        removed,
                        root_work.delta_observers.clone(),
                        false,
                    ));
                }
            }
            if !root_work.content_observers.is_empty() {
                outputs.push(self.content_output(
                    root_work.relation.clone(),
                    root_work.content_observers,
                ));
            }
        }
        for (relation, sink) in queries {
            outputs.push(self.query_output(relation, sink));
        }

        self.inner.runner.execute(outputs);

        let manager = self.clone();
        self.inner.context.post(Box::new(move || manager.finish()));
    }

    fn post_error(
        &self,
        delta: &[Arc<dyn AsyncDeltaObserver>],
        content: &[Arc<dyn AsyncContentObserver>],
        err: &Error,
    ) {
        let delta = delta.to_vec();
        let content = content.to_vec();
        let err = err.clone();
        self.inner.context.post(Box::new(move || {
            for observer in &delta {
                observer.relation_error(&err);
            }
            for observer in &content {
                observer.relation_error(&err);
            }
        }));
    }

    fn delta_output(
        &self,
        relation: Relation,
        observers: Vec<Arc<dyn AsyncDeltaObserver>>,
        added: bool,
    ) -> QueryOutput {
        let context = self.inner.context.clone();
        QueryOutput::new(relation, move |event| match event {
            QueryEvent::Rows(rows) => {
                let observers = observers.clone();
                context.post(Box::new(move || {
                    for observer in &observers {
                        if added {
                            observer.relation_added_rows(&rows);
                        } else {
                            observer.relation_removed_rows(&rows);
                        }
                    }
                }));
            }
            QueryEvent::Error(err) => {
                let observers = observers.clone();
                context.post(Box::new(move || {
                    for observer in &observers {
                        observer.relation_error(&err);
                    }
                }));
            }
            QueryEvent::Done => {}
        })
    }

    fn content_output(
        &self,
        relation: Relation,
        observers: Vec<Arc<dyn AsyncContentObserver>>,
    ) -> QueryOutput {
        let context = self.inner.context.clone();
        let mut accumulated: Vec<Row> = Vec::new();
        QueryOutput::new(relation, move |event| match event {
            QueryEvent::Rows(mut rows) => accumulated.append(&mut rows),
            QueryEvent::Error(err) => {
                let observers = observers.clone();
                context.post(Box::new(move || {
                    for observer in &observers {
                        observer.relation_error(&err);
                    }
                }));
            }
            QueryEvent::Done => {
                let observers = observers.clone();
                let rows = std::mem::take(&mut accumulated);
                context.post(Box::new(move || {
                    for observer in &observers {
                        observer.relation_new_contents(rows.clone());
                    }
                }));
            }
        })
    }

    fn query_output(&self, relation: Relation, sink: QuerySink) -> QueryOutput {
        let context = self.inner.context.clone();
        let sink = Arc::new(Mutex::new(sink));
        QueryOutput::new(relation, move |event| {
            let sink = sink.clone();
            context.post(Box::new(move || {
                let mut sink = sink.lock();
                (*sink)(event);
            }));
        })
    }

    /// Runs on the context after the combined execution: either loops into
    /// the next batch or closes every open bracket and goes idle.
    fn finish(&self) {
        let looping = !self.inner.core.lock().pending.is_empty();
        if looping {
            // New actions arrived while running. Content observers receive
            // a paired didChange/willChange so they interpret the next
            // delivery as a replacement rather than an extension.
            let pairs: Vec<Arc<dyn AsyncContentObserver>> = {
                let observed = self.inner.observed.lock();
                observed
                    .values()
                    .flat_map(|entry| entry.content.values())
                    .filter(|r| r.will_change_sent)
                    .map(|r| r.observer.clone())
                    .collect()
            };
            for observer in pairs {
                observer.relation_did_change();
                observer.relation_will_change();
            }
            {
                self.inner.core.lock().state = ManagerState::Pending;
            }
            debug!("drain loops into next batch");
            let manager = self.clone();
            self.inner.context.post(Box::new(move || manager.drain()));
            return;
        }

        {
            self.inner.core.lock().state = ManagerState::Stopping;
        }

        // Close every open bracket: exactly one didChange per prior
        // willChange.
        let mut delta_targets: Vec<Arc<dyn AsyncDeltaObserver>> = Vec::new();
        let mut content_targets: Vec<Arc<dyn AsyncContentObserver>> = Vec::new();
        {
            let mut observed = self.inner.observed.lock();
            for entry in observed.values_mut() {
                for registration in entry.delta.values_mut() {
                    if registration.will_change_sent {
                        registration.will_change_sent = false;
                        delta_targets.push(registration.observer.clone());
                    }
                }
                for registration in entry.content.values_mut() {
                    if registration.will_change_sent {
                        registration.will_change_sent = false;
                        content_targets.push(registration.observer.clone());
                    }
                }
            }
        }
        for observer in delta_targets {
            observer.relation_did_change();
        }
        for observer in content_targets {
            observer.relation_did_change();
        }

        // A didChange callback may have registered new work; loop again
        // with fresh willChange brackets.
        let mut core = self.inner.core.lock();
        if core.pending.is_empty() {
            core.state = ManagerState::Idle;
            debug!("drain complete, idle");
            self.inner.idle.notify_all();
        } else {
            core.state = ManagerState::Pending;
            let manager = self.clone();
            self.inner.context.post(Box::new(move || manager.drain()));
        }
    }
}

/// Finds the transactional database owning a base relation, if any.
fn database_of(relation: &Relation) -> Option<TransactionalDatabase> {
    relation
        .as_source()?
        .as_any()
        .downcast_ref::<ChangeLoggingRelation>()?
        .database()
}

fn variable_in_database(variable: &Relation, database: &TransactionalDatabase) -> bool {
    database_of(variable).map_or(false, |d| d.same_identity(database))
}
