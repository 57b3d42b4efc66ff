//! Combined query execution.
//!
//! The runner executes a batch of output relations in one pass. Subtrees
//! shared between outputs (by node identity) are evaluated once; results
//! stream to each output's sink in bounded row batches, with `Done` as the
//! terminal event. An error ends that output's stream only; the other
//! outputs still run.

use hashbrown::{HashMap, HashSet};
use ravel_core::{Error, Result, Row};
use ravel_relation::{Operator, Relation, RelationId, RelationView};
use std::sync::Arc;

/// One event in an output's row stream.
#[derive(Debug)]
pub enum QueryEvent {
    /// A batch of result rows.
    Rows(Vec<Row>),
    /// Evaluation failed; terminal for this output's rows (Done follows).
    Error(Error),
    /// The output is complete.
    Done,
}

/// Sink receiving an output's stream.
pub type QuerySink = Box<dyn FnMut(QueryEvent) + Send>;

/// A relation to execute together with the sink its rows stream to.
pub struct QueryOutput {
    pub relation: Relation,
    pub sink: QuerySink,
}

impl QueryOutput {
    /// Pairs a relation with a sink.
    pub fn new<F>(relation: Relation, sink: F) -> Self
    where
        F: FnMut(QueryEvent) + Send + 'static,
    {
        Self {
            relation,
            sink: Box::new(sink),
        }
    }
}

/// Executes batches of relations with shared-subtree caching.
pub struct QueryRunner {
    batch_size: usize,
}

impl Default for QueryRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRunner {
    /// Creates a runner with the default row batch size.
    pub fn new() -> Self {
        Self { batch_size: 100 }
    }

    /// Creates a runner streaming rows in batches of `batch_size`.
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Executes every output in one combined pass.
    pub fn execute(&self, outputs: Vec<QueryOutput>) {
        let mut cache: HashMap<RelationId, Arc<HashSet<Row>>> = HashMap::new();
        for mut output in outputs {
            match self.evaluate(&output.relation, &mut cache) {
                Ok(rows) => {
                    let mut batch = Vec::with_capacity(self.batch_size.min(rows.len()));
                    for row in rows.iter() {
                        batch.push(row.clone());
                        if batch.len() == self.batch_size {
                            (output.sink)(QueryEvent::Rows(std::mem::take(&mut batch)));
                        }
                    }
                    if !batch.is_empty() {
                        (output.sink)(QueryEvent::Rows(batch));
                    }
                }
                Err(err) => (output.sink)(QueryEvent::Error(err)),
            }
            (output.sink)(QueryEvent::Done);
        }
    }

    /// Convenience: evaluates a single relation to its row set.
    pub fn run(&self, relation: &Relation) -> Result<HashSet<Row>> {
        let mut cache = HashMap::new();
        Ok(self.evaluate(relation, &mut cache)?.as_ref().clone())
    }

    fn evaluate(
        &self,
        relation: &Relation,
        cache: &mut HashMap<RelationId, Arc<HashSet<Row>>>,
    ) -> Result<Arc<HashSet<Row>>> {
        if let Some(cached) = cache.get(&relation.id()) {
            return Ok(cached.clone());
        }

        let rows: Arc<HashSet<Row>> = match relation.view() {
            RelationView::Source(source) => {
                let mut rows = HashSet::new();
                for row in source.rows() {
                    rows.insert(row?);
                }
                Arc::new(rows)
            }
            RelationView::Derived { op, left, right } => {
                if let Operator::Select(predicate) = op {
                    // An unsatisfiable predicate is empty without touching
                    // the operand.
                    if predicate.is_provably_false() {
                        let empty = Arc::new(HashSet::new());
                        cache.insert(relation.id(), empty.clone());
                        return Ok(empty);
                    }
                    // Push the predicate into the adapter when it supports
                    // native evaluation.
                    if let Some(source) = left.as_source() {
                        if let Some(native) = source.select_native(predicate) {
                            let rows = Arc::new(native.contents()?);
                            cache.insert(relation.id(), rows.clone());
                            return Ok(rows);
                        }
                    }
                }

                let left_rows = self.evaluate(left, cache)?;
                let right_rows = match right {
                    Some(r) => Some(self.evaluate(r, cache)?),
                    None => None,
                };
                Arc::new(op.apply(&left_rows, right_rows.as_deref())?)
            }
        };

        cache.insert(relation.id(), rows.clone());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use ravel_core::{attr, Row, Scheme, SelectExpression, Value};
    use ravel_relation::{ObserverRegistry, Source};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pet(id: i64, name: &str) -> Row {
        Row::new([("id", Value::Integer(id)), ("name", Value::from(name))])
    }

    fn collect(events: &Arc<Mutex<Vec<QueryEvent>>>) -> (HashSet<Row>, usize, bool) {
        let events = events.lock();
        let mut rows = HashSet::new();
        let mut errors = 0;
        let mut done = false;
        for event in events.iter() {
            match event {
                QueryEvent::Rows(batch) => rows.extend(batch.iter().cloned()),
                QueryEvent::Error(_) => errors += 1,
                QueryEvent::Done => done = true,
            }
        }
        (rows, errors, done)
    }

    #[test]
    fn test_streams_rows_and_done() {
        let pets = Relation::with_rows(
            Scheme::from(["id", "name"]),
            [pet(1, "cat"), pet(2, "dog")],
        )
        .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        QueryRunner::new().execute(vec![QueryOutput::new(pets.clone(), move |event| {
            events_clone.lock().push(event);
        })]);

        let (rows, errors, done) = collect(&events);
        assert_eq!(rows, [pet(1, "cat"), pet(2, "dog")].into_iter().collect());
        assert_eq!(errors, 0);
        assert!(done);
    }

    #[test]
    fn test_batches_bound_row_chunks() {
        let pets = Relation::with_rows(
            Scheme::from(["id"]),
            (0..10).map(|i| Row::new([("id", Value::Integer(i))])),
        )
        .unwrap();

        let batches = Arc::new(Mutex::new(Vec::new()));
        let batches_clone = batches.clone();
        QueryRunner::with_batch_size(3).execute(vec![QueryOutput::new(pets, move |event| {
            if let QueryEvent::Rows(rows) = event {
                batches_clone.lock().push(rows.len());
            }
        })]);

        let batches = batches.lock();
        assert_eq!(batches.iter().sum::<usize>(), 10);
        assert!(batches.iter().all(|&len| len <= 3));
    }

    /// A source that counts how often it is scanned.
    struct CountingSource {
        id: RelationId,
        scheme: Scheme,
        rows: HashSet<Row>,
        scans: AtomicUsize,
        observers: ObserverRegistry,
    }

    impl CountingSource {
        fn new(rows: HashSet<Row>) -> Self {
            Self {
                id: ravel_relation::next_relation_id(),
                scheme: Scheme::from(["id"]),
                rows,
                scans: AtomicUsize::new(0),
                observers: ObserverRegistry::new(),
            }
        }
    }

    impl Source for CountingSource {
        fn id(&self) -> RelationId {
            self.id
        }
        fn scheme(&self) -> Scheme {
            self.scheme.clone()
        }
        fn rows(&self) -> Vec<Result<Row>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            self.rows.iter().cloned().map(Ok).collect()
        }
        fn add_row(&self, _row: Row) -> Result<()> {
            unimplemented!("read-only test source")
        }
        fn delete_where(&self, _predicate: &SelectExpression) -> Result<()> {
            unimplemented!("read-only test source")
        }
        fn update_where(&self, _predicate: &SelectExpression, _new: &Row) -> Result<()> {
            unimplemented!("read-only test source")
        }
        fn observers(&self) -> &ObserverRegistry {
            &self.observers
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_shared_subtrees_evaluate_once() {
        let source = Arc::new(CountingSource::new(
            (0..5).map(|i| Row::new([("id", Value::Integer(i))])).collect(),
        ));
        let base = Relation::from_source(source.clone() as Arc<dyn Source>);
        let shared = base.select(attr("id").lt(4i64)).unwrap();
        let view_a = shared.select(attr("id").gt(0i64)).unwrap();
        let view_b = shared.select(attr("id").gt(2i64)).unwrap();

        QueryRunner::new().execute(vec![
            QueryOutput::new(view_a, |_| {}),
            QueryOutput::new(view_b, |_| {}),
        ]);

        assert_eq!(source.scans.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsatisfiable_select_skips_scan() {
        let source = Arc::new(CountingSource::new(
            (0..5).map(|i| Row::new([("id", Value::Integer(i))])).collect(),
        ));
        let base = Relation::from_source(source.clone() as Arc<dyn Source>);
        let never = base
            .select(attr("id").eq(1i64).and(attr("id").eq(2i64)))
            .unwrap();

        assert!(QueryRunner::new().run(&never).unwrap().is_empty());
        assert_eq!(source.scans.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_select_pushes_down_to_native_adapter() {
        /// A source that answers selects natively instead of being scanned.
        struct NativeSource {
            id: RelationId,
            observers: ObserverRegistry,
            scans: AtomicUsize,
        }

        impl Source for NativeSource {
            fn id(&self) -> RelationId {
                self.id
            }
            fn scheme(&self) -> Scheme {
                Scheme::from(["id"])
            }
            fn rows(&self) -> Vec<Result<Row>> {
                self.scans.fetch_add(1, Ordering::SeqCst);
                vec![Ok(Row::new([("id", Value::Integer(1))]))]
            }
            fn add_row(&self, _row: Row) -> Result<()> {
                unimplemented!()
            }
            fn delete_where(&self, _predicate: &SelectExpression) -> Result<()> {
                unimplemented!()
            }
            fn update_where(&self, _predicate: &SelectExpression, _new: &Row) -> Result<()> {
                unimplemented!()
            }
            fn observers(&self) -> &ObserverRegistry {
                &self.observers
            }
            fn select_native(&self, _predicate: &SelectExpression) -> Option<Relation> {
                Relation::with_rows(
                    Scheme::from(["id"]),
                    [Row::new([("id", Value::Integer(42))])],
                )
                .ok()
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let source = Arc::new(NativeSource {
            id: ravel_relation::next_relation_id(),
            observers: ObserverRegistry::new(),
            scans: AtomicUsize::new(0),
        });
        let base = Relation::from_source(source.clone() as Arc<dyn Source>);
        let selected = base.select(attr("id").gt(0i64)).unwrap();

        let rows = QueryRunner::new().run(&selected).unwrap();
        // The adapter answered; the base was never scanned.
        assert_eq!(rows, [Row::new([("id", Value::Integer(42))])].into_iter().collect());
        assert_eq!(source.scans.load(Ordering::SeqCst), 0);
    }

    /// A source whose iteration fails.
    struct FailingSource {
        id: RelationId,
        observers: ObserverRegistry,
    }

    impl Source for FailingSource {
        fn id(&self) -> RelationId {
            self.id
        }
        fn scheme(&self) -> Scheme {
            Scheme::from(["id"])
        }
        fn rows(&self) -> Vec<Result<Row>> {
            vec![Err(Error::storage("backing file vanished"))]
        }
        fn add_row(&self, _row: Row) -> Result<()> {
            unimplemented!()
        }
        fn delete_where(&self, _predicate: &SelectExpression) -> Result<()> {
            unimplemented!()
        }
        fn update_where(&self, _predicate: &SelectExpression, _new: &Row) -> Result<()> {
            unimplemented!()
        }
        fn observers(&self) -> &ObserverRegistry {
            &self.observers
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_error_ends_one_output_not_the_batch() {
        let failing = Relation::from_source(Arc::new(FailingSource {
            id: ravel_relation::next_relation_id(),
            observers: ObserverRegistry::new(),
        }) as Arc<dyn Source>);
        let healthy = Relation::with_rows(Scheme::from(["id"]), [Row::new([("id", Value::Integer(1))])])
            .unwrap();

        let failing_events = Arc::new(Mutex::new(Vec::new()));
        let healthy_events = Arc::new(Mutex::new(Vec::new()));
        let fe = failing_events.clone();
        let he = healthy_events.clone();

        QueryRunner::new().execute(vec![
            QueryOutput::new(failing, move |event| fe.lock().push(event)),
            QueryOutput::new(healthy, move |event| he.lock().push(event)),
        ]);

        let (rows, errors, done) = collect(&failing_events);
        assert!(rows.is_empty());
        assert_eq!(errors, 1);
        assert!(done);

        let (rows, errors, done) = collect(&healthy_events);
        assert_eq!(rows.len(), 1);
        assert_eq!(errors, 0);
        assert!(done);
    }
}
