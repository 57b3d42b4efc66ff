//! End-to-end scenarios for the async update pipeline.

use hashbrown::HashSet;
use parking_lot::Mutex;
use ravel_core::{attr, Attribute, Error, Row, Scheme, Value};
use ravel_reactive::{
    AsyncContentObserver, AsyncDeltaObserver, DispatchContext, EventLoop, UpdateManager,
};
use ravel_relation::{JoinMatching, Relation};
use ravel_storage::{MemoryStore, TransactionalDatabase};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Will,
    Added(Vec<Row>),
    Removed(Vec<Row>),
    Contents(Vec<Row>),
    Error(String),
    Did,
}

/// Records every delivery; usable as either observer flavor.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    will_count: AtomicUsize,
    did_count: AtomicUsize,
    on_did_change: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn counts(&self) -> (usize, usize) {
        (
            self.will_count.load(Ordering::SeqCst),
            self.did_count.load(Ordering::SeqCst),
        )
    }
}

impl AsyncDeltaObserver for Recorder {
    fn relation_will_change(&self) {
        self.will_count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(Event::Will);
    }
    fn relation_added_rows(&self, rows: &[Row]) {
        self.events.lock().push(Event::Added(rows.to_vec()));
    }
    fn relation_removed_rows(&self, rows: &[Row]) {
        self.events.lock().push(Event::Removed(rows.to_vec()));
    }
    fn relation_error(&self, error: &Error) {
        self.events.lock().push(Event::Error(error.to_string()));
    }
    fn relation_did_change(&self) {
        self.did_count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(Event::Did);
        if let Some(hook) = self.on_did_change.lock().take() {
            hook();
        }
    }
}

impl AsyncContentObserver for Recorder {
    fn relation_will_change(&self) {
        self.will_count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(Event::Will);
    }
    fn relation_new_contents(&self, rows: Vec<Row>) {
        self.events.lock().push(Event::Contents(rows));
    }
    fn relation_error(&self, error: &Error) {
        self.events.lock().push(Event::Error(error.to_string()));
    }
    fn relation_did_change(&self) {
        self.did_count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(Event::Did);
        if let Some(hook) = self.on_did_change.lock().take() {
            hook();
        }
    }
}

fn pet(id: i64, name: &str) -> Row {
    Row::new([("id", Value::Integer(id)), ("name", Value::from(name))])
}

fn stored_pets() -> Relation {
    let store = Arc::new(MemoryStore::new(Scheme::from(["id", "name"])));
    let relation = Relation::stored(store);
    relation.add(pet(1, "cat")).unwrap();
    relation.add(pet(2, "dog")).unwrap();
    relation
}

fn manager() -> (UpdateManager, Arc<EventLoop>) {
    let context = Arc::new(EventLoop::new());
    (UpdateManager::new(context.clone()), context)
}

/// Runs a closure on the owning context and waits for it, so a group of
/// registrations lands ahead of the drain tick and coalesces into one
/// batch, the way a real client on the context behaves.
fn run_on<F: FnOnce() + Send + 'static>(context: &Arc<EventLoop>, f: F) {
    let (tx, rx) = std::sync::mpsc::channel();
    context.post(Box::new(move || {
        f();
        tx.send(()).unwrap();
    }));
    rx.recv().unwrap();
}

/// A basic delta: update one observed row, receive exactly
/// willChange, newContents, didChange, and see the new value.
#[test]
fn scenario_basic_delta() {
    let (manager, _context) = manager();
    let pets = stored_pets();
    let name = pets
        .select(attr("id").eq(1i64))
        .unwrap()
        .project(["name"])
        .unwrap();
    assert_eq!(name.one_string().unwrap(), Some("cat".into()));

    let recorder = Recorder::new();
    let _removal = manager.observe_content(&name, recorder.clone());

    manager
        .register_update(
            &pets,
            attr("id").eq(1i64),
            Row::new([("name", Value::from("kat"))]),
        )
        .unwrap();
    manager.wait_until_idle();

    assert_eq!(
        recorder.events(),
        vec![
            Event::Will,
            Event::Contents(vec![Row::new([("name", Value::from("kat"))])]),
            Event::Did,
        ]
    );
    assert_eq!(name.one_string().unwrap(), Some("kat".into()));
    manager.shutdown();
}

/// A mutation provably outside the observed region is filtered out
/// entirely: no willChange, no didChange.
#[test]
fn scenario_unrelated_mutation_is_filtered() {
    let (manager, _context) = manager();
    let pets = stored_pets();
    let first = pets.select(attr("id").eq(1i64)).unwrap();

    let recorder = Recorder::new();
    let _removal = manager.observe_content(&first, recorder.clone());

    manager.register_add(&pets, pet(3, "fish")).unwrap();
    manager.wait_until_idle();

    assert_eq!(recorder.events(), Vec::<Event>::new());
    assert_eq!(recorder.counts(), (0, 0));
    // The mutation itself still applied.
    assert!(pets.contains(&pet(3, "fish")).unwrap());
    manager.shutdown();
}

fn tree_row(id: i64, parent: i64, order: i64) -> Row {
    Row::new([
        ("id", Value::Integer(id)),
        ("parent", Value::Integer(parent)),
        ("order", Value::Integer(order)),
    ])
}

/// Moving one node of an ordered tree reports exactly one
/// removed/added pair and leaves the remaining siblings' order attributes
/// untouched.
#[test]
fn scenario_tree_move_is_minimal() {
    let (manager, _context) = manager();
    let store = Arc::new(MemoryStore::new(Scheme::from(["id", "parent", "order"])));
    let collection = Relation::stored(store);

    // Group1 → {Collection1 → {Child1, Child2}, Page1, Page2}, Group2.
    let group1 = tree_row(1, 0, 0);
    let group2 = tree_row(2, 0, 1);
    let collection1 = tree_row(3, 1, 0);
    let page1 = tree_row(4, 1, 1);
    let page2 = tree_row(5, 1, 2);
    let child1 = tree_row(6, 3, 0);
    let child2 = tree_row(7, 3, 1);
    for row in [&group1, &group2, &collection1, &page1, &page2, &child1, &child2] {
        collection.add(row.clone()).unwrap();
    }

    let shape = collection.project(["id", "parent", "order"]).unwrap();
    let recorder = Recorder::new();
    let _removal = manager.observe_delta(&shape, recorder.clone());

    // Move Child2 to be the first child of Group2.
    manager
        .register_update(
            &collection,
            attr("id").eq(7i64),
            Row::new([("parent", Value::Integer(2)), ("order", Value::Integer(0))]),
        )
        .unwrap();
    manager.wait_until_idle();

    let mut added: Vec<Row> = Vec::new();
    let mut removed: Vec<Row> = Vec::new();
    for event in recorder.events() {
        match event {
            Event::Added(rows) => added.extend(rows),
            Event::Removed(rows) => removed.extend(rows),
            _ => {}
        }
    }

    // Exactly one move: src = (Collection1, 1), dst = (Group2, 0).
    assert_eq!(added, vec![tree_row(7, 2, 0)]);
    assert_eq!(removed, vec![tree_row(7, 3, 1)]);
    assert_eq!(recorder.counts(), (1, 1));

    // The remaining sibling in Collection1 keeps its order attribute.
    assert!(collection.contains(&child1).unwrap());
    assert!(collection.contains(&page1).unwrap());
    manager.shutdown();
}

/// Transactional undo via snapshots: backward and forward restores
/// reproduce the exact states, each with one willChange/didChange per
/// affected observer.
#[test]
fn scenario_transactional_undo() {
    let (manager, _context) = manager();
    let db = TransactionalDatabase::new();
    let pets = db
        .add_relation("pets", Arc::new(MemoryStore::new(Scheme::from(["id", "name"]))))
        .unwrap();
    pets.add(pet(1, "cat")).unwrap();
    pets.add(pet(2, "dog")).unwrap();

    let recorder = Recorder::new();
    let _removal = manager.observe_content(&pets, recorder.clone());

    // One batch: add (10, "x") and delete (2, "dog") in one transaction.
    let before = db.take_snapshot();
    {
        let manager = manager.clone();
        let pets = pets.clone();
        run_on(&_context, move || {
            manager.register_add(&pets, pet(10, "x")).unwrap();
            manager.register_delete(&pets, attr("id").eq(2i64)).unwrap();
        });
    }
    manager.wait_until_idle();
    let after = db.take_snapshot();

    let post_state: HashSet<Row> = [pet(1, "cat"), pet(10, "x")].into_iter().collect();
    assert_eq!(pets.contents().unwrap(), post_state);
    assert_eq!(recorder.counts(), (1, 1));

    // backward = restore(before).
    manager.register_restore_snapshot(&db, before).unwrap();
    manager.wait_until_idle();
    assert_eq!(
        pets.contents().unwrap(),
        [pet(1, "cat"), pet(2, "dog")].into_iter().collect::<HashSet<Row>>()
    );
    assert_eq!(recorder.counts(), (2, 2));

    // forward = restore(after).
    manager.register_restore_snapshot(&db, after).unwrap();
    manager.wait_until_idle();
    assert_eq!(pets.contents().unwrap(), post_state);
    assert_eq!(recorder.counts(), (3, 3));

    manager.shutdown();
}

/// A batch touching both sides of an equijoin yields the combined row
/// exactly once.
#[test]
fn scenario_equijoin_batch_reports_once() {
    let (manager, _context) = manager();
    let routes = Relation::stored(Arc::new(MemoryStore::new(Scheme::from([
        "number", "from", "to",
    ]))));
    let based = Relation::stored(Arc::new(MemoryStore::new(Scheme::from([
        "pilot", "airport",
    ]))));

    let mut matching = JoinMatching::new();
    matching.insert(Attribute::new("from"), Attribute::new("airport"));
    let joined = routes.equijoin(&based, matching).unwrap();

    let recorder = Recorder::new();
    let _removal = manager.observe_delta(&joined, recorder.clone());

    {
        let manager = manager.clone();
        let routes = routes.clone();
        let based = based.clone();
        run_on(&_context, move || {
            manager
                .register_add(
                    &routes,
                    Row::new([
                        ("number", Value::Integer(117)),
                        ("from", Value::from("Atlanta")),
                        ("to", Value::from("Boston")),
                    ]),
                )
                .unwrap();
            manager
                .register_add(
                    &based,
                    Row::new([
                        ("pilot", Value::from("Temple")),
                        ("airport", Value::from("Atlanta")),
                    ]),
                )
                .unwrap();
        });
    }
    manager.wait_until_idle();

    let mut added: Vec<Row> = Vec::new();
    let mut removed: Vec<Row> = Vec::new();
    for event in recorder.events() {
        match event {
            Event::Added(rows) => added.extend(rows),
            Event::Removed(rows) => removed.extend(rows),
            _ => {}
        }
    }
    assert!(removed.is_empty());
    assert_eq!(added.len(), 1, "combined row must be reported exactly once");
    let row = &added[0];
    assert_eq!(row.get(&Attribute::new("number")), &Value::Integer(117));
    assert_eq!(row.get(&Attribute::new("from")), &Value::Text("Atlanta".into()));
    assert_eq!(row.get(&Attribute::new("to")), &Value::Text("Boston".into()));
    assert_eq!(row.get(&Attribute::new("pilot")), &Value::Text("Temple".into()));
    assert_eq!(recorder.counts(), (1, 1));
    manager.shutdown();
}

/// Registering a mutation from inside didChange loops the manager;
/// willChange and didChange counts balance at quiescence.
#[test]
fn scenario_reentrant_registration() {
    let (manager, _context) = manager();
    let pets = stored_pets();
    let view = pets.select(attr("id").eq(1i64)).unwrap();

    let recorder = Recorder::new();
    {
        let manager = manager.clone();
        let pets = pets.clone();
        *recorder.on_did_change.lock() = Some(Box::new(move || {
            manager
                .register_update(
                    &pets,
                    attr("id").eq(1i64),
                    Row::new([("name", Value::from("tomcat"))]),
                )
                .unwrap();
        }));
    }
    let _removal = manager.observe_content(&view, recorder.clone());

    manager
        .register_update(
            &pets,
            attr("id").eq(1i64),
            Row::new([("name", Value::from("kitten"))]),
        )
        .unwrap();
    manager.wait_until_idle();

    let (will, did) = recorder.counts();
    assert_eq!(will, did, "brackets must balance at quiescence");
    assert_eq!(will, 2);
    assert_eq!(
        view.one_row().unwrap(),
        Some(pet(1, "tomcat")),
        "the re-entrant mutation applied"
    );

    // The event stream is a well-formed sequence of two brackets.
    let events = recorder.events();
    assert_eq!(events.first(), Some(&Event::Will));
    assert_eq!(events.last(), Some(&Event::Did));
    manager.shutdown();
}

/// Direct queries ride the same combined execution and deliver on the
/// manager's context.
#[test]
fn query_action_streams_rows() {
    let (manager, _context) = manager();
    let pets = stored_pets();

    let rows: Arc<Mutex<Vec<Row>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));
    {
        let rows = rows.clone();
        let done = done.clone();
        manager
            .register_query(&pets, move |event| match event {
                ravel_query::QueryEvent::Rows(batch) => rows.lock().extend(batch),
                ravel_query::QueryEvent::Done => {
                    done.fetch_add(1, Ordering::SeqCst);
                }
                ravel_query::QueryEvent::Error(err) => panic!("unexpected error: {}", err),
            })
            .unwrap();
    }
    manager.wait_until_idle();

    assert_eq!(done.load(Ordering::SeqCst), 1);
    let rows: HashSet<Row> = rows.lock().iter().cloned().collect();
    assert_eq!(rows, [pet(1, "cat"), pet(2, "dog")].into_iter().collect());
    manager.shutdown();
}

/// Actions registered with the same manager coalesce into one drain and
/// one bracket pair.
#[test]
fn actions_coalesce_within_a_tick() {
    let (manager, _context) = manager();
    let pets = stored_pets();

    let recorder = Recorder::new();
    let _removal = manager.observe_content(&pets, recorder.clone());

    {
        let manager = manager.clone();
        let pets = pets.clone();
        run_on(&_context, move || {
            manager.register_add(&pets, pet(3, "eel")).unwrap();
            manager.register_add(&pets, pet(4, "fox")).unwrap();
            manager.register_delete(&pets, attr("id").eq(2i64)).unwrap();
        });
    }
    manager.wait_until_idle();

    // One coalesced bracket around the whole batch.
    assert_eq!(recorder.counts(), (1, 1));
    let contents: Vec<Vec<Row>> = recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Contents(rows) => Some(rows),
            _ => None,
        })
        .collect();
    assert_eq!(contents.len(), 1);
    assert_eq!(
        contents[0].iter().cloned().collect::<HashSet<Row>>(),
        [pet(1, "cat"), pet(3, "eel"), pet(4, "fox")].into_iter().collect()
    );
    manager.shutdown();
}

/// Observer deregistration is honored for subsequent deliveries.
#[test]
fn removed_observer_receives_nothing_further() {
    let (manager, _context) = manager();
    let pets = stored_pets();

    let recorder = Recorder::new();
    let removal = manager.observe_content(&pets, recorder.clone());

    manager.register_add(&pets, pet(3, "eel")).unwrap();
    manager.wait_until_idle();
    assert_eq!(recorder.counts(), (1, 1));

    assert!(removal.remove());
    manager.register_add(&pets, pet(4, "fox")).unwrap();
    manager.wait_until_idle();
    assert_eq!(recorder.counts(), (1, 1));
    manager.shutdown();
}

/// After shutdown the manager refuses new registrations.
#[test]
fn shutdown_refuses_new_actions() {
    let (manager, _context) = manager();
    let pets = stored_pets();

    manager.register_add(&pets, pet(3, "eel")).unwrap();
    manager.shutdown();

    // The pending action drained before shutdown returned.
    assert!(pets.contains(&pet(3, "eel")).unwrap());
    assert!(manager.register_add(&pets, pet(4, "fox")).is_err());
}
