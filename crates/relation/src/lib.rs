//! Ravel Relation - relation values and lazy algebraic combinators.
//!
//! This crate provides the relation layer of the Ravel engine:
//!
//! - `Relation`: a cheaply clonable, identity-keyed handle over either a
//!   base relation (`Source`) or a lazy derived node
//! - `Operator`: the closed set of algebraic operations (union,
//!   intersection, difference, project, select, rename, equijoin,
//!   aggregate, otherwise, unique, update)
//! - `ConcreteTable`: the in-memory baseline base relation
//! - `RowStore` / `StoredRelation`: the storage adapter contract and its
//!   lifting into a base relation
//! - `RelationChange` and the synchronous `ObserverRegistry`
//!
//! # Example
//!
//! ```rust
//! use ravel_core::{attr, Row, Scheme, Value};
//! use ravel_relation::Relation;
//!
//! let pets = Relation::table(Scheme::from(["id", "name"]));
//! pets.add(Row::new([("id", Value::Integer(1)), ("name", Value::from("cat"))])).unwrap();
//!
//! let name = pets.select(attr("id").eq(1i64)).unwrap().project(["name"]).unwrap();
//! assert_eq!(name.one_string().unwrap(), Some("cat".into()));
//! ```

mod change;
mod concrete;
mod observer;
mod operator;
mod relation;
mod store;

pub use change::{ChangeAccumulator, RelationChange};
pub use concrete::ConcreteTable;
pub use observer::{ChangeCallback, ObserverId, ObserverRegistry, ObserverRemoval};
pub use operator::{AggregateFn, AggregateSpec, JoinMatching, Operator};
pub use relation::{next_relation_id, Relation, RelationId, RelationView, Source};
pub use store::{RowStore, StoredRelation};
