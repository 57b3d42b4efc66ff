//! Ravel Incremental - the relation differentiator.
//!
//! Given a root algebraic expression, this crate produces its *derivative*:
//! for changes recorded on any reachable base relation, the precise
//! `(added, removed)` delta of the root, expressed as lazy relations in the
//! same algebra instead of a wholesale re-evaluation.
//!
//! It also hosts the conservative predicate consistency check the update
//! manager uses to skip observers a mutation provably cannot affect.
//!
//! # Example
//!
//! ```rust
//! use ravel_core::{attr, Row, Scheme, Value};
//! use ravel_relation::Relation;
//! use ravel_incremental::RelationDifferentiator;
//!
//! let pets = Relation::table(Scheme::from(["id", "name"]));
//! let cats = pets.select(attr("name").eq("cat")).unwrap();
//!
//! let derivative = std::sync::Arc::new(RelationDifferentiator::derivative(&cats));
//! let routed = derivative.clone();
//! let id = pets.id();
//! let _observer = pets.observe(move |change| {
//!     routed.add_change(id, change).unwrap();
//! });
//!
//! pets.add(Row::new([("id", Value::Integer(1)), ("name", Value::from("cat"))])).unwrap();
//! let change = derivative.change().unwrap().unwrap();
//! assert_eq!(change.added_rows().unwrap().len(), 1);
//! ```

mod consistency;
mod derivative;

pub use consistency::provably_inconsistent;
pub use derivative::{Derivative, RelationDifferentiator};
