//! Ravel Query - combined execution of relation expressions.
//!
//! The update manager hands this crate a batch of relations to evaluate in
//! one pass: per-observer derivative deltas, content refreshes and direct
//! queries. Subtrees shared between outputs evaluate once (nodes are keyed
//! by identity), rows stream to each sink in bounded batches, select
//! predicates push down into adapters that support native evaluation, and
//! provably unsatisfiable selects never touch their operands.

mod runner;

pub use runner::{QueryEvent, QueryOutput, QueryRunner, QuerySink};
