//! Ravel Core - value, row, scheme and expression types for the Ravel
//! reactive relational engine.
//!
//! This crate provides the foundational types the rest of the engine builds
//! on:
//!
//! - `Value`: tagged cell values with a total order (null < integer < real <
//!   text < blob); booleans are integers 0/1
//! - `Attribute` / `Scheme`: interned column names and attribute sets
//! - `Row`: an attribute → value mapping; missing lookups yield
//!   `Value::NotFound`
//! - `SelectExpression`: the predicate AST evaluated against rows
//! - `Error` / `Result`: the engine-wide error kinds
//!
//! # Example
//!
//! ```rust
//! use ravel_core::{attr, Row, Scheme, Value};
//!
//! let row = Row::new([("id", Value::Integer(1)), ("name", Value::from("cat"))]);
//! assert!(row.satisfies(&Scheme::from(["id", "name"])));
//! assert!(attr("id").eq(1i64).matches(&row));
//! ```

mod attribute;
mod error;
mod expr;
mod row;
mod value;

pub use attribute::{Attribute, Renames, Scheme};
pub use error::{Error, Result};
pub use expr::{attr, constant, CompareOp, SelectExpression};
pub use row::Row;
pub use value::{Value, FALSE, TRUE};
