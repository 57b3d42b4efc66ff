//! Ravel Reactive - the asynchronous update manager.
//!
//! This crate ties the engine together: mutations register with an
//! `UpdateManager` pinned to a dispatch context, coalesce within a tick,
//! execute on a shared worker pool inside transactions, and propagate to
//! observers as precise deltas computed by the differentiator, bracketed
//! by the three-phase `willChange / changing / didChange` protocol.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ravel_core::{attr, Row, Scheme, Value};
//! use ravel_relation::Relation;
//! use ravel_reactive::{EventLoop, UpdateManager};
//!
//! let context = Arc::new(EventLoop::new());
//! let manager = UpdateManager::new(context);
//!
//! let pets = Relation::table(Scheme::from(["id", "name"]));
//! manager
//!     .register_add(&pets, Row::new([("id", Value::Integer(1)), ("name", Value::from("cat"))]))
//!     .unwrap();
//! manager.wait_until_idle();
//!
//! assert!(pets.contains(&Row::new([("id", Value::Integer(1)), ("name", Value::from("cat"))])).unwrap());
//! manager.shutdown();
//! ```

mod context;
mod manager;
mod observer;
mod worker;

pub use context::{DispatchContext, EventLoop, ImmediateContext, Task};
pub use manager::{AsyncObserverRemoval, ManagerState, UpdateManager};
pub use observer::{AsyncContentObserver, AsyncDeltaObserver};
pub use worker::WorkerPool;
