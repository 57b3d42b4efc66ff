//! Asynchronous observer traits and removal handles.
//!
//! Two asynchronous flavors exist beside the synchronous callbacks of the
//! relation layer: delta observers receive streamed row deltas, content
//! observers receive a full replacement row set. Both are bracketed by
//! `relation_will_change` / `relation_did_change`, and at every quiescent
//! point the two bracket counts are equal per observer.

use ravel_core::{Error, Row};

/// An observer receiving incremental row deltas.
///
/// `relation_added_rows` / `relation_removed_rows` may each be called
/// multiple times with row batches between one willChange/didChange pair.
pub trait AsyncDeltaObserver: Send + Sync {
    /// The observed relation may be about to change.
    fn relation_will_change(&self);

    /// A batch of rows entered the observed relation.
    fn relation_added_rows(&self, rows: &[Row]);

    /// A batch of rows left the observed relation.
    fn relation_removed_rows(&self, rows: &[Row]);

    /// Delta computation failed; terminal alternative to row delivery.
    fn relation_error(&self, error: &Error);

    /// The bracketing close; always follows a prior willChange.
    fn relation_did_change(&self);
}

/// An observer receiving the full contents after each change.
pub trait AsyncContentObserver: Send + Sync {
    /// The observed relation may be about to change.
    fn relation_will_change(&self);

    /// The relation's complete new contents.
    fn relation_new_contents(&self, rows: Vec<Row>);

    /// Content computation failed; terminal alternative to row delivery.
    fn relation_error(&self, error: &Error);

    /// The bracketing close; always follows a prior willChange.
    fn relation_did_change(&self);
}
