//! Plist-backed storage adapters.
//!
//! Two persistent adapters share the XML plist codec: `PlistFileStore`
//! serializes a whole table (scheme plus row array) under one path, and
//! `PlistDirectoryStore` keeps one file per row, named by the SHA-256 of the
//! primary key's canonical encoding.

mod codec;
mod directory;
mod file;

use ravel_core::Result;

pub use codec::{canonical_encoding, decode_row, decode_table, encode_row, encode_table};
pub use directory::PlistDirectoryStore;
pub use file::PlistFileStore;

/// An optional byte-stream transform applied to row files on their way to
/// and from disk (compression, encryption, framing).
pub trait StreamCodec: Send + Sync {
    /// Transforms plaintext bytes for storage.
    fn encode(&self, bytes: Vec<u8>) -> Result<Vec<u8>>;

    /// Reverses `encode`.
    fn decode(&self, bytes: Vec<u8>) -> Result<Vec<u8>>;
}
