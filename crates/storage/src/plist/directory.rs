//! Row-per-file plist directory adapter.
//!
//! Each row lives in its own file. The filename is the lowercase hex SHA-256
//! of the canonical byte encoding of the row's primary-key value, sharded
//! into a two-character prefix directory, with a `.rowplist` extension:
//!
//! ```text
//! <root>/ab/ab12…ef.rowplist
//! ```
//!
//! File contents are the XML plist of the row, optionally wrapped by a
//! stream codec.

use super::codec::{canonical_encoding, decode_row, encode_row};
use super::StreamCodec;
use parking_lot::Mutex;
use ravel_core::{Attribute, Error, Result, Row, Scheme, SelectExpression, Value};
use ravel_relation::RowStore;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File extension for row files.
const ROW_EXTENSION: &str = "rowplist";

/// A row store keeping one plist file per row under a root directory.
pub struct PlistDirectoryStore {
    root: PathBuf,
    scheme: Scheme,
    primary_key: Attribute,
    codec: Option<Arc<dyn StreamCodec>>,
    /// Serializes scan-then-write cycles against the directory.
    lock: Mutex<()>,
}

impl PlistDirectoryStore {
    /// Creates an adapter over `root`, keyed by `primary_key`.
    pub fn new(root: impl AsRef<Path>, scheme: Scheme, primary_key: Attribute) -> Result<Self> {
        if !scheme.contains(&primary_key) {
            return Err(Error::scheme_violation(
                "primary key attribute is not in the scheme",
            ));
        }
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            scheme,
            primary_key,
            codec: None,
            lock: Mutex::new(()),
        })
    }

    /// Wraps row files with a stream codec.
    pub fn with_codec(mut self, codec: Arc<dyn StreamCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Computes the file path for a primary-key value.
    pub fn row_file_path(&self, key: &Value) -> Result<PathBuf> {
        let digest = Sha256::digest(canonical_encoding(key)?);
        let name = hex::encode(digest);
        Ok(self
            .root
            .join(&name[..2])
            .join(format!("{}.{}", name, ROW_EXTENSION)))
    }

    fn encode(&self, row: &Row) -> Result<Vec<u8>> {
        let bytes = encode_row(row)?;
        match &self.codec {
            Some(codec) => codec.encode(bytes),
            None => Ok(bytes),
        }
    }

    fn decode(&self, bytes: Vec<u8>) -> Result<Row> {
        let bytes = match &self.codec {
            Some(codec) => codec.decode(bytes)?,
            None => bytes,
        };
        decode_row(&bytes)
    }

    fn write_row(&self, row: &Row) -> Result<()> {
        let path = self.row_file_path(row.get(&self.primary_key))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, self.encode(row)?)?;
        Ok(())
    }

    /// Lists every row file currently present.
    fn row_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let prefix = entry?.path();
            if !prefix.is_dir() {
                continue;
            }
            for file in std::fs::read_dir(&prefix)? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) == Some(ROW_EXTENSION) {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    fn read_row(&self, path: &Path) -> Result<Row> {
        let bytes = std::fs::read(path)?;
        let row = self.decode(bytes)?;
        if !row.satisfies(&self.scheme) {
            return Err(Error::serialization(format!(
                "row file {:?} does not match the scheme",
                path
            )));
        }
        Ok(row)
    }
}

impl RowStore for PlistDirectoryStore {
    fn scheme(&self) -> Scheme {
        self.scheme.clone()
    }

    fn rows(&self) -> Vec<Result<Row>> {
        let _guard = self.lock.lock();
        let files = match self.row_files() {
            Ok(files) => files,
            Err(err) => return vec![Err(err)],
        };
        // A corrupt file surfaces as one error entry; the other rows still
        // iterate.
        files.iter().map(|path| self.read_row(path)).collect()
    }

    fn add(&self, row: Row) -> Result<()> {
        if !row.satisfies(&self.scheme) {
            return Err(Error::scheme_violation(
                "row attributes do not match the scheme",
            ));
        }
        let _guard = self.lock.lock();
        self.write_row(&row)
    }

    fn delete(&self, predicate: &SelectExpression) -> Result<()> {
        let _guard = self.lock.lock();
        for path in self.row_files()? {
            let row = self.read_row(&path)?;
            if predicate.matches(&row) {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn update(&self, predicate: &SelectExpression, new_values: &Row) -> Result<()> {
        if !new_values.scheme().is_subset_of(&self.scheme) {
            return Err(Error::scheme_violation(
                "update attributes are not a subset of the scheme",
            ));
        }
        let _guard = self.lock.lock();
        for path in self.row_files()? {
            let row = self.read_row(&path)?;
            if !predicate.matches(&row) {
                continue;
            }
            let updated = row.updated_by(new_values);
            if updated == row {
                continue;
            }
            // The key may have changed, moving the row to a new file.
            let new_path = self.row_file_path(updated.get(&self.primary_key))?;
            self.write_row(&updated)?;
            if new_path != path {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
