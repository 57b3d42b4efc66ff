//! Single-file plist adapter: a whole table in one XML plist.

use super::codec::{decode_table, encode_table};
use hashbrown::HashSet;
use parking_lot::Mutex;
use ravel_core::{Error, Result, Row, Scheme, SelectExpression};
use ravel_relation::RowStore;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// A row store that serializes its scheme and entire row array as one plist
/// under a caller-supplied path.
pub struct PlistFileStore {
    path: PathBuf,
    scheme: Scheme,
    /// Serializes read-modify-write cycles against the file.
    lock: Mutex<()>,
}

impl PlistFileStore {
    /// Opens (or prepares to create) the table at `path`.
    ///
    /// If the file already exists its scheme must match; a missing file is
    /// an empty table that will be created on first mutation.
    pub fn new(path: impl AsRef<Path>, scheme: Scheme) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            scheme,
            lock: Mutex::new(()),
        };
        if store.path.exists() {
            let (existing, _) = store.read_file()?;
            if existing != store.scheme {
                return Err(Error::scheme_violation(
                    "existing file has a different scheme",
                ));
            }
        }
        Ok(store)
    }

    /// Returns the backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<(Scheme, HashSet<Row>)> {
        match std::fs::read(&self.path) {
            Ok(bytes) => decode_table(&bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Ok((self.scheme.clone(), HashSet::new()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_file(&self, rows: &HashSet<Row>) -> Result<()> {
        let bytes = encode_table(&self.scheme, rows)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

impl RowStore for PlistFileStore {
    fn scheme(&self) -> Scheme {
        self.scheme.clone()
    }

    fn rows(&self) -> Vec<Result<Row>> {
        let _guard = self.lock.lock();
        match self.read_file() {
            Ok((_, rows)) => rows.into_iter().map(Ok).collect(),
            Err(err) => vec![Err(err)],
        }
    }

    fn add(&self, row: Row) -> Result<()> {
        if !row.satisfies(&self.scheme) {
            return Err(Error::scheme_violation(
                "row attributes do not match the scheme",
            ));
        }
        let _guard = self.lock.lock();
        let (_, mut rows) = self.read_file()?;
        if rows.insert(row) {
            self.write_file(&rows)?;
        }
        Ok(())
    }

    fn delete(&self, predicate: &SelectExpression) -> Result<()> {
        let _guard = self.lock.lock();
        let (_, mut rows) = self.read_file()?;
        let before = rows.len();
        rows.retain(|row| !predicate.matches(row));
        if rows.len() != before {
            self.write_file(&rows)?;
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
        let (_, rows) = self.read_file()?;
        let updated: HashSet<Row> = rows
            .iter()
            .map(|row| {
                if predicate.matches(row) {
                    row.updated_by(new_values)
                } else {
                    row.clone()
                }
            })
            .collect();
        if updated != rows {
            self.write_file(&updated)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_core::{attr, Value};

    fn pet(id: i64, name: &str) -> Row {
        Row::new([("id", Value::Integer(id)), ("name", Value::from(name))])
    }

    #[test]
    fn test_file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pets.plist");
        let scheme = Scheme::from(["id", "name"]);

        {
            let store = PlistFileStore::new(&path, scheme.clone()).unwrap();
            store.add(pet(1, "cat")).unwrap();
            store.add(pet(2, "dog")).unwrap();
        }

        let store = PlistFileStore::new(&path, scheme).unwrap();
        let rows: HashSet<Row> = store.rows().into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(rows, [pet(1, "cat"), pet(2, "dog")].into_iter().collect());
    }

    #[test]
    fn test_file_store_update_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pets.plist");
        let store = PlistFileStore::new(&path, Scheme::from(["id", "name"])).unwrap();

        store.add(pet(1, "cat")).unwrap();
        store.add(pet(2, "dog")).unwrap();

        store
            .update(&attr("id").eq(1i64), &Row::new([("name", Value::from("kat"))]))
            .unwrap();
        store.delete(&attr("id").eq(2i64)).unwrap();

        let rows: HashSet<Row> = store.rows().into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(rows, [pet(1, "kat")].into_iter().collect());
    }

    #[test]
    fn test_file_store_scheme_mismatch_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pets.plist");

        let store = PlistFileStore::new(&path, Scheme::from(["id", "name"])).unwrap();
        store.add(pet(1, "cat")).unwrap();

        assert!(PlistFileStore::new(&path, Scheme::from(["id"])).is_err());
    }
}
