//! Row structure for the Ravel engine.
//!
//! A `Row` is a finite mapping from attributes to values. Entries are kept
//! sorted by attribute name so that equality, hashing and ordering are
//! deterministic regardless of construction order.

use crate::attribute::{Attribute, Renames, Scheme};
use crate::value::Value;

const NOT_FOUND: Value = Value::NotFound;

/// A row of a relation: an attribute → value mapping.
///
/// Looking up an attribute the row does not have yields `Value::NotFound`.
/// A row never stores `NotFound` as a value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Row {
    /// Entries sorted by attribute name.
    entries: Vec<(Attribute, Value)>,
}

impl Row {
    /// Creates a row from attribute/value pairs.
    ///
    /// Later pairs overwrite earlier ones with the same attribute, matching
    /// map semantics. `NotFound` must not be supplied as a value.
    pub fn new<A, V, I>(pairs: I) -> Self
    where
        A: Into<Attribute>,
        V: Into<Value>,
        I: IntoIterator<Item = (A, V)>,
    {
        let mut entries: Vec<(Attribute, Value)> = Vec::new();
        for (attribute, value) in pairs {
            let attribute = attribute.into();
            let value = value.into();
            debug_assert!(!value.is_not_found(), "rows may not store notFound");
            match entries.iter_mut().find(|(a, _)| *a == attribute) {
                Some(entry) => entry.1 = value,
                None => entries.push((attribute, value)),
            }
        }
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        Self { entries }
    }

    /// Creates an empty row.
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Returns the value for an attribute, or `NotFound` if absent.
    pub fn get(&self, attribute: &Attribute) -> &Value {
        match self.entries.binary_search_by(|(a, _)| a.cmp(attribute)) {
            Ok(index) => &self.entries[index].1,
            Err(_) => &NOT_FOUND,
        }
    }

    /// Returns the number of attributes in the row.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the row has no attributes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the (attribute, value) entries in attribute order.
    pub fn iter(&self) -> impl Iterator<Item = (&Attribute, &Value)> {
        self.entries.iter().map(|(a, v)| (a, v))
    }

    /// Returns the scheme this row's attributes form.
    pub fn scheme(&self) -> Scheme {
        self.entries.iter().map(|(a, _)| a.clone()).collect()
    }

    /// Returns true if the row's attribute set equals the scheme.
    pub fn satisfies(&self, scheme: &Scheme) -> bool {
        self.entries.len() == scheme.len()
            && self.entries.iter().all(|(a, _)| scheme.contains(a))
    }

    /// Restricts the row to the attributes of the given scheme.
    pub fn project(&self, scheme: &Scheme) -> Row {
        Row {
            entries: self
                .entries
                .iter()
                .filter(|(a, _)| scheme.contains(a))
                .cloned()
                .collect(),
        }
    }

    /// Returns a copy with attributes renamed. Attributes absent from the
    /// rename map are kept as-is.
    pub fn renamed(&self, renames: &Renames) -> Row {
        Row::new(self.entries.iter().map(|(a, v)| {
            let attribute = renames.get(a).cloned().unwrap_or_else(|| a.clone());
            (attribute, v.clone())
        }))
    }

    /// Returns a copy with the given values overwriting this row's values.
    /// Attributes only present in `new_values` are added.
    pub fn updated_by(&self, new_values: &Row) -> Row {
        Row::new(
            self.entries
                .iter()
                .map(|(a, v)| (a.clone(), v.clone()))
                .chain(new_values.iter().map(|(a, v)| (a.clone(), v.clone()))),
        )
    }

    /// Returns a copy combining this row with another; on overlap the other
    /// row's values win.
    pub fn combined_with(&self, other: &Row) -> Row {
        self.updated_by(other)
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = (&'a Attribute, &'a Value);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (Attribute, Value)>,
        fn(&'a (Attribute, Value)) -> (&'a Attribute, &'a Value),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().map(|(a, v)| (a, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        Row::new([("id", Value::Integer(1)), ("name", Value::from("cat"))])
    }

    #[test]
    fn test_row_lookup() {
        let row = sample_row();
        assert_eq!(row.get(&Attribute::new("id")), &Value::Integer(1));
        assert_eq!(row.get(&Attribute::new("name")), &Value::Text("cat".into()));
        assert_eq!(row.get(&Attribute::new("age")), &Value::NotFound);
    }

    #[test]
    fn test_row_equality_ignores_order() {
        let a = Row::new([("x", Value::Integer(1)), ("y", Value::Integer(2))]);
        let b = Row::new([("y", Value::Integer(2)), ("x", Value::Integer(1))]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_row_later_pair_wins() {
        let row = Row::new([("x", Value::Integer(1)), ("x", Value::Integer(2))]);
        assert_eq!(row.len(), 1);
        assert_eq!(row.get(&Attribute::new("x")), &Value::Integer(2));
    }

    #[test]
    fn test_row_scheme_and_satisfies() {
        let row = sample_row();
        let scheme = Scheme::from(["id", "name"]);
        assert_eq!(row.scheme(), scheme);
        assert!(row.satisfies(&scheme));
        assert!(!row.satisfies(&Scheme::from(["id"])));
        assert!(!row.satisfies(&Scheme::from(["id", "name", "age"])));
    }

    #[test]
    fn test_row_project() {
        let row = sample_row();
        let projected = row.project(&Scheme::from(["name"]));
        assert_eq!(projected, Row::new([("name", Value::from("cat"))]));
    }

    #[test]
    fn test_row_renamed() {
        let row = sample_row();
        let mut renames = Renames::new();
        renames.insert(Attribute::new("name"), Attribute::new("title"));
        let renamed = row.renamed(&renames);
        assert_eq!(renamed.get(&Attribute::new("title")), &Value::Text("cat".into()));
        assert_eq!(renamed.get(&Attribute::new("name")), &Value::NotFound);
    }

    #[test]
    fn test_row_updated_by() {
        let row = sample_row();
        let updated = row.updated_by(&Row::new([("name", Value::from("kat"))]));
        assert_eq!(updated.get(&Attribute::new("id")), &Value::Integer(1));
        assert_eq!(updated.get(&Attribute::new("name")), &Value::Text("kat".into()));
    }
}
