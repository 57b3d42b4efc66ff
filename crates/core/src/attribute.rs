//! Attribute names and schemes.
//!
//! An `Attribute` is an interned column name; interning makes attribute
//! comparison cheap and keeps row storage compact. A `Scheme` is the
//! unordered set of attributes a relation's rows range over.

use crate::error::{Error, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

/// Process-wide intern table for attribute names.
static INTERN_TABLE: OnceLock<Mutex<HashSet<Arc<str>>>> = OnceLock::new();

fn intern(name: &str) -> Arc<str> {
    let table = INTERN_TABLE.get_or_init(|| Mutex::new(HashSet::new()));
    let mut table = table.lock();
    if let Some(existing) = table.get(name) {
        return existing.clone();
    }
    let interned: Arc<str> = Arc::from(name);
    table.insert(interned.clone());
    interned
}

/// An interned attribute (column) name.
#[derive(Clone, Debug, Eq)]
pub struct Attribute {
    name: Arc<str>,
}

impl Attribute {
    /// Creates (or looks up) the attribute with the given name.
    pub fn new(name: &str) -> Self {
        Self { name: intern(name) }
    }

    /// Returns the attribute name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        // Interning makes pointer equality the common case.
        Arc::ptr_eq(&self.name, &other.name) || self.name == other.name
    }
}

impl std::hash::Hash for Attribute {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for Attribute {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Attribute {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl From<&str> for Attribute {
    fn from(name: &str) -> Self {
        Attribute::new(name)
    }
}

impl From<String> for Attribute {
    fn from(name: String) -> Self {
        Attribute::new(&name)
    }
}

/// A mapping from old attribute names to new ones, used by `rename`.
pub type Renames = HashMap<Attribute, Attribute>;

/// An unordered set of attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scheme {
    attributes: HashSet<Attribute>,
}

impl Scheme {
    /// Creates an empty scheme.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of attributes.
    #[inline]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Returns true if the scheme has no attributes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Returns true if the scheme contains the attribute.
    #[inline]
    pub fn contains(&self, attribute: &Attribute) -> bool {
        self.attributes.contains(attribute)
    }

    /// Inserts an attribute. Returns true if it was not already present.
    pub fn insert(&mut self, attribute: Attribute) -> bool {
        self.attributes.insert(attribute)
    }

    /// Iterates over the attributes in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    /// Returns true if every attribute of `self` is in `other`.
    pub fn is_subset_of(&self, other: &Scheme) -> bool {
        self.attributes.is_subset(&other.attributes)
    }

    /// Returns the union of two schemes.
    pub fn union(&self, other: &Scheme) -> Scheme {
        Scheme {
            attributes: self.attributes.union(&other.attributes).cloned().collect(),
        }
    }

    /// Returns the intersection of two schemes.
    pub fn intersection(&self, other: &Scheme) -> Scheme {
        Scheme {
            attributes: self
                .attributes
                .intersection(&other.attributes)
                .cloned()
                .collect(),
        }
    }

    /// If the scheme has exactly one attribute, returns it.
    pub fn sole_attribute(&self) -> Option<&Attribute> {
        if self.attributes.len() == 1 {
            self.attributes.iter().next()
        } else {
            None
        }
    }

    /// Applies an attribute rename, verifying that the rename is a bijection
    /// over the attributes it touches and creates no collision.
    pub fn renamed(&self, renames: &Renames) -> Result<Scheme> {
        let mut targets: HashSet<&Attribute> = HashSet::with_capacity(renames.len());
        for (from, to) in renames {
            if !self.attributes.contains(from) {
                return Err(Error::scheme_violation(format!(
                    "rename source {} is not in the scheme",
                    from
                )));
            }
            if !targets.insert(to) {
                return Err(Error::scheme_violation(format!(
                    "rename target {} is used more than once",
                    to
                )));
            }
        }

        let mut result = HashSet::with_capacity(self.attributes.len());
        for attribute in &self.attributes {
            let renamed = renames.get(attribute).cloned().unwrap_or_else(|| attribute.clone());
            if !result.insert(renamed.clone()) {
                return Err(Error::scheme_violation(format!(
                    "rename target {} collides with an existing attribute",
                    renamed
                )));
            }
        }
        Ok(Scheme { attributes: result })
    }
}

impl FromIterator<Attribute> for Scheme {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        Scheme {
            attributes: iter.into_iter().collect(),
        }
    }
}

impl<const N: usize> From<[&str; N]> for Scheme {
    fn from(names: [&str; N]) -> Self {
        names.iter().map(|n| Attribute::new(n)).collect()
    }
}

impl From<&[&str]> for Scheme {
    fn from(names: &[&str]) -> Self {
        names.iter().map(|n| Attribute::new(n)).collect()
    }
}
