//! The `Relation` value: base sources and lazy derived nodes.
//!
//! A `Relation` is a cheaply clonable handle. Base relations (concrete
//! tables, stored relations, change-logging relations) implement `Source`;
//! derived relations carry an `Operator` and operand handles and re-evaluate
//! on demand. Relations compare by identity, not by extensional content:
//! every node carries a process-wide monotonically increasing `RelationId`.

use crate::observer::{ObserverRegistry, ObserverRemoval};
use crate::operator::{AggregateSpec, JoinMatching, Operator};
use hashbrown::HashSet;
use ravel_core::{Attribute, Error, Renames, Result, Row, Scheme, SelectExpression, Value};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a relation node.
pub type RelationId = u64;

/// Global relation ID counter.
static NEXT_RELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Gets the next unique relation ID.
pub fn next_relation_id() -> RelationId {
    NEXT_RELATION_ID.fetch_add(1, Ordering::SeqCst)
}

/// A base relation: a leaf variable the differentiator can track.
///
/// Sources own their rows (or delegate to a storage adapter), serialize
/// mutations, compute the precise delta of every mutation and notify their
/// synchronous observers with it.
pub trait Source: Send + Sync {
    /// The stable identity of this base relation.
    fn id(&self) -> RelationId;

    /// The scheme all rows satisfy.
    fn scheme(&self) -> Scheme;

    /// A snapshot of the current rows. Errors are per-row; a caller stops at
    /// the first error it cares about.
    fn rows(&self) -> Vec<Result<Row>>;

    /// Returns true if the row is currently present.
    fn contains(&self, row: &Row) -> Result<bool> {
        for candidate in self.rows() {
            if &candidate? == row {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Adds a row. Adding an already-present row is a no-op.
    fn add_row(&self, row: Row) -> Result<()>;

    /// Deletes the rows matching the predicate.
    fn delete_where(&self, predicate: &SelectExpression) -> Result<()>;

    /// Overwrites attributes of the rows matching the predicate.
    fn update_where(&self, predicate: &SelectExpression, new_values: &Row) -> Result<()>;

    /// The synchronous observer registry for this base relation.
    fn observers(&self) -> &ObserverRegistry;

    /// If the backing adapter can evaluate the predicate natively, returns a
    /// relation that does so.
    fn select_native(&self, predicate: &SelectExpression) -> Option<Relation> {
        let _ = predicate;
        None
    }

    /// Downcast support for callers that know the concrete source type.
    fn as_any(&self) -> &dyn Any;
}

enum Kind {
    Source(Arc<dyn Source>),
    Derived {
        op: Operator,
        left: Relation,
        right: Option<Relation>,
    },
}

struct RelationInner {
    id: RelationId,
    scheme: Scheme,
    kind: Kind,
}

/// A relation handle: a base source or a lazy algebraic node.
#[derive(Clone)]
pub struct Relation {
    inner: Arc<RelationInner>,
}

/// A borrowed view of a relation's structure, for pattern matching.
pub enum RelationView<'a> {
    /// A base relation.
    Source(&'a Arc<dyn Source>),
    /// A derived node with its operator and operands.
    Derived {
        op: &'a Operator,
        left: &'a Relation,
        right: Option<&'a Relation>,
    },
}

impl Relation {
    /// Wraps a base source. The relation's identity is the source's.
    pub fn from_source(source: Arc<dyn Source>) -> Self {
        Self {
            inner: Arc::new(RelationInner {
                id: source.id(),
                scheme: source.scheme(),
                kind: Kind::Source(source),
            }),
        }
    }

    /// Builds a derived node, validating operand schemes.
    pub fn derived(op: Operator, left: Relation, right: Option<Relation>) -> Result<Self> {
        let right_scheme = right.as_ref().map(|r| r.scheme().clone());
        let scheme = op.result_scheme(left.scheme(), right_scheme.as_ref())?;
        Ok(Self {
            inner: Arc::new(RelationInner {
                id: next_relation_id(),
                scheme,
                kind: Kind::Derived { op, left, right },
            }),
        })
    }

    /// Returns this relation's identity.
    #[inline]
    pub fn id(&self) -> RelationId {
        self.inner.id
    }

    /// Returns this relation's scheme.
    #[inline]
    pub fn scheme(&self) -> &Scheme {
        &self.inner.scheme
    }

    /// Returns a structural view for pattern matching.
    pub fn view(&self) -> RelationView<'_> {
        match &self.inner.kind {
            Kind::Source(source) => RelationView::Source(source),
            Kind::Derived { op, left, right } => RelationView::Derived {
                op,
                left,
                right: right.as_ref(),
            },
        }
    }

    /// Returns the underlying source if this is a base relation.
    pub fn as_source(&self) -> Option<&Arc<dyn Source>> {
        match &self.inner.kind {
            Kind::Source(source) => Some(source),
            Kind::Derived { .. } => None,
        }
    }

    /// Returns true if the two handles denote the same node.
    #[inline]
    pub fn same_identity(&self, other: &Relation) -> bool {
        self.inner.id == other.inner.id
    }

    // ===== combinators =====

    /// Rows present in `self` or `other`.
    pub fn union(&self, other: &Relation) -> Result<Relation> {
        Relation::derived(Operator::Union, self.clone(), Some(other.clone()))
    }

    /// Rows present in both `self` and `other`.
    pub fn intersection(&self, other: &Relation) -> Result<Relation> {
        Relation::derived(Operator::Intersection, self.clone(), Some(other.clone()))
    }

    /// Rows of `self` absent from `other`.
    pub fn difference(&self, other: &Relation) -> Result<Relation> {
        Relation::derived(Operator::Difference, self.clone(), Some(other.clone()))
    }

    /// Restricts rows to the given attributes.
    pub fn project<S: Into<Scheme>>(&self, scheme: S) -> Result<Relation> {
        Relation::derived(Operator::Project(scheme.into()), self.clone(), None)
    }

    /// Rows for which the predicate holds.
    pub fn select(&self, predicate: SelectExpression) -> Result<Relation> {
        Relation::derived(Operator::Select(predicate), self.clone(), None)
    }

    /// Renames attributes; the rename must be a bijection creating no
    /// collision.
    pub fn rename(&self, renames: Renames) -> Result<Relation> {
        Relation::derived(Operator::Rename(renames), self.clone(), None)
    }

    /// Combines rows of `self` and `other` whose matched attributes are
    /// equal.
    pub fn equijoin(&self, other: &Relation, matching: JoinMatching) -> Result<Relation> {
        Relation::derived(Operator::Equijoin(matching), self.clone(), Some(other.clone()))
    }

    /// Folds an attribute's values into an at-most-one-row relation.
    pub fn aggregate(&self, spec: AggregateSpec) -> Result<Relation> {
        Relation::derived(Operator::Aggregate(spec), self.clone(), None)
    }

    /// The smallest value of the attribute.
    pub fn min<A: Into<Attribute>>(&self, attribute: A) -> Result<Relation> {
        self.aggregate(AggregateSpec::min(attribute.into()))
    }

    /// The largest value of the attribute.
    pub fn max<A: Into<Attribute>>(&self, attribute: A) -> Result<Relation> {
        self.aggregate(AggregateSpec::max(attribute.into()))
    }

    /// The number of rows, as a one-row relation over the attribute.
    pub fn count<A: Into<Attribute>>(&self, attribute: A) -> Result<Relation> {
        self.aggregate(AggregateSpec::count(attribute.into()))
    }

    /// `self` if non-empty, else `other`.
    pub fn otherwise(&self, other: &Relation) -> Result<Relation> {
        Relation::derived(Operator::Otherwise, self.clone(), Some(other.clone()))
    }

    /// `self` if every row's attribute equals the value, else empty.
    pub fn unique<A: Into<Attribute>, V: Into<Value>>(&self, attribute: A, value: V) -> Result<Relation> {
        Relation::derived(
            Operator::Unique {
                attribute: attribute.into(),
                value: value.into(),
            },
            self.clone(),
            None,
        )
    }

    /// Every row with the given attributes overwritten.
    pub fn updating(&self, new_values: Row) -> Result<Relation> {
        Relation::derived(Operator::Update(new_values), self.clone(), None)
    }

    // ===== evaluation =====

    /// Evaluates the relation to its current row set.
    pub fn contents(&self) -> Result<HashSet<Row>> {
        match &self.inner.kind {
            Kind::Source(source) => {
                let mut result = HashSet::new();
                for row in source.rows() {
                    result.insert(row?);
                }
                Ok(result)
            }
            Kind::Derived { op, left, right } => {
                // An unsatisfiable select never touches its operand.
                if let Operator::Select(predicate) = op {
                    if predicate.is_provably_false() {
                        return Ok(HashSet::new());
                    }
                }
                let left_rows = left.contents()?;
                let right_rows = match right {
                    Some(r) => Some(r.contents()?),
                    None => None,
                };
                op.apply(&left_rows, right_rows.as_ref())
            }
        }
    }

    /// Iterates the relation's rows; a single error ends the sequence.
    pub fn rows(&self) -> Vec<Result<Row>> {
        match &self.inner.kind {
            Kind::Source(source) => source.rows(),
            Kind::Derived { .. } => match self.contents() {
                Ok(rows) => rows.into_iter().map(Ok).collect(),
                Err(err) => vec![Err(err)],
            },
        }
    }

    /// Returns true if the relation currently has no rows.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.contents()?.is_empty())
    }

    /// Returns the number of rows.
    pub fn count_rows(&self) -> Result<usize> {
        Ok(self.contents()?.len())
    }

    /// Returns true if the row is currently present.
    pub fn contains(&self, row: &Row) -> Result<bool> {
        match &self.inner.kind {
            Kind::Source(source) => source.contains(row),
            Kind::Derived { .. } => Ok(self.contents()?.contains(row)),
        }
    }

    /// Returns the sole row, or None when the relation is empty or has more
    /// than one row.
    pub fn one_row(&self) -> Result<Option<Row>> {
        let rows = self.contents()?;
        if rows.len() == 1 {
            Ok(rows.into_iter().next())
        } else {
            Ok(None)
        }
    }

    /// For a one-attribute relation, the sole row's value.
    pub fn one_value(&self) -> Result<Option<Value>> {
        let attribute = match self.inner.scheme.sole_attribute() {
            Some(a) => a.clone(),
            None => return Ok(None),
        };
        Ok(self.one_row()?.map(|row| row.get(&attribute).clone()))
    }

    /// For a one-attribute relation of text, the sole row's string.
    pub fn one_string(&self) -> Result<Option<String>> {
        Ok(self
            .one_value()?
            .and_then(|value| value.as_text().map(str::to_owned)))
    }

    // ===== mutation (base relations only) =====

    fn source(&self) -> Result<&Arc<dyn Source>> {
        self.as_source().ok_or_else(|| {
            Error::invariant_violation("mutation or observation on a derived relation")
        })
    }

    /// Adds a row to a base relation.
    pub fn add(&self, row: Row) -> Result<()> {
        self.source()?.add_row(row)
    }

    /// Deletes the matching rows of a base relation.
    pub fn delete_where(&self, predicate: &SelectExpression) -> Result<()> {
        self.source()?.delete_where(predicate)
    }

    /// Overwrites attributes of the matching rows of a base relation.
    pub fn update_where(&self, predicate: &SelectExpression, new_values: &Row) -> Result<()> {
        self.source()?.update_where(predicate, new_values)
    }

    /// Registers a synchronous change observer on a base relation.
    pub fn observe<F>(&self, callback: F) -> Result<ObserverRemoval>
    where
        F: Fn(&crate::change::RelationChange) + Send + Sync + 'static,
    {
        Ok(self.source()?.observers().observe(callback))
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.kind {
            Kind::Source(_) => write!(f, "Relation#{}(source)", self.inner.id),
            Kind::Derived { op, .. } => {
                write!(f, "Relation#{}({:?})", self.inner.id, op)
            }
        }
    }
}
