//! Operation tags for intermediate relations.
//!
//! Each derived relation node carries an `Operator` and one or two operand
//! relations. The operator determines the result scheme statically and knows
//! how to compute the node's rows from operand row sets; both the naive
//! evaluator and the query runner go through `Operator::apply` so the
//! semantics live in one place.

use hashbrown::{HashMap, HashSet};
use ravel_core::{Attribute, Error, Renames, Result, Row, Scheme, SelectExpression, Value};
use std::fmt;
use std::sync::Arc;

/// An equijoin matching: left attribute → right attribute pairs that must be
/// equal for two rows to combine.
pub type JoinMatching = HashMap<Attribute, Attribute>;

/// The fold applied by an aggregate node.
#[derive(Clone)]
pub enum AggregateFn {
    /// Keep the smallest value seen.
    Min,
    /// Keep the largest value seen.
    Max,
    /// Count rows, ignoring the attribute's values.
    Count,
    /// A caller-supplied fold over (accumulator, value).
    Fold(Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>),
}

impl fmt::Debug for AggregateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateFn::Min => write!(f, "Min"),
            AggregateFn::Max => write!(f, "Max"),
            AggregateFn::Count => write!(f, "Count"),
            AggregateFn::Fold(_) => write!(f, "Fold(..)"),
        }
    }
}

/// Specification of an aggregate node: fold `attribute`'s values with `func`
/// starting from `initial`, producing a one-attribute, at-most-one-row
/// relation.
#[derive(Clone, Debug)]
pub struct AggregateSpec {
    pub attribute: Attribute,
    pub initial: Option<Value>,
    pub func: AggregateFn,
}

impl AggregateSpec {
    /// Creates an aggregate specification.
    ///
    /// A custom fold requires an initial accumulator; `min`/`max` may start
    /// from nothing (yielding the empty relation on empty input).
    pub fn new(attribute: Attribute, initial: Option<Value>, func: AggregateFn) -> Result<Self> {
        if initial.is_none() && matches!(func, AggregateFn::Fold(_) | AggregateFn::Count) {
            return Err(Error::scheme_violation(
                "aggregate fold requires an initial value",
            ));
        }
        Ok(Self {
            attribute,
            initial,
            func,
        })
    }

    /// The `min` specialization.
    pub fn min(attribute: Attribute) -> Self {
        Self {
            attribute,
            initial: None,
            func: AggregateFn::Min,
        }
    }

    /// The `max` specialization.
    pub fn max(attribute: Attribute) -> Self {
        Self {
            attribute,
            initial: None,
            func: AggregateFn::Max,
        }
    }

    /// The `count` specialization; counts rows starting from zero.
    pub fn count(attribute: Attribute) -> Self {
        Self {
            attribute,
            initial: Some(Value::Integer(0)),
            func: AggregateFn::Count,
        }
    }
}

/// The operation performed by a derived relation node.
#[derive(Clone, Debug)]
pub enum Operator {
    /// Rows present in either operand. Schemes must match.
    Union,
    /// Rows present in both operands. Schemes must match.
    Intersection,
    /// Rows of the left operand absent from the right. Schemes must match.
    Difference,
    /// Restrict rows to a subset of attributes; duplicates collapse.
    Project(Scheme),
    /// Rows for which the predicate evaluates truthy.
    Select(SelectExpression),
    /// Bijective attribute rename.
    Rename(Renames),
    /// Combine row pairs whose matched attributes are equal.
    Equijoin(JoinMatching),
    /// Fold one attribute's values into an at-most-one-row relation.
    Aggregate(AggregateSpec),
    /// The left operand if non-empty, else the right. Schemes must match.
    Otherwise,
    /// The operand if every row's attribute equals the value, else empty.
    Unique { attribute: Attribute, value: Value },
    /// Every row with the given attributes overwritten; duplicates collapse.
    Update(Row),
}

impl Operator {
    /// Returns true if the operator takes two operands.
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            Operator::Union
                | Operator::Intersection
                | Operator::Difference
                | Operator::Equijoin(_)
                | Operator::Otherwise
        )
    }

    /// Computes and validates the result scheme from the operand schemes.
    pub fn result_scheme(&self, left: &Scheme, right: Option<&Scheme>) -> Result<Scheme> {
        match self {
            Operator::Union | Operator::Intersection | Operator::Difference | Operator::Otherwise => {
                let right = required(right)?;
                if left != right {
                    return Err(Error::scheme_violation(format!(
                        "operand schemes differ: {:?} vs {:?}",
                        left, right
                    )));
                }
                Ok(left.clone())
            }
            Operator::Project(scheme) => {
                if !scheme.is_subset_of(left) {
                    return Err(Error::scheme_violation(
                        "projection attributes are not a subset of the operand scheme",
                    ));
                }
                Ok(scheme.clone())
            }
            Operator::Select(_) => Ok(left.clone()),
            Operator::Rename(renames) => left.renamed(renames),
            Operator::Equijoin(matching) => {
                let right = required(right)?;
                for (left_attr, right_attr) in matching {
                    if !left.contains(left_attr) {
                        return Err(Error::scheme_violation(format!(
                            "equijoin attribute {} is not in the left scheme",
                            left_attr
                        )));
                    }
                    if !right.contains(right_attr) {
                        return Err(Error::scheme_violation(format!(
                            "equijoin attribute {} is not in the right scheme",
                            right_attr
                        )));
                    }
                }
                // Scheme overlap is ambiguous unless the overlapping
                // attribute is matched to itself.
                for attribute in left.intersection(right).iter() {
                    let self_matched = matching.get(attribute) == Some(attribute);
                    if !self_matched {
                        return Err(Error::scheme_violation(format!(
                            "ambiguous overlap on attribute {}",
                            attribute
                        )));
                    }
                }
                Ok(left.union(right))
            }
            Operator::Aggregate(spec) => {
                if !left.contains(&spec.attribute) {
                    return Err(Error::scheme_violation(format!(
                        "aggregate attribute {} is not in the operand scheme",
                        spec.attribute
                    )));
                }
                Ok([spec.attribute.clone()].into_iter().collect())
            }
            Operator::Unique { attribute, .. } => {
                if !left.contains(attribute) {
                    return Err(Error::scheme_violation(format!(
                        "unique attribute {} is not in the operand scheme",
                        attribute
                    )));
                }
                Ok(left.clone())
            }
            Operator::Update(new_values) => {
                if !new_values.scheme().is_subset_of(left) {
                    return Err(Error::scheme_violation(
                        "update attributes are not a subset of the operand scheme",
                    ));
                }
                Ok(left.clone())
            }
        }
    }

    /// Computes the node's rows from evaluated operand row sets.
    pub fn apply(
        &self,
        left: &HashSet<Row>,
        right: Option<&HashSet<Row>>,
    ) -> Result<HashSet<Row>> {
        match self {
            Operator::Union => {
                let right = required(right)?;
                Ok(left.union(right).cloned().collect())
            }
            Operator::Intersection => {
                let right = required(right)?;
                Ok(left.intersection(right).cloned().collect())
            }
            Operator::Difference => {
                let right = required(right)?;
                Ok(left.difference(right).cloned().collect())
            }
            Operator::Project(scheme) => {
                Ok(left.iter().map(|row| row.project(scheme)).collect())
            }
            Operator::Select(predicate) => {
                // An unsatisfiable predicate yields the empty relation
                // without touching the operand rows.
                if predicate.is_provably_false() {
                    return Ok(HashSet::new());
                }
                Ok(left
                    .iter()
                    .filter(|row| predicate.matches(row))
                    .cloned()
                    .collect())
            }
            Operator::Rename(renames) => {
                Ok(left.iter().map(|row| row.renamed(renames)).collect())
            }
            Operator::Equijoin(matching) => {
                let right = required(right)?;
                let mut left_attrs: Vec<&Attribute> = matching.keys().collect();
                left_attrs.sort();
                let right_attrs: Vec<&Attribute> =
                    left_attrs.iter().map(|a| &matching[*a]).collect();

                let mut index: HashMap<Vec<Value>, Vec<&Row>> = HashMap::new();
                for row in right {
                    index
                        .entry(key_of(row, &right_attrs))
                        .or_default()
                        .push(row);
                }

                let mut result = HashSet::new();
                for left_row in left {
                    if let Some(matches) = index.get(&key_of(left_row, &left_attrs)) {
                        for right_row in matches {
                            // The left row's values win on the (self-matched)
                            // overlap.
                            result.insert(right_row.combined_with(left_row));
                        }
                    }
                }
                Ok(result)
            }
            Operator::Aggregate(spec) => {
                let mut values: Vec<&Value> =
                    left.iter().map(|row| row.get(&spec.attribute)).collect();
                values.sort();

                let mut accumulator = spec.initial.clone();
                for value in values {
                    accumulator = Some(match (&spec.func, accumulator) {
                        (AggregateFn::Min, None) => value.clone(),
                        (AggregateFn::Min, Some(acc)) => acc.min(value.clone()),
                        (AggregateFn::Max, None) => value.clone(),
                        (AggregateFn::Max, Some(acc)) => acc.max(value.clone()),
                        (AggregateFn::Count, Some(Value::Integer(n))) => Value::Integer(n + 1),
                        (AggregateFn::Count, _) => {
                            return Err(Error::invariant_violation(
                                "count accumulator must be an integer",
                            ))
                        }
                        (AggregateFn::Fold(f), Some(acc)) => f(&acc, value)?,
                        (AggregateFn::Fold(_), None) => {
                            return Err(Error::invariant_violation(
                                "fold aggregate is missing its initial value",
                            ))
                        }
                    });
                }

                Ok(accumulator
                    .map(|value| Row::new([(spec.attribute.clone(), value)]))
                    .into_iter()
                    .collect())
            }
            Operator::Otherwise => {
                let right = required(right)?;
                if left.is_empty() {
                    Ok(right.clone())
                } else {
                    Ok(left.clone())
                }
            }
            Operator::Unique { attribute, value } => {
                if left.iter().all(|row| row.get(attribute) == value) {
                    Ok(left.clone())
                } else {
                    Ok(HashSet::new())
                }
            }
            Operator::Update(new_values) => Ok(left
                .iter()
                .map(|row| row.updated_by(new_values))
                .collect()),
        }
    }
}

fn required<T>(operand: Option<T>) -> Result<T> {
    operand.ok_or_else(|| Error::invariant_violation("binary operator is missing its right operand"))
}

fn key_of(row: &Row, attributes: &[&Attribute]) -> Vec<Value> {
    attributes.iter().map(|a| row.get(a).clone()).collect()
}
