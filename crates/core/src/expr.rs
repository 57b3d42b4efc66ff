//! Select expressions: the predicate AST evaluated against rows.
//!
//! Expressions evaluate to a `Value`; comparisons and boolean operators
//! produce integer 0/1. A predicate holds for a row when its value is truthy
//! (a non-zero integer).

use crate::attribute::{Attribute, Renames};
use crate::row::Row;
use crate::value::Value;
use hashbrown::{HashMap, HashSet};
use std::fmt;

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", symbol)
    }
}

/// A predicate expression tree over rows.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectExpression {
    /// A constant value.
    Constant(Value),
    /// A reference to an attribute of the row under evaluation.
    Attribute(Attribute),
    /// A comparison between two subexpressions, producing integer 0/1.
    Compare {
        op: CompareOp,
        lhs: Box<SelectExpression>,
        rhs: Box<SelectExpression>,
    },
    /// Logical AND of two predicates.
    And(Box<SelectExpression>, Box<SelectExpression>),
    /// Logical OR of two predicates.
    Or(Box<SelectExpression>, Box<SelectExpression>),
    /// Logical negation of a predicate.
    Not(Box<SelectExpression>),
}

/// Shorthand for an attribute reference expression.
pub fn attr(name: &str) -> SelectExpression {
    SelectExpression::Attribute(Attribute::new(name))
}

/// Shorthand for a constant expression.
pub fn constant<V: Into<Value>>(value: V) -> SelectExpression {
    SelectExpression::Constant(value.into())
}

impl SelectExpression {
    /// The always-true predicate.
    pub fn always_true() -> Self {
        SelectExpression::Constant(crate::value::TRUE)
    }

    /// The always-false predicate.
    pub fn always_false() -> Self {
        SelectExpression::Constant(crate::value::FALSE)
    }

    fn compare<R: Into<SelectExpression>>(self, op: CompareOp, rhs: R) -> Self {
        SelectExpression::Compare {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs.into()),
        }
    }

    /// Builds `self == rhs`.
    pub fn eq<R: Into<SelectExpression>>(self, rhs: R) -> Self {
        self.compare(CompareOp::Eq, rhs)
    }

    /// Builds `self != rhs`.
    pub fn ne<R: Into<SelectExpression>>(self, rhs: R) -> Self {
        self.compare(CompareOp::Ne, rhs)
    }

    /// Builds `self < rhs`.
    pub fn lt<R: Into<SelectExpression>>(self, rhs: R) -> Self {
        self.compare(CompareOp::Lt, rhs)
    }

    /// Builds `self <= rhs`.
    pub fn le<R: Into<SelectExpression>>(self, rhs: R) -> Self {
        self.compare(CompareOp::Le, rhs)
    }

    /// Builds `self > rhs`.
    pub fn gt<R: Into<SelectExpression>>(self, rhs: R) -> Self {
        self.compare(CompareOp::Gt, rhs)
    }

    /// Builds `self >= rhs`.
    pub fn ge<R: Into<SelectExpression>>(self, rhs: R) -> Self {
        self.compare(CompareOp::Ge, rhs)
    }

    /// Builds `self AND rhs`.
    pub fn and(self, rhs: SelectExpression) -> Self {
        SelectExpression::And(Box::new(self), Box::new(rhs))
    }

    /// Builds `self OR rhs`.
    pub fn or(self, rhs: SelectExpression) -> Self {
        SelectExpression::Or(Box::new(self), Box::new(rhs))
    }

    /// Builds `NOT self`.
    pub fn negated(self) -> Self {
        SelectExpression::Not(Box::new(self))
    }

    /// Builds the predicate matching exactly the given row: the conjunction
    /// of equality tests over every attribute.
    pub fn matching_row(row: &Row) -> Self {
        let mut result: Option<SelectExpression> = None;
        for (attribute, value) in row.iter() {
            let clause = SelectExpression::Attribute(attribute.clone()).eq(value.clone());
            result = Some(match result {
                Some(expr) => expr.and(clause),
                None => clause,
            });
        }
        result.unwrap_or_else(SelectExpression::always_true)
    }

    /// Evaluates the expression against a row, yielding a value.
    ///
    /// Comparisons and boolean operators yield integer 0/1.
    pub fn evaluate(&self, row: &Row) -> Value {
        match self {
            SelectExpression::Constant(value) => value.clone(),
            SelectExpression::Attribute(attribute) => row.get(attribute).clone(),
            SelectExpression::Compare { op, lhs, rhs } => {
                let lhs = lhs.evaluate(row);
                let rhs = rhs.evaluate(row);
                let result = match op {
                    CompareOp::Eq => lhs == rhs,
                    CompareOp::Ne => lhs != rhs,
                    CompareOp::Lt => lhs < rhs,
                    CompareOp::Le => lhs <= rhs,
                    CompareOp::Gt => lhs > rhs,
                    CompareOp::Ge => lhs >= rhs,
                };
                Value::boolean(result)
            }
            SelectExpression::And(lhs, rhs) => {
                Value::boolean(lhs.evaluate(row).to_bool() && rhs.evaluate(row).to_bool())
            }
            SelectExpression::Or(lhs, rhs) => {
                Value::boolean(lhs.evaluate(row).to_bool() || rhs.evaluate(row).to_bool())
            }
            SelectExpression::Not(inner) => Value::boolean(!inner.evaluate(row).to_bool()),
        }
    }

    /// Evaluates the expression as a predicate: true iff the value is truthy.
    #[inline]
    pub fn matches(&self, row: &Row) -> bool {
        self.evaluate(row).to_bool()
    }

    /// Returns every attribute referenced by the expression.
    pub fn attributes(&self) -> HashSet<Attribute> {
        let mut result = HashSet::new();
        self.collect_attributes(&mut result);
        result
    }

    fn collect_attributes(&self, into: &mut HashSet<Attribute>) {
        match self {
            SelectExpression::Constant(_) => {}
            SelectExpression::Attribute(attribute) => {
                into.insert(attribute.clone());
            }
            SelectExpression::Compare { lhs, rhs, .. } => {
                lhs.collect_attributes(into);
                rhs.collect_attributes(into);
            }
            SelectExpression::And(lhs, rhs) | SelectExpression::Or(lhs, rhs) => {
                lhs.collect_attributes(into);
                rhs.collect_attributes(into);
            }
            SelectExpression::Not(inner) => inner.collect_attributes(into),
        }
    }

    /// Returns a copy with every attribute reference renamed per the map.
    pub fn renamed(&self, renames: &Renames) -> SelectExpression {
        match self {
            SelectExpression::Constant(value) => SelectExpression::Constant(value.clone()),
            SelectExpression::Attribute(attribute) => SelectExpression::Attribute(
                renames.get(attribute).cloned().unwrap_or_else(|| attribute.clone()),
            ),
            SelectExpression::Compare { op, lhs, rhs } => SelectExpression::Compare {
                op: *op,
                lhs: Box::new(lhs.renamed(renames)),
                rhs: Box::new(rhs.renamed(renames)),
            },
            SelectExpression::And(lhs, rhs) => SelectExpression::And(
                Box::new(lhs.renamed(renames)),
                Box::new(rhs.renamed(renames)),
            ),
            SelectExpression::Or(lhs, rhs) => SelectExpression::Or(
                Box::new(lhs.renamed(renames)),
                Box::new(rhs.renamed(renames)),
            ),
            SelectExpression::Not(inner) => {
                SelectExpression::Not(Box::new(inner.renamed(renames)))
            }
        }
    }

    /// If the expression has the shape `attribute == constant` (in either
    /// operand order), returns the attribute and constant.
    pub fn as_equality(&self) -> Option<(&Attribute, &Value)> {
        if let SelectExpression::Compare { op: CompareOp::Eq, lhs, rhs } = self {
            match (lhs.as_ref(), rhs.as_ref()) {
                (SelectExpression::Attribute(a), SelectExpression::Constant(v)) => {
                    return Some((a, v))
                }
                (SelectExpression::Constant(v), SelectExpression::Attribute(a)) => {
                    return Some((a, v))
                }
                _ => {}
            }
        }
        None
    }

    /// Collects the equality constraints of a conjunction: for an expression
    /// of the shape `a1 == c1 AND a2 == c2 AND ...` returns the constraints;
    /// any other shape contributes nothing.
    pub fn equality_constraints(&self) -> HashMap<Attribute, Value> {
        let mut result = HashMap::new();
        self.collect_equalities(&mut result);
        result
    }

    fn collect_equalities(&self, into: &mut HashMap<Attribute, Value>) {
        if let Some((attribute, value)) = self.as_equality() {
            into.insert(attribute.clone(), value.clone());
        } else if let SelectExpression::And(lhs, rhs) = self {
            lhs.collect_equalities(into);
            rhs.collect_equalities(into);
        }
    }

    /// Conservative check that the expression can never hold for any row:
    /// either a falsy constant, or a conjunction requiring one attribute to
    /// equal two different constants.
    pub fn is_provably_false(&self) -> bool {
        match self {
            SelectExpression::Constant(value) => !value.to_bool(),
            SelectExpression::And(lhs, rhs) => {
                if lhs.is_provably_false() || rhs.is_provably_false() {
                    return true;
                }
                let mut constraints = HashMap::new();
                lhs.collect_conflicting(&mut constraints)
                    || rhs.collect_conflicting(&mut constraints)
            }
            _ => false,
        }
    }

    fn collect_conflicting(&self, constraints: &mut HashMap<Attribute, Value>) -> bool {
        if let Some((attribute, value)) = self.as_equality() {
            if let Some(existing) = constraints.get(attribute) {
                return existing != value;
            }
            constraints.insert(attribute.clone(), value.clone());
            false
        } else if let SelectExpression::And(lhs, rhs) = self {
            lhs.collect_conflicting(constraints) || rhs.collect_conflicting(constraints)
        } else {
            false
        }
    }
}

impl From<Value> for SelectExpression {
    fn from(value: Value) -> Self {
        SelectExpression::Constant(value)
    }
}

impl From<i64> for SelectExpression {
    fn from(value: i64) -> Self {
        SelectExpression::Constant(Value::Integer(value))
    }
}

impl From<&str> for SelectExpression {
    fn from(value: &str) -> Self {
        SelectExpression::Constant(Value::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        Row::new([("id", Value::Integer(1)), ("name", Value::from("cat"))])
    }

    #[test]
    fn test_compare_evaluation() {
        let row = sample_row();
        assert!(attr("id").eq(1i64).matches(&row));
        assert!(!attr("id").eq(2i64).matches(&row));
        assert!(attr("id").lt(5i64).matches(&row));
        assert!(attr("name").ne("dog").matches(&row));
    }

    #[test]
    fn test_boolean_operators() {
        let row = sample_row();
        let both = attr("id").eq(1i64).and(attr("name").eq("cat"));
        assert!(both.matches(&row));

        let either = attr("id").eq(9i64).or(attr("name").eq("cat"));
        assert!(either.matches(&row));

        assert!(attr("id").eq(9i64).negated().matches(&row));
    }

    #[test]
    fn test_booleans_encode_as_integers() {
        let row = sample_row();
        assert_eq!(attr("id").eq(1i64).evaluate(&row), Value::Integer(1));
        assert_eq!(attr("id").eq(2i64).evaluate(&row), Value::Integer(0));
    }

    #[test]
    fn test_missing_attribute_is_not_found() {
        let row = sample_row();
        assert_eq!(attr("age").evaluate(&row), Value::NotFound);
        assert!(!attr("age").eq(1i64).matches(&row));
    }

    #[test]
    fn test_attributes() {
        let expr = attr("a").eq(1i64).and(attr("b").lt(attr("c")));
        let attrs = expr.attributes();
        assert_eq!(attrs.len(), 3);
        assert!(attrs.contains(&Attribute::new("b")));
    }

    #[test]
    fn test_renamed() {
        let mut renames = Renames::new();
        renames.insert(Attribute::new("a"), Attribute::new("b"));
        let expr = attr("a").eq(1i64).renamed(&renames);
        assert!(expr.matches(&Row::new([("b", Value::Integer(1))])));
    }

    #[test]
    fn test_as_equality() {
        let expr = attr("id").eq(1i64);
        let (attribute, value) = expr.as_equality().unwrap();
        assert_eq!(attribute, &Attribute::new("id"));
        assert_eq!(value, &Value::Integer(1));

        assert!(attr("id").lt(1i64).as_equality().is_none());
        assert!(constant(1i64).eq(constant(1i64)).as_equality().is_none());
    }

    #[test]
    fn test_matching_row() {
        let row = sample_row();
        let expr = SelectExpression::matching_row(&row);
        assert!(expr.matches(&row));
        assert!(!expr.matches(&Row::new([("id", Value::Integer(2)), ("name", Value::from("cat"))])));
    }

    #[test]
    fn test_provably_false() {
        assert!(SelectExpression::always_false().is_provably_false());
        assert!(!SelectExpression::always_true().is_provably_false());

        let contradiction = attr("id").eq(1i64).and(attr("id").eq(2i64));
        assert!(contradiction.is_provably_false());

        let satisfiable = attr("id").eq(1i64).and(attr("name").eq("cat"));
        assert!(!satisfiable.is_provably_false());
    }
}
