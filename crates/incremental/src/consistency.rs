//! Cheap predicate consistency checking.
//!
//! The differentiator uses this to prove that a mutation cannot reach a
//! variable's filtered region, so the update manager can skip willChange
//! and recomputation for unaffected observers. The check is conservative:
//! it only ever answers "provably inconsistent" for equality constraints on
//! the same attribute with different constant values.

use ravel_core::SelectExpression;

/// Returns true if the two predicates provably cannot both hold for any
/// row.
///
/// Each expression contributes the equality constraints of its top-level
/// conjunction; a shared attribute constrained to two different constants
/// is a contradiction. Everything else is assumed satisfiable.
pub fn provably_inconsistent(a: &SelectExpression, b: &SelectExpression) -> bool {
    let constraints_a = a.equality_constraints();
    if constraints_a.is_empty() {
        return false;
    }
    let constraints_b = b.equality_constraints();

    for (attribute, value) in &constraints_b {
        if let Some(existing) = constraints_a.get(attribute) {
            if existing != value {
                return true;
            }
        }
    }
    false
}
