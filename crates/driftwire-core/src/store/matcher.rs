//! Selector matching seam.
//!
//! The full query engine is an external collaborator; this module is
//! the narrow interface the client needs, plus a minimal default
//! implementation: literal equality on dotted field paths, `$and`,
//! `$or`, `$in`, `$ne`, `$exists`, and the ordered comparisons. Unknown
//! operators match nothing. Array-contains semantics are intentionally
//! not implemented.

use std::cmp::Ordering;

use driftwire_proto::ejson;
use serde_json::Value;

use super::Document;

/// Decides whether a document matches a selector.
pub trait Matcher: Send + Sync + 'static {
    /// `true` when `doc` satisfies `selector`.
    fn matches(&self, selector: &Value, doc: &Document) -> bool;
}

/// The built-in matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMatcher;

impl Matcher for DefaultMatcher {
    fn matches(&self, selector: &Value, doc: &Document) -> bool {
        let Some(clauses) = selector.as_object() else {
            // A non-object selector selects nothing.
            return false;
        };

        clauses.iter().all(|(key, condition)| match key.as_str() {
            "$and" => condition
                .as_array()
                .is_some_and(|subs| subs.iter().all(|s| self.matches(s, doc))),
            "$or" => condition
                .as_array()
                .is_some_and(|subs| subs.iter().any(|s| self.matches(s, doc))),
            path => match_condition(lookup(doc, path), condition),
        })
    }
}

fn match_condition(field: Option<&Value>, condition: &Value) -> bool {
    if let Some(ops) = condition.as_object()
        && ops.keys().any(|k| k.starts_with('$'))
    {
        return ops.iter().all(|(op, operand)| match op.as_str() {
            "$in" => operand.as_array().is_some_and(|choices| {
                field.is_some_and(|f| choices.iter().any(|c| ejson::equals(f, c)))
            }),
            "$ne" => !field.is_some_and(|f| ejson::equals(f, operand)),
            "$exists" => operand.as_bool().is_some_and(|want| field.is_some() == want),
            "$gt" => ordered(field, operand).is_some_and(|o| o == Ordering::Greater),
            "$gte" => ordered(field, operand).is_some_and(|o| o != Ordering::Less),
            "$lt" => ordered(field, operand).is_some_and(|o| o == Ordering::Less),
            "$lte" => ordered(field, operand).is_some_and(|o| o != Ordering::Greater),
            _ => false,
        });
    }

    field.is_some_and(|f| ejson::equals(f, condition))
}

fn ordered(field: Option<&Value>, operand: &Value) -> Option<Ordering> {
    compare(field?, operand)
}

/// Walk a dotted path through nested objects.
fn lookup<'doc>(doc: &'doc Document, path: &str) -> Option<&'doc Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Total-enough ordering over scalar EJSON values, shared by the
/// ordered operators and cursor sorting. Cross-type comparisons and
/// composites return `None`.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => match (ejson::as_date(a), ejson::as_date(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => None,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn literal_equality() {
        let m = DefaultMatcher;
        let d = doc(json!({"_id": "x", "color": "red", "n": 3}));
        assert!(m.matches(&json!({"color": "red"}), &d));
        assert!(m.matches(&json!({"color": "red", "n": 3}), &d));
        assert!(!m.matches(&json!({"color": "blue"}), &d));
        assert!(!m.matches(&json!({"missing": "red"}), &d));
    }

    #[test]
    fn dotted_paths() {
        let m = DefaultMatcher;
        let d = doc(json!({"_id": "x", "profile": {"name": "ada"}}));
        assert!(m.matches(&json!({"profile.name": "ada"}), &d));
        assert!(!m.matches(&json!({"profile.name": "bob"}), &d));
    }

    #[test]
    fn and_with_id_narrows_selector() {
        // The `{$and: [{_id}, selector]}` shape cursor observers use.
        let m = DefaultMatcher;
        let d = doc(json!({"_id": "x", "color": "red"}));
        assert!(m.matches(&json!({"$and": [{"_id": "x"}, {"color": "red"}]}), &d));
        assert!(!m.matches(&json!({"$and": [{"_id": "y"}, {"color": "red"}]}), &d));
    }

    #[test]
    fn or_matches_any_branch() {
        let m = DefaultMatcher;
        let d = doc(json!({"_id": "x", "n": 5}));
        assert!(m.matches(&json!({"$or": [{"n": 1}, {"n": 5}]}), &d));
        assert!(!m.matches(&json!({"$or": [{"n": 1}, {"n": 2}]}), &d));
    }

    #[test]
    fn comparison_operators() {
        let m = DefaultMatcher;
        let d = doc(json!({"_id": "x", "n": 5}));
        assert!(m.matches(&json!({"n": {"$gt": 4}}), &d));
        assert!(m.matches(&json!({"n": {"$gte": 5}}), &d));
        assert!(m.matches(&json!({"n": {"$lt": 6}}), &d));
        assert!(m.matches(&json!({"n": {"$lte": 5}}), &d));
        assert!(!m.matches(&json!({"n": {"$gt": 5}}), &d));
        assert!(m.matches(&json!({"n": {"$gt": 4, "$lt": 6}}), &d));
    }

    #[test]
    fn in_ne_exists() {
        let m = DefaultMatcher;
        let d = doc(json!({"_id": "x", "color": "red"}));
        assert!(m.matches(&json!({"color": {"$in": ["red", "blue"]}}), &d));
        assert!(!m.matches(&json!({"color": {"$in": ["green"]}}), &d));
        assert!(m.matches(&json!({"color": {"$ne": "blue"}}), &d));
        assert!(m.matches(&json!({"size": {"$ne": "xl"}}), &d));
        assert!(m.matches(&json!({"color": {"$exists": true}}), &d));
        assert!(m.matches(&json!({"size": {"$exists": false}}), &d));
    }

    #[test]
    fn unknown_operator_matches_nothing() {
        let m = DefaultMatcher;
        let d = doc(json!({"_id": "x", "n": 5}));
        assert!(!m.matches(&json!({"n": {"$regex": ".*"}}), &d));
    }

    #[test]
    fn dates_compare_by_epoch() {
        let a = driftwire_proto::ejson::date(1_000);
        let b = driftwire_proto::ejson::date(2_000);
        assert_eq!(compare(&a, &b), Some(Ordering::Less));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// A one-element `$in` is exactly literal equality.
            #[test]
            fn singleton_in_is_literal_equality(n in any::<i64>(), m in any::<i64>()) {
                let matcher = DefaultMatcher;
                let d = doc(json!({"_id": "x", "n": n}));
                prop_assert_eq!(
                    matcher.matches(&json!({"n": m}), &d),
                    matcher.matches(&json!({"n": {"$in": [m]}}), &d),
                );
            }

            /// `$lt` and `$gte` partition the number line.
            #[test]
            fn lt_and_gte_are_complements(n in any::<i32>(), bound in any::<i32>()) {
                let matcher = DefaultMatcher;
                let d = doc(json!({"_id": "x", "n": n}));
                let lt = matcher.matches(&json!({"n": {"$lt": bound}}), &d);
                let gte = matcher.matches(&json!({"n": {"$gte": bound}}), &d);
                prop_assert!(lt != gte);
            }
        }
    }
}
