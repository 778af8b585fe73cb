//! Filter matching and value comparison for the in-memory store.
//!
//! Implements the Mongo operator subset the core emits: equality,
//! `$gt/$gte/$lt/$lte/$ne`, `$in`, `$regex` (+`$options: "i"`), `$exists`,
//! and top-level `$and`/`$or`.

use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;

/// Resolve a dotted path (`document.platform`) against a document.
pub(crate) fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Total order over the JSON values we store. Null sorts lowest, then
/// booleans, numbers, strings. Dates are ISO `YYYY-MM-DD` strings, so
/// lexicographic string order is chronological order.
pub(crate) fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => cmp_values(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

fn matches_operators(actual: Option<&Value>, operators: &serde_json::Map<String, Value>) -> bool {
    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$exists" => {
                let wanted = operand.as_bool().unwrap_or(true);
                actual.is_some() == wanted
            }
            "$eq" => actual.is_some_and(|v| values_equal(v, operand)),
            "$ne" => !actual.is_some_and(|v| values_equal(v, operand)),
            "$gt" => actual.is_some_and(|v| cmp_values(v, operand) == Ordering::Greater),
            "$gte" => actual.is_some_and(|v| cmp_values(v, operand) != Ordering::Less),
            "$lt" => actual.is_some_and(|v| cmp_values(v, operand) == Ordering::Less),
            "$lte" => actual.is_some_and(|v| cmp_values(v, operand) != Ordering::Greater),
            "$in" => actual.is_some_and(|v| {
                operand
                    .as_array()
                    .is_some_and(|arr| arr.iter().any(|o| values_equal(v, o)))
            }),
            "$regex" => {
                let case_insensitive = operators
                    .get("$options")
                    .and_then(Value::as_str)
                    .is_some_and(|o| o.contains('i'));
                match (actual.and_then(Value::as_str), operand.as_str()) {
                    (Some(haystack), Some(pattern)) => RegexBuilder::new(pattern)
                        .case_insensitive(case_insensitive)
                        .build()
                        .is_ok_and(|re| re.is_match(haystack)),
                    _ => false,
                }
            }
            "$options" => true,
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Whether `doc` satisfies a Mongo-style filter document.
pub(crate) fn matches_filter(doc: &Value, filter: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return true;
    };

    for (key, expected) in conditions {
        let ok = match key.as_str() {
            "$and" => expected
                .as_array()
                .is_some_and(|clauses| clauses.iter().all(|c| matches_filter(doc, c))),
            "$or" => expected
                .as_array()
                .is_some_and(|clauses| clauses.iter().any(|c| matches_filter(doc, c))),
            _ => {
                let actual = lookup_path(doc, key);
                match expected.as_object() {
                    Some(operators) if operators.keys().any(|k| k.starts_with('$')) => {
                        matches_operators(actual, operators)
                    }
                    // A null filter matches both explicit null and absence.
                    _ if expected.is_null() => actual.is_none_or(Value::is_null),
                    _ => actual.is_some_and(|v| values_equal(v, expected)),
                }
            }
        };
        if !ok {
            return false;
        }
    }
    true
}
