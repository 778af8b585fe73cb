//! Aggregation-pipeline policy for user-supplied pipelines.
//!
//! Only the custom-pipeline tool runs pipelines authored outside the
//! crate, so everything it forwards is sanitized here: a stage allow
//! list, a write-operator deny list enforced at any nesting depth, a
//! lookup ownership check, and a forced terminal limit.

use crate::errors::{SheetmindError, codes};
use serde_json::{Value, json};
use std::collections::HashSet;

const ALLOWED_STAGES: &[&str] = &[
    "$match", "$group", "$sort", "$limit", "$project", "$lookup", "$unwind", "$count",
];
const FORBIDDEN_OPERATORS: &[&str] = &["$out", "$merge", "$delete"];

/// Hard cap on rows a custom pipeline may return.
pub const MAX_PIPELINE_LIMIT: u64 = 1000;

/// Validate and sanitize a user-supplied pipeline.
///
/// Returns the pipeline with its terminal `$limit` forced to at most
/// [`MAX_PIPELINE_LIMIT`] (appended when absent), or a validation error
/// naming the offending stage.
pub fn validate_pipeline(
    stages: &[Value],
    owned_connection_ids: &HashSet<String>,
) -> Result<Vec<Value>, SheetmindError> {
    let mut sanitized = Vec::with_capacity(stages.len() + 1);

    for (position, stage) in stages.iter().enumerate() {
        let object = stage.as_object().ok_or_else(|| {
            SheetmindError::validation(
                codes::FORBIDDEN_STAGE,
                format!("stage {position} is not an object"),
            )
        })?;
        let Some((operator, spec)) = object.iter().next() else {
            return Err(SheetmindError::validation(
                codes::FORBIDDEN_STAGE,
                format!("stage {position} is empty"),
            ));
        };
        if object.len() != 1 {
            return Err(SheetmindError::validation(
                codes::FORBIDDEN_STAGE,
                format!("stage {position} must have exactly one operator"),
            ));
        }

        if !ALLOWED_STAGES.contains(&operator.as_str()) {
            return Err(SheetmindError::validation(
                codes::FORBIDDEN_STAGE,
                format!("stage {position} uses disallowed operator {operator}"),
            ));
        }
        if let Some(found) = find_forbidden_operator(stage) {
            return Err(SheetmindError::validation(
                codes::FORBIDDEN_STAGE,
                format!("stage {position} contains forbidden operator {found}"),
            ));
        }

        if operator == "$lookup" {
            let from = spec.get("from").and_then(Value::as_str).unwrap_or_default();
            if !owned_connection_ids.contains(from) {
                return Err(SheetmindError::validation(
                    codes::FORBIDDEN_LOOKUP,
                    format!("stage {position} looks up data you do not own"),
                ));
            }
        }

        sanitized.push(stage.clone());
    }

    // The pipeline always ends with a bounded limit. A user-supplied
    // terminal limit is honored up to the cap.
    match sanitized.last_mut() {
        Some(last) if last.get("$limit").is_some() => {
            let requested = last["$limit"].as_u64().unwrap_or(MAX_PIPELINE_LIMIT);
            last["$limit"] = json!(requested.min(MAX_PIPELINE_LIMIT));
        }
        _ => sanitized.push(json!({"$limit": MAX_PIPELINE_LIMIT})),
    }

    Ok(sanitized)
}

/// Depth-first scan for write operators hidden anywhere in a stage.
fn find_forbidden_operator(value: &Value) -> Option<&'static str> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if let Some(found) = FORBIDDEN_OPERATORS
                    .iter()
                    .copied()
                    .find(|op| *op == key.as_str())
                {
                    return Some(found);
                }
                if let Some(found) = find_forbidden_operator(nested) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_forbidden_operator),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn plain_match_gets_terminal_limit_appended() {
        let pipeline = vec![json!({"$match": {"connection_id": "c1"}})];
        let sanitized = validate_pipeline(&pipeline, &owned(&["c1"])).unwrap();
        assert_eq!(sanitized.len(), 2);
        assert_eq!(sanitized[1], json!({"$limit": 1000}));
    }

    #[test]
    fn user_terminal_limit_is_capped() {
        let pipeline = vec![
            json!({"$match": {"connection_id": "c1"}}),
            json!({"$limit": 5000}),
        ];
        let sanitized = validate_pipeline(&pipeline, &owned(&["c1"])).unwrap();
        assert_eq!(sanitized.last().unwrap(), &json!({"$limit": 1000}));

        let pipeline = vec![json!({"$limit": 50})];
        let sanitized = validate_pipeline(&pipeline, &owned(&[])).unwrap();
        assert_eq!(sanitized.last().unwrap(), &json!({"$limit": 50}));
    }

    #[test]
    fn out_stage_is_rejected() {
        let pipeline = vec![
            json!({"$match": {"connection_id": "c1"}}),
            json!({"$out": "x"}),
        ];
        let err = validate_pipeline(&pipeline, &owned(&["c1"])).unwrap_err();
        assert_eq!(err.code(), Some(codes::FORBIDDEN_STAGE));
        assert!(err.to_string().contains("stage 1"));
    }

    #[test]
    fn nested_write_operators_are_rejected() {
        let pipeline = vec![json!({"$group": {
            "_id": null,
            "sneaky": {"$sum": {"$merge": {"into": "x"}}},
        }})];
        let err = validate_pipeline(&pipeline, &owned(&[])).unwrap_err();
        assert_eq!(err.code(), Some(codes::FORBIDDEN_STAGE));
        assert!(err.to_string().contains("$merge"));
    }

    #[test]
    fn lookup_must_reference_owned_connection() {
        let foreign = vec![
            json!({"$match": {"connection_id": "c1"}}),
            json!({"$lookup": {"from": "someone_elses", "localField": "a", "foreignField": "b", "as": "joined"}}),
        ];
        let err = validate_pipeline(&foreign, &owned(&["c1"])).unwrap_err();
        assert_eq!(err.code(), Some(codes::FORBIDDEN_LOOKUP));

        let own = vec![
            json!({"$lookup": {"from": "c1", "localField": "a", "foreignField": "b", "as": "joined"}}),
        ];
        assert!(validate_pipeline(&own, &owned(&["c1"])).is_ok());
    }

    #[test]
    fn unknown_operator_is_rejected_with_position() {
        let pipeline = vec![
            json!({"$match": {}}),
            json!({"$facet": {"a": []}}),
        ];
        let err = validate_pipeline(&pipeline, &owned(&[])).unwrap_err();
        assert_eq!(err.code(), Some(codes::FORBIDDEN_STAGE));
        assert!(err.to_string().contains("stage 1"));
        assert!(err.to_string().contains("$facet"));
    }

    #[test]
    fn multi_operator_stage_is_rejected() {
        let pipeline = vec![json!({"$match": {}, "$limit": 5})];
        let err = validate_pipeline(&pipeline, &owned(&[])).unwrap_err();
        assert_eq!(err.code(), Some(codes::FORBIDDEN_STAGE));
    }

    #[test]
    fn empty_pipeline_becomes_bare_limit() {
        let sanitized = validate_pipeline(&[], &owned(&[])).unwrap();
        assert_eq!(sanitized, vec![json!({"$limit": 1000})]);
    }
}
