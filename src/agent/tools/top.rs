//! Top-N tool: the highest rows or groups of one connection.

use super::base::{Tool, ToolContext, ToolResult};
use super::{filter_conditions, resolve_connection};
use crate::connections::ConnectionRepo;
use crate::store::{DocumentStore, FindOptions, collections};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

const DEFAULT_LIMIT: u64 = 10;
const MAX_LIMIT: u64 = 100;

#[derive(Debug, Deserialize)]
struct Args {
    connection_name: String,
    sort_field: String,
    #[serde(default)]
    sort_order: Option<String>,
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    group_by: Option<String>,
    #[serde(default)]
    aggregate_field: Option<String>,
    #[serde(default)]
    filters: Option<Value>,
}

pub struct TopTool {
    store: Arc<dyn DocumentStore>,
    repo: ConnectionRepo,
}

impl TopTool {
    pub fn new(store: Arc<dyn DocumentStore>, repo: ConnectionRepo) -> Self {
        Self { store, repo }
    }
}

#[async_trait]
impl Tool for TopTool {
    fn name(&self) -> &str {
        "top_records"
    }

    fn description(&self) -> &str {
        "Return the top rows of a connection sorted by a field, or, with group_by, the \
         top groups ranked by the summed aggregate_field (row count when omitted)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "connection_name": {"type": "string"},
                "sort_field": {"type": "string"},
                "sort_order": {"type": "string", "enum": ["asc", "desc"], "default": "desc"},
                "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIMIT, "default": DEFAULT_LIMIT},
                "group_by": {"type": "string"},
                "aggregate_field": {"type": "string"},
                "filters": {"type": "object"},
            },
            "required": ["connection_name", "sort_field"],
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let args: Args = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {e}"))),
        };
        let connection = match resolve_connection(&self.repo, ctx, &args.connection_name).await {
            Ok(connection) => connection,
            Err(result) => return Ok(result),
        };

        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let descending = !matches!(args.sort_order.as_deref(), Some("asc"));

        let mut conditions = filter_conditions(args.filters.as_ref());
        conditions.insert("connection_id".into(), json!(connection.id));

        let result = match &args.group_by {
            Some(group_by) => {
                let value_expr = match &args.aggregate_field {
                    Some(field) => json!({"$sum": format!("$document.{field}")}),
                    None => json!({"$sum": 1}),
                };
                let direction = if descending { -1 } else { 1 };
                let pipeline = vec![
                    json!({"$match": Value::Object(conditions)}),
                    json!({"$group": {
                        "_id": format!("$document.{group_by}"),
                        "value": value_expr,
                        "count": {"$sum": 1},
                    }}),
                    json!({"$sort": {"value": direction}}),
                    json!({"$limit": limit}),
                ];
                let rows = self
                    .store
                    .aggregate(collections::SHEET_ROWS, &pipeline)
                    .await?;
                rows.iter()
                    .map(|row| json!({"group": row["_id"], "value": row["value"], "count": row["count"]}))
                    .collect::<Vec<Value>>()
            }
            None => {
                let rows = self
                    .store
                    .find_many(
                        collections::SHEET_ROWS,
                        FindOptions {
                            filter: Value::Object(conditions),
                            sort: vec![(
                                format!("document.{}", args.sort_field),
                                if descending { -1 } else { 1 },
                            )],
                            limit: Some(limit),
                            ..FindOptions::default()
                        },
                    )
                    .await?;
                rows.iter()
                    .map(|row| row["document"].clone())
                    .collect::<Vec<Value>>()
            }
        };

        Ok(ToolResult::json(&result))
    }
}
