//! Aggregation tool: sum/count/avg/min/max over one connection's rows,
//! optionally grouped and filtered.

use super::base::{Tool, ToolContext, ToolResult};
use super::{date_condition, filter_conditions, resolve_connection};
use crate::connections::ConnectionRepo;
use crate::store::{DocumentStore, collections};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// Grouped results are capped so a high-cardinality group_by cannot
/// flood the model context.
const MAX_GROUPS: u64 = 100;
const DEFAULT_DATE_FIELD: &str = "order_date";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum AggOp {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl AggOp {
    fn accumulator(self) -> &'static str {
        match self {
            Self::Sum | Self::Count => "$sum",
            Self::Avg => "$avg",
            Self::Min => "$min",
            Self::Max => "$max",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Args {
    connection_name: String,
    operation: AggOp,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    group_by: Option<String>,
    #[serde(default)]
    filters: Option<Value>,
    #[serde(default)]
    date_field: Option<String>,
    #[serde(default)]
    date_from: Option<String>,
    #[serde(default)]
    date_to: Option<String>,
}

/// Build and run the match + group pipeline shared with the
/// compare-periods tool. Returns `{_id, value}` rows.
pub(crate) async fn run_aggregation(
    store: &Arc<dyn DocumentStore>,
    connection_id: &str,
    operation: AggOp,
    field: Option<&str>,
    group_by: Option<&str>,
    filters: Option<&Value>,
    date_field: &str,
    date_from: Option<&str>,
    date_to: Option<&str>,
) -> anyhow::Result<Vec<Value>> {
    let mut conditions = filter_conditions(filters);
    conditions.insert("connection_id".into(), json!(connection_id));
    date_condition(&mut conditions, date_field, date_from, date_to);

    let value_expr = match (operation, field) {
        (AggOp::Count, _) | (_, None) => json!({"$sum": 1}),
        (op, Some(field)) => {
            let mut accumulator = serde_json::Map::new();
            accumulator.insert(
                op.accumulator().to_string(),
                json!(format!("$document.{field}")),
            );
            Value::Object(accumulator)
        }
    };
    let id_expr = match group_by {
        Some(group_by) => json!(format!("$document.{group_by}")),
        None => Value::Null,
    };

    let mut pipeline = vec![
        json!({"$match": Value::Object(conditions)}),
        json!({"$group": {"_id": id_expr, "value": value_expr}}),
    ];
    if group_by.is_some() {
        pipeline.push(json!({"$sort": {"value": -1}}));
        pipeline.push(json!({"$limit": MAX_GROUPS}));
    }

    store.aggregate(collections::SHEET_ROWS, &pipeline).await
}

pub struct AggregateTool {
    store: Arc<dyn DocumentStore>,
    repo: ConnectionRepo,
}

impl AggregateTool {
    pub fn new(store: Arc<dyn DocumentStore>, repo: ConnectionRepo) -> Self {
        Self { store, repo }
    }
}

#[async_trait]
impl Tool for AggregateTool {
    fn name(&self) -> &str {
        "aggregate_data"
    }

    fn description(&self) -> &str {
        "Aggregate a connection's data: sum, count, avg, min or max over a field, \
         optionally grouped by another field, filtered by field values and a date range."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "connection_name": {"type": "string"},
                "operation": {"type": "string", "enum": ["sum", "count", "avg", "min", "max"]},
                "field": {"type": "string", "description": "Field to aggregate (not needed for count)"},
                "group_by": {"type": "string"},
                "filters": {"type": "object", "description": "Exact-match filters, field → value"},
                "date_field": {"type": "string", "description": "Date field for the range filter (default order_date)"},
                "date_from": {"type": "string", "format": "date"},
                "date_to": {"type": "string", "format": "date"},
            },
            "required": ["connection_name", "operation"],
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let args: Args = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {e}"))),
        };
        if args.operation != AggOp::Count && args.field.is_none() {
            return Ok(ToolResult::error(format!(
                "Operation '{}' requires a field",
                args.operation.as_str()
            )));
        }

        let connection = match resolve_connection(&self.repo, ctx, &args.connection_name).await {
            Ok(connection) => connection,
            Err(result) => return Ok(result),
        };

        let date_field = args.date_field.as_deref().unwrap_or(DEFAULT_DATE_FIELD);
        let rows = run_aggregation(
            &self.store,
            &connection.id,
            args.operation,
            args.field.as_deref(),
            args.group_by.as_deref(),
            args.filters.as_ref(),
            date_field,
            args.date_from.as_deref(),
            args.date_to.as_deref(),
        )
        .await?;

        let result = match args.group_by {
            Some(group_by) => {
                let results: Vec<Value> = rows
                    .iter()
                    .map(|row| json!({"group": row["_id"], "value": row["value"]}))
                    .collect();
                json!({
                    "operation": args.operation.as_str(),
                    "field": args.field,
                    "group_by": group_by,
                    "results": results,
                })
            }
            None => json!({
                "operation": args.operation.as_str(),
                "field": args.field,
                "value": rows.first().map_or(json!(0), |row| row["value"].clone()),
            }),
        };
        Ok(ToolResult::json(&result))
    }
}
