//! Period-comparison tool: the same aggregation over two date ranges,
//! with absolute and relative change.

use super::aggregate::{AggOp, run_aggregation};
use super::base::{Tool, ToolContext, ToolResult};
use super::resolve_connection;
use crate::connections::ConnectionRepo;
use crate::store::DocumentStore;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct Args {
    connection_name: String,
    operation: AggOp,
    #[serde(default)]
    field: Option<String>,
    date_field: String,
    period1_from: String,
    period1_to: String,
    period2_from: String,
    period2_to: String,
    #[serde(default)]
    group_by: Option<String>,
}

pub struct ComparePeriodsTool {
    store: Arc<dyn DocumentStore>,
    repo: ConnectionRepo,
}

impl ComparePeriodsTool {
    pub fn new(store: Arc<dyn DocumentStore>, repo: ConnectionRepo) -> Self {
        Self { store, repo }
    }

    async fn period_value(
        &self,
        connection_id: &str,
        args: &Args,
        from: &str,
        to: &str,
    ) -> anyhow::Result<f64> {
        let rows = run_aggregation(
            &self.store,
            connection_id,
            args.operation,
            args.field.as_deref(),
            None,
            None,
            &args.date_field,
            Some(from),
            Some(to),
        )
        .await?;
        Ok(rows
            .first()
            .and_then(|row| row["value"].as_f64())
            .unwrap_or(0.0))
    }

    async fn period_groups(
        &self,
        connection_id: &str,
        args: &Args,
        group_by: &str,
        from: &str,
        to: &str,
    ) -> anyhow::Result<Map<String, Value>> {
        let rows = run_aggregation(
            &self.store,
            connection_id,
            args.operation,
            args.field.as_deref(),
            Some(group_by),
            None,
            &args.date_field,
            Some(from),
            Some(to),
        )
        .await?;
        let mut by_group = Map::new();
        for row in rows {
            let key = match &row["_id"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            by_group.insert(key, row["value"].clone());
        }
        Ok(by_group)
    }
}

/// `(p2 - p1) / p1 * 100`, undefined when the first period is zero.
fn percentage_change(period1: f64, period2: f64) -> Option<f64> {
    if period1 == 0.0 {
        None
    } else {
        Some((period2 - period1) / period1 * 100.0)
    }
}

#[async_trait]
impl Tool for ComparePeriodsTool {
    fn name(&self) -> &str {
        "compare_periods"
    }

    fn description(&self) -> &str {
        "Compare the same aggregation over two date ranges. Returns both values, their \
         difference and the percentage change (null when the first period is zero)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "connection_name": {"type": "string"},
                "operation": {"type": "string", "enum": ["sum", "count", "avg", "min", "max"]},
                "field": {"type": "string"},
                "date_field": {"type": "string"},
                "period1_from": {"type": "string", "format": "date"},
                "period1_to": {"type": "string", "format": "date"},
                "period2_from": {"type": "string", "format": "date"},
                "period2_to": {"type": "string", "format": "date"},
                "group_by": {"type": "string"},
            },
            "required": [
                "connection_name", "operation", "date_field",
                "period1_from", "period1_to", "period2_from", "period2_to",
            ],
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let args: Args = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {e}"))),
        };
        if args.operation != AggOp::Count && args.field.is_none() {
            return Ok(ToolResult::error("This operation requires a field"));
        }
        let connection = match resolve_connection(&self.repo, ctx, &args.connection_name).await {
            Ok(connection) => connection,
            Err(result) => return Ok(result),
        };

        let period1_value = self
            .period_value(&connection.id, &args, &args.period1_from, &args.period1_to)
            .await?;
        let period2_value = self
            .period_value(&connection.id, &args, &args.period2_from, &args.period2_to)
            .await?;

        let mut result = json!({
            "period1_value": period1_value,
            "period2_value": period2_value,
            "difference": period2_value - period1_value,
            "percentage_change": percentage_change(period1_value, period2_value),
        });

        if let Some(group_by) = &args.group_by {
            let period1 = self
                .period_groups(&connection.id, &args, group_by, &args.period1_from, &args.period1_to)
                .await?;
            let period2 = self
                .period_groups(&connection.id, &args, group_by, &args.period2_from, &args.period2_to)
                .await?;

            let mut keys: Vec<String> = period1.keys().cloned().collect();
            for key in period2.keys() {
                if !period1.contains_key(key) {
                    keys.push(key.clone());
                }
            }
            let groups: Vec<Value> = keys
                .into_iter()
                .map(|key| {
                    let p1 = period1.get(&key).and_then(Value::as_f64).unwrap_or(0.0);
                    let p2 = period2.get(&key).and_then(Value::as_f64).unwrap_or(0.0);
                    json!({
                        "group": key,
                        "period1_value": p1,
                        "period2_value": p2,
                        "difference": p2 - p1,
                        "percentage_change": percentage_change(p1, p2),
                    })
                })
                .collect();
            result["groups"] = Value::Array(groups);
        }

        Ok(ToolResult::json(&result))
    }
}
