//! Schema discovery tool: what data the caller has and what its fields
//! look like.

use super::base::{Tool, ToolContext, ToolResult};
use super::resolve_connection;
use crate::connections::{Connection, ConnectionRepo};
use crate::store::{DocumentStore, FindOptions, collections};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

const SAMPLE_ROWS: u64 = 5;
const SAMPLES_PER_FIELD: usize = 3;

#[derive(Debug, Deserialize)]
struct Args {
    #[serde(default)]
    connection_name: Option<String>,
}

pub struct SchemaTool {
    store: Arc<dyn DocumentStore>,
    repo: ConnectionRepo,
}

impl SchemaTool {
    pub fn new(store: Arc<dyn DocumentStore>, repo: ConnectionRepo) -> Self {
        Self { store, repo }
    }

    async fn describe(&self, connection: &Connection) -> anyhow::Result<Value> {
        let samples = self
            .store
            .find_many(
                collections::SHEET_ROWS,
                FindOptions {
                    filter: json!({"connection_id": connection.id}),
                    sort: vec![("row_number".into(), 1)],
                    limit: Some(SAMPLE_ROWS),
                    ..FindOptions::default()
                },
            )
            .await?;

        let fields: Vec<Value> = connection
            .column_mappings
            .iter()
            .map(|mapping| {
                let mut values: Vec<Value> = Vec::new();
                for row in &samples {
                    if let Some(value) = row["document"].get(&mapping.system_field) {
                        if !value.is_null() && !values.contains(value) {
                            values.push(value.clone());
                        }
                    }
                    if values.len() >= SAMPLES_PER_FIELD {
                        break;
                    }
                }
                json!({
                    "name": &mapping.system_field,
                    "data_type": mapping.data_type,
                    "sample_values": values,
                })
            })
            .collect();

        Ok(json!({
            "name": &connection.name,
            "sheet_type": connection.sheet_type().as_str(),
            "fields": fields,
        }))
    }
}

#[async_trait]
impl Tool for SchemaTool {
    fn name(&self) -> &str {
        "get_schema"
    }

    fn description(&self) -> &str {
        "List the caller's connected sheets with their fields, data types and sample values. \
         Pass connection_name to inspect a single connection."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "connection_name": {
                    "type": "string",
                    "description": "Optional: restrict to one connection by name",
                },
            },
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let args: Args = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {e}"))),
        };

        let connections = match &args.connection_name {
            Some(name) => match resolve_connection(&self.repo, ctx, name).await {
                Ok(connection) => vec![connection],
                Err(result) => return Ok(result),
            },
            None => self.repo.for_user(&ctx.user_id).await?,
        };
        if connections.is_empty() {
            return Ok(ToolResult::error(
                "No connections found. The user has not linked any sheets yet.",
            ));
        }

        let mut described = Vec::with_capacity(connections.len());
        for connection in &connections {
            described.push(self.describe(connection).await?);
        }
        Ok(ToolResult::json(&described))
    }
}
