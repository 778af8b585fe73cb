//! Custom-pipeline tool: model-authored aggregation pipelines, sanitized
//! by the pipeline validator before touching the store.

use super::base::{Tool, ToolContext, ToolResult};
use super::resolve_connection;
use crate::connections::ConnectionRepo;
use crate::errors::SheetmindError;
use crate::pipeline::validate_pipeline;
use crate::store::{DocumentStore, collections};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct Args {
    connection_name: String,
    pipeline: Vec<Value>,
    /// What the pipeline computes; logged for observability.
    #[serde(default)]
    description: Option<String>,
}

pub struct CustomPipelineTool {
    store: Arc<dyn DocumentStore>,
    repo: ConnectionRepo,
}

impl CustomPipelineTool {
    pub fn new(store: Arc<dyn DocumentStore>, repo: ConnectionRepo) -> Self {
        Self { store, repo }
    }
}

#[async_trait]
impl Tool for CustomPipelineTool {
    fn name(&self) -> &str {
        "custom_pipeline"
    }

    fn description(&self) -> &str {
        "Run a custom aggregation pipeline over one connection's rows. Allowed stages: \
         $match, $group, $sort, $limit, $project, $lookup, $unwind, $count. The result \
         is capped at 1000 rows."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "connection_name": {"type": "string"},
                "pipeline": {
                    "type": "array",
                    "items": {"type": "object"},
                    "description": "Aggregation stages over documents shaped {document: {field: value}}",
                },
                "description": {"type": "string", "description": "What this pipeline computes"},
            },
            "required": ["connection_name", "pipeline"],
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

        let owned: HashSet<String> = self
            .repo
            .for_user(&ctx.user_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let sanitized = match validate_pipeline(&args.pipeline, &owned) {
            Ok(sanitized) => sanitized,
            Err(SheetmindError::Validation { code, message }) => {
                return Ok(ToolResult::error(format!("{code}: {message}")));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            "running custom pipeline for {}: {}",
            connection.id,
            args.description.as_deref().unwrap_or("(no description)")
        );

        // The caller's pipeline only ever sees this connection's rows.
        let mut pipeline = vec![json!({"$match": {"connection_id": connection.id}})];
        pipeline.extend(sanitized);

        let rows = self
            .store
            .aggregate(collections::SHEET_ROWS, &pipeline)
            .await?;
        Ok(ToolResult::json(&rows))
    }
}
