//! Data-query tools exposed to the agent.
//!
//! Five stateless tools over the caller's connections: schema discovery,
//! aggregation, top-N, period comparison, and validated custom pipelines.
//! Every tool resolves connections through the ownership filter before
//! any read, so one user can never observe another's data.

mod aggregate;
mod base;
mod compare;
mod custom;
mod schema;
mod top;

pub use aggregate::AggregateTool;
pub use base::{Tool, ToolContext, ToolResult};
pub use compare::ComparePeriodsTool;
pub use custom::CustomPipelineTool;
pub use schema::SchemaTool;
pub use top::TopTool;

use crate::connections::{Connection, ConnectionRepo};
use crate::providers::ToolSpec;
use crate::store::DocumentStore;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Name-indexed tool set handed to the agent loop.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Specs in registration order, for the model request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.spec())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The standard five-tool set over `(store, repo)`.
pub fn data_query_tools(store: Arc<dyn DocumentStore>, repo: ConnectionRepo) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SchemaTool::new(store.clone(), repo.clone())));
    registry.register(Arc::new(AggregateTool::new(store.clone(), repo.clone())));
    registry.register(Arc::new(TopTool::new(store.clone(), repo.clone())));
    registry.register(Arc::new(ComparePeriodsTool::new(store.clone(), repo.clone())));
    registry.register(Arc::new(CustomPipelineTool::new(store, repo)));
    registry
}

/// Resolve a connection by display name under the caller's ownership.
/// The error text lists the caller's available connections so the model
/// can correct itself.
pub(crate) async fn resolve_connection(
    repo: &ConnectionRepo,
    ctx: &ToolContext,
    connection_name: &str,
) -> Result<Connection, ToolResult> {
    match repo.by_name_for_user(&ctx.user_id, connection_name).await {
        Ok(Some(connection)) => Ok(connection),
        Ok(None) => {
            let available = match repo.for_user(&ctx.user_id).await {
                Ok(connections) => connections
                    .iter()
                    .map(|c| c.name.clone())
                    .collect::<Vec<_>>()
                    .join(", "),
                Err(_) => String::new(),
            };
            Err(ToolResult::error(format!(
                "Connection '{connection_name}' not found. Available connections: {available}"
            )))
        }
        Err(e) => Err(ToolResult::error(format!(
            "Failed to look up connection '{connection_name}': {e}"
        ))),
    }
}

/// Translate a tool's `filters` object into match conditions on the
/// mapped document.
pub(crate) fn filter_conditions(filters: Option<&Value>) -> serde_json::Map<String, Value> {
    let mut conditions = serde_json::Map::new();
    if let Some(Value::Object(filters)) = filters {
        for (field, value) in filters {
            conditions.insert(format!("document.{field}"), value.clone());
        }
    }
    conditions
}

/// Inclusive date-range condition on `document.{date_field}`.
pub(crate) fn date_condition(
    conditions: &mut serde_json::Map<String, Value>,
    date_field: &str,
    date_from: Option<&str>,
    date_to: Option<&str>,
) {
    let mut range = serde_json::Map::new();
    if let Some(from) = date_from {
        range.insert("$gte".into(), json!(from));
    }
    if let Some(to) = date_to {
        range.insert("$lte".into(), json!(to));
    }
    if !range.is_empty() {
        conditions.insert(format!("document.{date_field}"), Value::Object(range));
    }
}

#[cfg(test)]
mod tests;
