//! Bounded ReAct loop: model → tools → tool results → model.
//!
//! The loop ends on a model turn without tool calls, at the iteration
//! cap, or after three consecutive tool failures. Tool errors are fed
//! back as tool results so the model can self-correct; only the failure
//! streak surfaces to the user, in Vietnamese like every other
//! user-facing string.

use super::tools::{Tool, ToolContext, ToolRegistry, ToolResult};
use crate::providers::{ChatMessage, ChatModel, ChatRequest, ParsedCall, ToolCall};
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_MAX_ITERATIONS: usize = 10;
const MAX_CONSECUTIVE_TOOL_FAILURES: usize = 3;
/// Tool-calling turns run cold for determinism.
const TOOL_TEMPERATURE: f32 = 0.0;
const MAX_RESULT_PREVIEW_CHARS: usize = 200;

const TOOL_FAILURE_REPLY: &str =
    "Xin lỗi, tôi gặp sự cố khi truy vấn dữ liệu của bạn. Vui lòng thử lại sau ít phút.";
const ITERATION_CAP_REPLY: &str =
    "Xin lỗi, yêu cầu này quá phức tạp để xử lý trong một lần. Bạn hãy thử hỏi cụ thể hơn nhé.";

/// Live progress events forwarded to the streaming layer.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ToolStart {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolEnd {
        id: String,
        name: String,
        is_error: bool,
        preview: String,
    },
}

/// One completed tool invocation in the trace.
#[derive(Debug, Clone)]
pub struct ToolTrace {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub result: String,
    pub is_error: bool,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub content: String,
    pub trace: Vec<ToolTrace>,
}

pub struct ReactAgent {
    model: Arc<dyn ChatModel>,
    registry: ToolRegistry,
    max_iterations: usize,
}

impl ReactAgent {
    pub fn new(model: Arc<dyn ChatModel>, registry: ToolRegistry) -> Self {
        Self {
            model,
            registry,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Drive the loop over `messages` (history plus system prompt).
    /// Cancellation is the caller's concern: every await in here is
    /// abort-safe, so wrapping the call in a timeout discards the
    /// partial trace cleanly.
    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        ctx: &ToolContext,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<AgentOutcome> {
        let known = self.registry.names();
        let specs = self.registry.specs();
        let mut trace: Vec<ToolTrace> = Vec::new();
        let mut consecutive_failures = 0usize;

        for iteration in 0..self.max_iterations {
            let mut request = ChatRequest::new(messages.clone());
            request.temperature = TOOL_TEMPERATURE;
            if !specs.is_empty() {
                request = request.with_tools(specs.clone());
            }

            let response = self
                .model
                .complete(request)
                .await
                .context("model call failed in agent loop")?;

            if !response.has_tool_calls() {
                debug!("agent finished after {} iterations", iteration + 1);
                return Ok(AgentOutcome {
                    content: response.content.unwrap_or_default(),
                    trace,
                });
            }

            messages.push(ChatMessage::assistant(
                response.content.clone().unwrap_or_default(),
                Some(response.tool_calls.clone()),
            ));

            for call in response.tool_calls {
                let (entry, result) = match ParsedCall::parse(call, &known) {
                    ParsedCall::Known(call) => self.execute_call(call, ctx, events).await,
                    ParsedCall::Unknown { raw } => self.reject_unknown(raw, events).await,
                };
                if result.is_error {
                    consecutive_failures += 1;
                } else {
                    consecutive_failures = 0;
                }
                messages.push(ChatMessage::tool_result(
                    entry.id.clone(),
                    result.content,
                    result.is_error,
                ));
                trace.push(entry);

                if consecutive_failures >= MAX_CONSECUTIVE_TOOL_FAILURES {
                    warn!("aborting agent loop after {consecutive_failures} consecutive tool failures");
                    return Ok(AgentOutcome {
                        content: TOOL_FAILURE_REPLY.to_string(),
                        trace,
                    });
                }
            }
        }

        warn!("agent hit the iteration cap ({})", self.max_iterations);
        Ok(AgentOutcome {
            content: ITERATION_CAP_REPLY.to_string(),
            trace,
        })
    }

    async fn execute_call(
        &self,
        call: ToolCall,
        ctx: &ToolContext,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> (ToolTrace, ToolResult) {
        if let Some(events) = events {
            let _ = events
                .send(AgentEvent::ToolStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
                .await;
        }

        let tool = self
            .registry
            .get(&call.name)
            .expect("parsed call names come from the registry");
        let result = match tool.execute(call.arguments.clone(), ctx).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(format!("Tool '{}' failed: {e}", call.name)),
        };

        if let Some(events) = events {
            let _ = events
                .send(AgentEvent::ToolEnd {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    is_error: result.is_error,
                    preview: preview(&result.content),
                })
                .await;
        }

        (
            ToolTrace {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
                result: result.content.clone(),
                is_error: result.is_error,
            },
            result,
        )
    }

    async fn reject_unknown(
        &self,
        raw: ToolCall,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> (ToolTrace, ToolResult) {
        warn!("model requested unknown tool '{}'", raw.name);
        let result = ToolResult::error(format!(
            "Tool '{}' does not exist. Available tools: {}",
            raw.name,
            self.registry.names().join(", ")
        ));
        if let Some(events) = events {
            let _ = events
                .send(AgentEvent::ToolEnd {
                    id: raw.id.clone(),
                    name: raw.name.clone(),
                    is_error: true,
                    preview: preview(&result.content),
                })
                .await;
        }
        (
            ToolTrace {
                id: raw.id,
                name: raw.name,
                arguments: raw.arguments,
                result: result.content.clone(),
                is_error: true,
            },
            result,
        )
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() <= MAX_RESULT_PREVIEW_CHARS {
        content.to_string()
    } else {
        let cut: String = content.chars().take(MAX_RESULT_PREVIEW_CHARS).collect();
        format!("{cut}…")
    }
}
