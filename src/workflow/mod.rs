//! Chat workflow: an explicit state machine from intent classification
//! through branch execution to response formatting, streaming progress
//! events to the owner's room along the way.
//!
//! Event contract per request: exactly one `chat:message:started`, then
//! zero-or-more `chat:message:token` and tool start/end pairs, then
//! exactly one terminal `chat:message:completed` (after the assistant
//! message is persisted) or `chat:message:failed`.

pub mod formatter;
mod intent;

pub use intent::Intent;

use crate::agent::react::{AgentEvent, ReactAgent, ToolTrace};
use crate::agent::tools::{ToolContext, ToolRegistry};
use crate::connections::ConnectionRepo;
use crate::conversations::{ConversationStore, MessageMetadata, NewMessage, to_chat_message};
use crate::errors::SheetmindError;
use crate::notify::{Notifier, events};
use crate::providers::{ChatMessage, ChatModel, ChatRequest, StreamDelta, ToolCall};
use anyhow::{Context, Result};
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHAT_PROMPT: &str = "\
Bạn là trợ lý bán hàng thân thiện cho người bán hàng online tại Việt Nam.
Trò chuyện tự nhiên, ngắn gọn, luôn trả lời bằng tiếng Việt.";

const CLARIFY_PROMPT: &str = "\
Người dùng vừa gửi một tin nhắn chưa rõ ý. Hãy lịch sự hỏi lại để làm rõ,
kèm 2-3 ví dụ câu hỏi cụ thể mà bạn có thể trả lời, ví dụ:
\"Doanh thu tháng này là bao nhiêu?\", \"Top 5 sản phẩm bán chạy?\",
\"So sánh đơn hàng tháng này với tháng trước\". Trả lời bằng tiếng Việt.";

const AGENT_PROMPT_HEADER: &str = "\
Bạn là trợ lý phân tích dữ liệu bán hàng. Dùng các tool được cung cấp để
truy vấn dữ liệu thật của người dùng, không bao giờ bịa số liệu. Trả lời
bằng tiếng Việt, kèm số liệu cụ thể.";

/// Transient per-request bundle threading through the graph.
#[derive(Debug, Default)]
struct WorkflowState {
    intent: Option<Intent>,
    response: Option<String>,
    formatted: Option<String>,
    trace: Vec<ToolTrace>,
}

/// Graph position. Transitions are driven by model output; every path
/// converges on `Format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Classify,
    Chat,
    Clarify,
    DataAgent,
    Format,
    Done,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub conversation_id: String,
    pub message_id: String,
    pub content: String,
    pub intent: Intent,
}

pub struct ChatWorkflow {
    model: Arc<dyn ChatModel>,
    conversations: ConversationStore,
    repo: ConnectionRepo,
    tools: ToolRegistry,
    notifier: Arc<dyn Notifier>,
    /// Independent timeout applied to each single model call.
    model_timeout: Duration,
}

impl ChatWorkflow {
    pub fn new(
        model: Arc<dyn ChatModel>,
        conversations: ConversationStore,
        repo: ConnectionRepo,
        tools: ToolRegistry,
        notifier: Arc<dyn Notifier>,
        model_timeout: Duration,
    ) -> Self {
        Self {
            model,
            conversations,
            repo,
            tools,
            notifier,
            model_timeout,
        }
    }

    /// Handle one user message end to end. `deadline` bounds the whole
    /// request; on expiry the in-flight model call or tool is dropped,
    /// the partial trace is discarded and `message:failed` is emitted.
    pub async fn handle_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        content: &str,
        deadline: Duration,
    ) -> Result<ChatOutcome, SheetmindError> {
        let conversation = self.conversations.get_owned(conversation_id, user_id).await?;
        self.conversations
            .append_message(&conversation, NewMessage::user(content))
            .await?;

        self.notifier
            .emit_to_user(
                user_id,
                events::MESSAGE_STARTED,
                json!({"conversation_id": conversation_id}),
            )
            .await;

        let started_at = std::time::Instant::now();
        let result = tokio::time::timeout(deadline, self.run_graph(user_id, conversation_id)).await;

        let state = match result {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                let message = e.to_string();
                warn!("chat workflow failed for {conversation_id}: {message}");
                self.notifier
                    .emit_to_user(
                        user_id,
                        events::MESSAGE_FAILED,
                        json!({"conversation_id": conversation_id, "error": message}),
                    )
                    .await;
                return Err(SheetmindError::External(message));
            }
            Err(_) => {
                warn!("chat request deadline elapsed for {conversation_id}");
                self.notifier
                    .emit_to_user(
                        user_id,
                        events::MESSAGE_FAILED,
                        json!({"conversation_id": conversation_id, "error": "request timed out"}),
                    )
                    .await;
                return Err(SheetmindError::External("chat request timed out".into()));
            }
        };

        let formatted = state.formatted.unwrap_or_default();
        let intent = state.intent.unwrap_or(Intent::Unclear);

        // Persist before the terminal event so the completed payload can
        // reference a durable message id.
        let metadata = MessageMetadata {
            model: Some(self.model.model_name().to_string()),
            latency_ms: Some(started_at.elapsed().as_millis() as u64),
            tool_calls: state
                .trace
                .iter()
                .map(|entry| ToolCall {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                    arguments: entry.arguments.clone(),
                })
                .collect(),
            ..MessageMetadata::default()
        };
        let conversation = self.conversations.get_owned(conversation_id, user_id).await?;
        let message = self
            .conversations
            .append_message(&conversation, NewMessage::assistant(&formatted, metadata))
            .await?;

        self.notifier
            .emit_to_user(
                user_id,
                events::MESSAGE_COMPLETED,
                json!({
                    "conversation_id": conversation_id,
                    "message_id": &message.id,
                    "content": &formatted,
                }),
            )
            .await;

        Ok(ChatOutcome {
            conversation_id: conversation_id.to_string(),
            message_id: message.id,
            content: formatted,
            intent,
        })
    }

    /// Drive the state machine to completion.
    async fn run_graph(&self, user_id: &str, conversation_id: &str) -> Result<WorkflowState> {
        let mut state = WorkflowState::default();
        let mut step = Step::Classify;
        let history = self.history_messages(conversation_id).await?;
        let last_user = history
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();

        while step != Step::Done {
            step = match step {
                Step::Classify => {
                    let intent = tokio::time::timeout(
                        self.model_timeout,
                        intent::classify(&self.model, &last_user),
                    )
                    .await
                    .context("intent classification timed out")??;
                    debug!("conversation {conversation_id}: intent {}", intent.as_str());
                    state.intent = Some(intent);
                    match intent {
                        Intent::DataQuery => Step::DataAgent,
                        Intent::Chat => Step::Chat,
                        Intent::Unclear => Step::Clarify,
                    }
                }
                Step::Chat => {
                    state.response =
                        Some(self.streamed_reply(user_id, CHAT_PROMPT, &history).await?);
                    Step::Format
                }
                Step::Clarify => {
                    state.response =
                        Some(self.streamed_reply(user_id, CLARIFY_PROMPT, &history).await?);
                    Step::Format
                }
                Step::DataAgent => {
                    let (response, trace) = self.run_data_agent(user_id, &history).await?;
                    state.response = Some(response);
                    state.trace = trace;
                    Step::Format
                }
                Step::Format => {
                    let raw = state.response.as_deref().unwrap_or_default();
                    state.formatted = Some(formatter::normalize_response(raw));
                    Step::Done
                }
                Step::Done => Step::Done,
            };
        }
        Ok(state)
    }

    /// Single LLM call for the chat and clarify branches, streaming
    /// tokens to the owner's room as they arrive.
    async fn streamed_reply(
        &self,
        user_id: &str,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String> {
        let mut messages = vec![ChatMessage::system(system_prompt)];
        messages.extend_from_slice(history);

        let (tx, mut rx) = mpsc::channel::<StreamDelta>(32);
        let notifier = self.notifier.clone();
        let room_user = user_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                if let StreamDelta::Token(token) = delta {
                    notifier
                        .emit_to_user(&room_user, events::MESSAGE_TOKEN, json!({"token": token}))
                        .await;
                }
            }
        });

        let response = tokio::time::timeout(
            self.model_timeout,
            self.model.complete_streaming(ChatRequest::new(messages), tx),
        )
        .await
        .context("model call timed out")??;
        let _ = forwarder.await;

        Ok(response.content.unwrap_or_default())
    }

    async fn run_data_agent(
        &self,
        user_id: &str,
        history: &[ChatMessage],
    ) -> Result<(String, Vec<ToolTrace>)> {
        let mut messages = vec![ChatMessage::system(self.agent_prompt(user_id).await?)];
        messages.extend_from_slice(history);

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(32);
        let notifier = self.notifier.clone();
        let room_user = user_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::ToolStart { id, name, arguments } => {
                        notifier
                            .emit_to_user(
                                &room_user,
                                events::MESSAGE_TOOL_START,
                                json!({"tool_call_id": id, "tool": name, "arguments": arguments}),
                            )
                            .await;
                    }
                    AgentEvent::ToolEnd {
                        id,
                        name,
                        is_error,
                        preview,
                    } => {
                        notifier
                            .emit_to_user(
                                &room_user,
                                events::MESSAGE_TOOL_END,
                                json!({
                                    "tool_call_id": id,
                                    "tool": name,
                                    "is_error": is_error,
                                    "preview": preview,
                                }),
                            )
                            .await;
                    }
                }
            }
        });

        let agent = ReactAgent::new(self.model.clone(), self.tools.clone());
        let ctx = ToolContext {
            user_id: user_id.to_string(),
        };
        let outcome = agent.run(messages, &ctx, Some(&tx)).await;
        drop(tx);
        let _ = forwarder.await;

        let outcome = outcome?;
        Ok((outcome.content, outcome.trace))
    }

    /// Schema-aware system prompt for the data agent: the caller's
    /// connections with their fields, so the model picks real names.
    async fn agent_prompt(&self, user_id: &str) -> Result<String> {
        let mut prompt = AGENT_PROMPT_HEADER.to_string();
        let connections = self.repo.for_user(user_id).await?;
        if connections.is_empty() {
            prompt.push_str("\n\nNgười dùng chưa kết nối bảng dữ liệu nào.");
            return Ok(prompt);
        }
        prompt.push_str("\n\nDữ liệu hiện có:");
        for connection in connections {
            let fields: Vec<&str> = connection
                .column_mappings
                .iter()
                .map(|m| m.system_field.as_str())
                .collect();
            let _ = write!(
                prompt,
                "\n- {} ({}): {}",
                connection.name,
                connection.sheet_type().as_str(),
                fields.join(", ")
            );
        }
        Ok(prompt)
    }

    async fn history_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let stored = self.conversations.history(conversation_id).await?;
        Ok(stored.iter().map(to_chat_message).collect())
    }
}

#[cfg(test)]
mod tests;
