//! Model boundary types and the `ChatModel` trait.
//!
//! The core is provider-agnostic: it hands over messages and tool specs,
//! and receives text and/or tool calls back. Whatever the provider
//! returns for a tool call is validated into [`ParsedCall`] at this
//! boundary; unknown tools are rejected politely through the tool-error
//! path instead of panicking deep in the agent loop.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A model-boundary conversation message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Whether a tool-role message carries an error result.
    #[serde(default)]
    pub is_error: bool,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Self::default()
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            is_error,
            ..Self::default()
        }
    }
}

/// JSON-Schema description of a tool exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ToolSpec>>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: None,
            temperature: 0.2,
            max_tokens: 2048,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = Some(tools);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A requested call checked against the set of known tool names.
#[derive(Debug, Clone)]
pub enum ParsedCall {
    Known(ToolCall),
    Unknown { raw: ToolCall },
}

impl ParsedCall {
    pub fn parse(call: ToolCall, known: &[&str]) -> Self {
        if known.contains(&call.name.as_str()) {
            Self::Known(call)
        } else {
            Self::Unknown { raw: call }
        }
    }
}

/// Incremental output from the streaming completion variant.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Token(String),
    /// Providers surface partial tool calls; the core only forwards them
    /// for observability and acts on the final response.
    ToolCallDelta { name: String },
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ModelResponse>;

    /// Streaming variant: deltas are sent on `deltas` as they arrive and
    /// the assembled response is returned. The default implementation
    /// falls back to [`Self::complete`], emitting the full text as a
    /// single token.
    async fn complete_streaming(
        &self,
        request: ChatRequest,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<ModelResponse> {
        let response = self.complete(request).await?;
        if let Some(content) = &response.content {
            let _ = deltas.send(StreamDelta::Token(content.clone())).await;
        }
        Ok(response)
    }

    fn model_name(&self) -> &str;
}

/// Test double replaying a scripted sequence of responses. Records every
/// request it receives.
#[cfg(test)]
pub struct ScriptedModel {
    responses: std::sync::Mutex<std::collections::VecDeque<ModelResponse>>,
    pub requests: std::sync::Mutex<Vec<ChatRequest>>,
}

#[cfg(test)]
impl ScriptedModel {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: ChatRequest) -> Result<ModelResponse> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted model ran out of responses"))
    }

    async fn complete_streaming(
        &self,
        request: ChatRequest,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<ModelResponse> {
        let response = self.complete(request).await?;
        if let Some(content) = &response.content {
            // Stream word-by-word so tests observe multiple token events.
            for word in content.split_inclusive(' ') {
                let _ = deltas.send(StreamDelta::Token(word.to_string())).await;
            }
        }
        Ok(response)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parsed_call_separates_known_from_unknown() {
        let call = ToolCall {
            id: "t1".into(),
            name: "get_schema".into(),
            arguments: json!({}),
        };
        assert!(matches!(
            ParsedCall::parse(call.clone(), &["get_schema", "aggregate_data"]),
            ParsedCall::Known(_)
        ));
        assert!(matches!(
            ParsedCall::parse(call, &["aggregate_data"]),
            ParsedCall::Unknown { .. }
        ));
    }

    #[test]
    fn chat_message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        let assistant = ChatMessage::assistant("a", None);
        assert_eq!(assistant.role, "assistant");
        assert!(assistant.tool_call_id.is_none());
        let tool = ChatMessage::tool_result("t1", "result", true);
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("t1"));
        assert!(tool.is_error);
    }

    #[tokio::test]
    async fn default_streaming_falls_back_to_complete() {
        struct OneShot;

        #[async_trait]
        impl ChatModel for OneShot {
            async fn complete(&self, _request: ChatRequest) -> Result<ModelResponse> {
                Ok(ModelResponse::text("xin chào"))
            }
            fn model_name(&self) -> &str {
                "one-shot"
            }
        }

        let (tx, mut rx) = mpsc::channel(8);
        let response = OneShot
            .complete_streaming(ChatRequest::new(vec![ChatMessage::user("hi")]), tx)
            .await
            .unwrap();
        assert_eq!(response.content.as_deref(), Some("xin chào"));
        let delta = rx.recv().await.unwrap();
        assert!(matches!(delta, StreamDelta::Token(t) if t == "xin chào"));
    }
}
