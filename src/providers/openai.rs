//! OpenAI-compatible chat-completions adapter.
//!
//! Works against api.openai.com and any server speaking the same dialect.
//! Tool-call serialization stays opaque to the rest of the crate: this
//! module translates between [`ChatMessage`]/[`ToolSpec`] and the wire
//! format in both directions.

use super::base::{ChatMessage, ChatModel, ChatRequest, ModelResponse, ToolCall, ToolSpec};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiCompatModel {
    api_key: String,
    model: String,
    endpoint: String,
    client: Client,
}

impl OpenAiCompatModel {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_endpoint(api_key, model, API_URL)
    }

    /// Point at a compatible server (tests use a wiremock endpoint).
    pub fn with_endpoint(api_key: String, model: String, endpoint: &str) -> Self {
        Self {
            api_key,
            model,
            endpoint: endpoint.to_string(),
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let mut wire = json!({
                    "role": &msg.role,
                    "content": &msg.content,
                });
                if let Some(calls) = &msg.tool_calls {
                    wire["tool_calls"] = calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": &call.id,
                                "type": "function",
                                "function": {
                                    "name": &call.name,
                                    "arguments": call.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                }
                if let Some(id) = &msg.tool_call_id {
                    wire["tool_call_id"] = json!(id);
                }
                wire
            })
            .collect()
    }

    fn parse_response(body: &Value) -> Result<ModelResponse> {
        let choice = body["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .context("no choices in model response")?;
        let message = &choice["message"];

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let function = &call["function"];
                let arguments = function["arguments"]
                    .as_str()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_else(|| json!({}));
                tool_calls.push(ToolCall {
                    id: call["id"].as_str().unwrap_or_default().to_string(),
                    name: function["name"].as_str().unwrap_or_default().to_string(),
                    arguments,
                });
            }
        }

        Ok(ModelResponse {
            content: message["content"].as_str().map(String::from),
            tool_calls,
            finish_reason: choice["finish_reason"].as_str().map(String::from),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatModel {
    async fn complete(&self, request: ChatRequest) -> Result<ModelResponse> {
        let mut body = json!({
            "model": self.model,
            "messages": Self::wire_messages(&request.messages),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if let Some(tools) = &request.tools {
            body["tools"] = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect();
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("model request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("model API returned {status}: {detail}");
        }
        let body: Value = response
            .json()
            .await
            .context("failed to decode model response")?;
        Self::parse_response(&body)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
