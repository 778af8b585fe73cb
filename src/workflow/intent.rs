//! Intent classification: one cheap model call deciding which branch of
//! the chat graph handles the message.

use crate::providers::{ChatMessage, ChatModel, ChatRequest};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const CLASSIFIER_PROMPT: &str = "\
Phân loại tin nhắn cuối cùng của người dùng vào đúng một nhãn:
- data_query: hỏi về dữ liệu bán hàng, doanh thu, đơn hàng, khách hàng, sản phẩm, thống kê
- chat: chào hỏi, trò chuyện thông thường, câu hỏi không liên quan dữ liệu
- unclear: không rõ người dùng muốn gì

Chỉ trả lời đúng một từ: data_query, chat hoặc unclear.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    DataQuery,
    Chat,
    Unclear,
}

impl Intent {
    /// Anything the model says that is not a known label coerces to
    /// `unclear`.
    fn coerce(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "data_query" => Self::DataQuery,
            "chat" => Self::Chat,
            _ => Self::Unclear,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataQuery => "data_query",
            Self::Chat => "chat",
            Self::Unclear => "unclear",
        }
    }
}

pub async fn classify(model: &Arc<dyn ChatModel>, user_message: &str) -> Result<Intent> {
    let request = ChatRequest {
        messages: vec![
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(user_message),
        ],
        tools: None,
        temperature: 0.0,
        max_tokens: 16,
    };
    let response = model
        .complete(request)
        .await
        .context("intent classification failed")?;
    let raw = response.content.unwrap_or_default();
    let intent = Intent::coerce(&raw);
    debug!("classified intent '{raw}' → {}", intent.as_str());
    Ok(intent)
}
