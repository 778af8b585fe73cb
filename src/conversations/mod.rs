//! Conversation and message persistence.
//!
//! Conversations own their messages (child rows keyed by conversation
//! id). Both are soft-deleted: a set `deleted_at` hides the record from
//! every default read while keeping it retrievable by id for audits.
//! Message appends update the parent's counters in the same logical step,
//! so `message_count` and `last_message_at` never drift.

use crate::connections::new_id;
use crate::errors::SheetmindError;
use crate::providers::{ChatMessage, ToolCall};
use crate::store::{DocumentStore, FindOptions, collections};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

/// Auto-generated titles keep the first 50 characters of the opening
/// user message.
const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub status: ConversationStatus,
    pub message_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    fn from_str(raw: &str) -> Self {
        match raw {
            "assistant" => Self::Assistant,
            "system" => Self::System,
            "tool" => Self::Tool,
            _ => Self::User,
        }
    }
}

/// Provider-facing metadata captured alongside an assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Correlation id for tool-role messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// False while a stream is still in progress.
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Payload for appending one message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub attachments: Vec<Value>,
    pub metadata: MessageMetadata,
    pub is_complete: bool,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            attachments: Vec::new(),
            metadata: MessageMetadata::default(),
            is_complete: true,
        }
    }

    pub fn assistant(content: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            attachments: Vec::new(),
            metadata,
            is_complete: true,
        }
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    store: Arc<dyn DocumentStore>,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, user_id: &str, title: Option<String>) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: new_id(),
            user_id: user_id.to_string(),
            title: title.unwrap_or_default(),
            status: ConversationStatus::Active,
            message_count: 0,
            last_message_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.store
            .insert_one(
                collections::CONVERSATIONS,
                serde_json::to_value(&conversation)?,
            )
            .await?;
        Ok(conversation)
    }

    /// Load a conversation enforcing ownership and excluding soft-deleted
    /// records. Foreign ownership reads as not-found.
    pub async fn get_owned(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, SheetmindError> {
        let found = self
            .store
            .find_one(
                collections::CONVERSATIONS,
                &json!({"id": conversation_id, "deleted_at": null}),
            )
            .await?
            .map(|doc| serde_json::from_value::<Conversation>(doc))
            .transpose()
            .context("malformed conversation document")?
            .filter(|c| c.user_id == user_id);
        found.ok_or_else(|| SheetmindError::NotFound("conversation".into()))
    }

    /// A user's conversations, most recently updated first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let docs = self
            .store
            .find_many(
                collections::CONVERSATIONS,
                FindOptions {
                    filter: json!({"user_id": user_id, "deleted_at": null}),
                    sort: vec![("updated_at".into(), -1)],
                    ..FindOptions::default()
                },
            )
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).context("malformed conversation document"))
            .collect()
    }

    /// Retrieval by id that includes soft-deleted records. Audit path
    /// only; never used by default reads.
    pub async fn get_include_deleted(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let doc = self
            .store
            .find_one(collections::CONVERSATIONS, &json!({"id": conversation_id}))
            .await?;
        doc.map(|d| serde_json::from_value(d).context("malformed conversation document"))
            .transpose()
    }

    /// Append a message, bumping the parent's `message_count` and
    /// `last_message_at` with the message's own timestamp. The first user
    /// message titles an untitled conversation.
    pub async fn append_message(
        &self,
        conversation: &Conversation,
        new_message: NewMessage,
    ) -> Result<StoredMessage> {
        let message = StoredMessage {
            id: new_id(),
            conversation_id: conversation.id.clone(),
            role: new_message.role,
            content: new_message.content,
            attachments: new_message.attachments,
            metadata: new_message.metadata,
            is_complete: new_message.is_complete,
            created_at: Utc::now(),
            deleted_at: None,
        };
        self.store
            .insert_one(collections::MESSAGES, serde_json::to_value(&message)?)
            .await?;

        let mut set = serde_json::Map::new();
        set.insert("last_message_at".into(), serde_json::to_value(message.created_at)?);
        set.insert("updated_at".into(), serde_json::to_value(message.created_at)?);
        if conversation.title.is_empty() && message.role == MessageRole::User {
            set.insert("title".into(), json!(derive_title(&message.content)));
        }
        self.store
            .update_one(
                collections::CONVERSATIONS,
                &json!({"id": &conversation.id}),
                &json!({"$set": Value::Object(set), "$inc": {"message_count": 1}}),
            )
            .await?;

        Ok(message)
    }

    /// Messages of a conversation, oldest first, excluding soft-deleted.
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let docs = self
            .store
            .find_many(
                collections::MESSAGES,
                FindOptions {
                    filter: json!({"conversation_id": conversation_id, "deleted_at": null}),
                    sort: vec![("created_at".into(), 1)],
                    ..FindOptions::default()
                },
            )
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).context("malformed message document"))
            .collect()
    }

    pub async fn soft_delete(&self, conversation_id: &str) -> Result<()> {
        let now = serde_json::to_value(Utc::now())?;
        self.store
            .update_one(
                collections::CONVERSATIONS,
                &json!({"id": conversation_id}),
                &json!({"$set": {"deleted_at": now}}),
            )
            .await?;
        Ok(())
    }

    pub async fn soft_delete_message(&self, message_id: &str) -> Result<()> {
        let now = serde_json::to_value(Utc::now())?;
        self.store
            .update_one(
                collections::MESSAGES,
                &json!({"id": message_id}),
                &json!({"$set": {"deleted_at": now}}),
            )
            .await?;
        Ok(())
    }

    pub async fn get_message_include_deleted(
        &self,
        message_id: &str,
    ) -> Result<Option<StoredMessage>> {
        let doc = self
            .store
            .find_one(collections::MESSAGES, &json!({"id": message_id}))
            .await?;
        doc.map(|d| serde_json::from_value(d).context("malformed message document"))
            .transpose()
    }
}

fn derive_title(content: &str) -> String {
    content.chars().take(TITLE_MAX_CHARS).collect()
}

/// Stored → provider-facing message.
pub fn to_chat_message(message: &StoredMessage) -> ChatMessage {
    ChatMessage {
        role: message.role.as_str().to_string(),
        content: message.content.clone(),
        tool_calls: if message.metadata.tool_calls.is_empty() {
            None
        } else {
            Some(message.metadata.tool_calls.clone())
        },
        tool_call_id: message.metadata.tool_call_id.clone(),
        is_error: false,
    }
}

/// Provider-facing → storable message. Round-trips `(role, content,
/// tool_calls, tool_call_id)` with [`to_chat_message`].
pub fn from_chat_message(message: &ChatMessage) -> NewMessage {
    NewMessage {
        role: MessageRole::from_str(&message.role),
        content: message.content.clone(),
        attachments: Vec::new(),
        metadata: MessageMetadata {
            tool_calls: message.tool_calls.clone().unwrap_or_default(),
            tool_call_id: message.tool_call_id.clone(),
            ..MessageMetadata::default()
        },
        is_complete: true,
    }
}
