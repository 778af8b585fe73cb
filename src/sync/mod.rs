use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod crawler;
mod queue;
mod worker;

pub use crawler::{CrawlerService, SyncReport};
pub use queue::{Delivery, MemQueue, SyncQueue};
pub use worker::SyncWorker;

/// Transient queue payload: one requested sync for one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub connection_id: String,
    pub user_id: String,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl SyncTask {
    pub fn new(connection_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            queued_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// The follow-up task enqueued after a retryable failure.
    pub fn retry(&self) -> Self {
        Self {
            connection_id: self.connection_id.clone(),
            user_id: self.user_id.clone(),
            queued_at: Utc::now(),
            retry_count: self.retry_count + 1,
        }
    }
}
