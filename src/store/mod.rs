use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

mod memory;
mod query;

pub use memory::MemStore;
pub(crate) use query::{cmp_values, lookup_path, matches_filter};

/// Collection names shared by every store-backed module.
pub mod collections {
    pub const CONNECTIONS: &str = "connections";
    pub const SYNC_STATES: &str = "sync_states";
    pub const SHEET_ROWS: &str = "sheet_rows";
    pub const CONVERSATIONS: &str = "conversations";
    pub const MESSAGES: &str = "messages";
}

/// Options for a multi-document read.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Mongo-style filter document. Empty object matches everything.
    pub filter: Value,
    /// Sort keys applied in order; `-1` descending, `1` ascending.
    pub sort: Vec<(String, i32)>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn filter(filter: Value) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

/// Document-store boundary. The core validates; the store is trusted for
/// atomic single-document upsert and update (`$set`/`$inc`). Cross-document
/// transactions are never required.
///
/// Documents, filters, updates and aggregation pipelines are
/// `serde_json::Value` in the Mongo dialect; a hosted document database
/// mounts behind this trait with a thin driver adapter (out of scope).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<()>;

    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Value>>;

    async fn find_many(&self, collection: &str, options: FindOptions) -> Result<Vec<Value>>;

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64>;

    /// Apply a `$set`/`$inc` update to the first matching document.
    /// Returns whether a document matched.
    async fn update_one(&self, collection: &str, filter: &Value, update: &Value) -> Result<bool>;

    /// Replace the first document matching `filter` with `doc`, inserting
    /// when none matches. Atomic per compound key.
    async fn upsert(&self, collection: &str, filter: &Value, doc: Value) -> Result<()>;

    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<u64>;

    /// Execute an aggregation pipeline and collect the result sequence.
    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>>;
}
