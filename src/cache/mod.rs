use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

mod memory;

pub use memory::MemCache;

/// Cache boundary: keyed TTL values plus pub/sub, the Redis surface the
/// core relies on. Callers treat every failure as degradation (log a
/// warning and continue without the cache), never as a business error.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key` with a TTL in seconds.
    async fn setex(&self, key: &str, ttl_seconds: u64, value: String) -> Result<()>;

    /// List keys matching a glob pattern. Only the `prefix*` form is
    /// required by the core.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Fire-and-forget publish to a channel. Subscriber absence is not an
    /// error.
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to a channel. Messages published after subscription are
    /// delivered in publish order.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;
}
