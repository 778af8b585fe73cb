//! In-process cache backend for tests and single-node deployments.

use super::CacheStore;
use anyhow::Result;
use async_trait::async_trait;
use moka::Expiry;
use moka::sync::Cache;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const MAX_ENTRIES: u64 = 100_000;
const CHANNEL_CAPACITY: usize = 256;

/// Entry value paired with its TTL so moka can expire per entry.
#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

pub struct MemCache {
    entries: Cache<String, Entry>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Default for MemCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .expire_after(PerEntryTtl)
                .build(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CacheStore for MemCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|e| e.value))
    }

    async fn setex(&self, key: &str, ttl_seconds: u64, value: String) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                ttl: Duration::from_secs(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matches: Box<dyn Fn(&str) -> bool> = match pattern.strip_suffix('*') {
            Some(prefix) => {
                let prefix = prefix.to_string();
                Box::new(move |key: &str| key.starts_with(&prefix))
            }
            None => {
                let exact = pattern.to_string();
                Box::new(move |key: &str| key == exact)
            }
        };
        Ok(self
            .entries
            .iter()
            .filter(|(key, _)| matches(key.as_str()))
            .map(|(key, _)| key.as_ref().clone())
            .collect())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // A send error just means nobody is subscribed right now.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        Ok(self.sender(channel).subscribe())
    }
}
