use crate::errors::SheetmindError;
use serde::{Deserialize, Serialize};

/// Default queue the scheduler and worker agree on.
const DEFAULT_QUEUE_NAME: &str = "sheet-sync";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 18690;
const DEFAULT_SAFETY_FACTOR: f64 = 0.8;

/// Process configuration, loaded exclusively from environment variables.
/// Absence of any required value is fatal at process start.
#[derive(Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub sheets: SheetsConfig,
    pub model: ModelConfig,
    pub limiter: LimiterConfig,
    /// Shared secret for the internal trigger endpoint, compared in
    /// constant time.
    pub internal_api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
}

#[derive(Clone)]
pub struct CacheConfig {
    /// Cache backend URL (also the default pub/sub broker).
    pub url: String,
    /// Broker URL for cross-process notifications. Defaults to the cache
    /// URL, since a Redis deployment serves both roles.
    pub broker_url: String,
}

#[derive(Clone)]
pub struct SheetsConfig {
    /// Service-account credentials JSON (inline or a path to a file).
    pub credentials: String,
    /// Address customers share their sheets with. Surfaced in user-facing
    /// setup errors only.
    pub contact_address: String,
}

#[derive(Clone)]
pub struct ModelConfig {
    /// Provider model handle, e.g. `gpt-4o-mini`.
    pub model: String,
    /// Provider API key. May be empty for keyless local gateways.
    pub api_key: String,
    /// Override for OpenAI-compatible servers; `None` means the public
    /// endpoint.
    pub endpoint: Option<String>,
    /// Timeout applied to each model call in the chat workflow.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    /// Scaling applied once to both bucket capacities at construction.
    pub safety_factor: f64,
}

impl Config {
    /// Load from process environment. Every failure is a
    /// [`SheetmindError::Config`] naming the offending variable.
    pub fn from_env() -> Result<Self, SheetmindError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Split out from [`Self::from_env`]
    /// so tests can inject an environment without mutating the process.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, SheetmindError> {
        let required = |key: &str| -> Result<String, SheetmindError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| SheetmindError::Config(format!("missing required env var {key}")))
        };

        let port = match lookup("SHEETMIND_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| SheetmindError::Config(format!("invalid SHEETMIND_PORT: {raw}")))?,
            None => DEFAULT_PORT,
        };

        let safety_factor = match lookup("SHEETMIND_RATE_SAFETY_FACTOR") {
            Some(raw) => {
                let parsed = raw.parse::<f64>().map_err(|_| {
                    SheetmindError::Config(format!("invalid SHEETMIND_RATE_SAFETY_FACTOR: {raw}"))
                })?;
                if parsed <= 0.0 || parsed > 1.0 {
                    return Err(SheetmindError::Config(format!(
                        "SHEETMIND_RATE_SAFETY_FACTOR must be in (0, 1], got {parsed}"
                    )));
                }
                parsed
            }
            None => DEFAULT_SAFETY_FACTOR,
        };

        let model_timeout_secs = match lookup("SHEETMIND_MODEL_TIMEOUT_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                SheetmindError::Config(format!("invalid SHEETMIND_MODEL_TIMEOUT_SECS: {raw}"))
            })?,
            None => 30,
        };

        let cache_url = required("SHEETMIND_CACHE_URL")?;
        let broker_url = lookup("SHEETMIND_BROKER_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| cache_url.clone());

        Ok(Self {
            server: ServerConfig {
                host: lookup("SHEETMIND_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port,
            },
            queue: QueueConfig {
                name: lookup("SHEETMIND_QUEUE_NAME")
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            },
            cache: CacheConfig {
                url: cache_url,
                broker_url,
            },
            sheets: SheetsConfig {
                credentials: required("SHEETMIND_SHEETS_CREDENTIALS")?,
                contact_address: required("SHEETMIND_SHEETS_CONTACT")?,
            },
            model: ModelConfig {
                model: required("SHEETMIND_MODEL")?,
                api_key: lookup("SHEETMIND_MODEL_API_KEY").unwrap_or_default(),
                endpoint: lookup("SHEETMIND_MODEL_ENDPOINT").filter(|v| !v.trim().is_empty()),
                timeout_secs: model_timeout_secs,
            },
            limiter: LimiterConfig { safety_factor },
            internal_api_key: required("SHEETMIND_INTERNAL_API_KEY")?,
        })
    }
}

// Manual Debug impls so secrets never reach logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("queue", &self.queue)
            .field("cache", &self.cache)
            .field("sheets", &self.sheets)
            .field("model", &self.model)
            .field("limiter", &self.limiter)
            .field("internal_api_key", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // URLs can embed credentials (redis://:pass@host), redact both.
        f.debug_struct("CacheConfig")
            .field("url", &"[REDACTED]")
            .field("broker_url", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .field("endpoint", &self.endpoint)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl std::fmt::Debug for SheetsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheetsConfig")
            .field("credentials", &"[REDACTED]")
            .field("contact_address", &self.contact_address)
            .finish()
    }
}
