//! Streaming notifications and the cross-process notifier.
//!
//! Two backends share one room convention (`user:{user_id}`): the local
//! backend hands events straight to the WebSocket transport of the current
//! process; the broker backend publishes through the shared pub/sub broker
//! so worker processes can reach clients connected elsewhere. Emit failures
//! are logged and swallowed, never propagated into business logic.

use crate::cache::CacheStore;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Wire event names. Bit-exact for client compatibility.
pub mod events {
    pub const SYNC_STARTED: &str = "sheet:sync:started";
    pub const SYNC_COMPLETED: &str = "sheet:sync:completed";
    pub const SYNC_FAILED: &str = "sheet:sync:failed";
    pub const MESSAGE_STARTED: &str = "chat:message:started";
    pub const MESSAGE_TOKEN: &str = "chat:message:token";
    pub const MESSAGE_TOOL_START: &str = "chat:message:tool_start";
    pub const MESSAGE_TOOL_END: &str = "chat:message:tool_end";
    pub const MESSAGE_COMPLETED: &str = "chat:message:completed";
    pub const MESSAGE_FAILED: &str = "chat:message:failed";
}

/// Broker channel carrying notification envelopes between processes.
pub const BROKER_CHANNEL: &str = "sheetmind:events";

pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// The transport boundary. A WebSocket server implements this; clients
/// subscribed to a room receive everything emitted to it. `room: None`
/// broadcasts to every connected client.
#[async_trait]
pub trait TransportEmitter: Send + Sync {
    async fn emit(&self, room: Option<&str>, event: &str, payload: &Value) -> Result<()>;
}

/// Notification capability handed to business logic. Infallible by design:
/// implementations log failures at `warn` and swallow them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn emit_to_room(&self, room: &str, event: &str, payload: Value);

    async fn broadcast(&self, event: &str, payload: Value);

    async fn emit_to_user(&self, user_id: &str, event: &str, payload: Value) {
        self.emit_to_room(&user_room(user_id), event, payload).await;
    }
}

/// Envelope published on the broker channel by out-of-process emitters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Target room; `None` means broadcast.
    pub room: Option<String>,
    pub event: String,
    pub payload: Value,
}

/// In-process backend: direct transport emit. Used by request-handling
/// processes that own WebSocket connections.
pub struct LocalNotifier {
    transport: Arc<dyn TransportEmitter>,
}

impl LocalNotifier {
    pub fn new(transport: Arc<dyn TransportEmitter>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Notifier for LocalNotifier {
    async fn emit_to_room(&self, room: &str, event: &str, payload: Value) {
        if let Err(e) = self.transport.emit(Some(room), event, &payload).await {
            warn!("transport emit failed for {event} to {room}: {e}");
        }
    }

    async fn broadcast(&self, event: &str, payload: Value) {
        if let Err(e) = self.transport.emit(None, event, &payload).await {
            warn!("transport broadcast failed for {event}: {e}");
        }
    }
}

/// Writer-only backend: publishes envelopes on the shared broker. Used by
/// worker processes, which never hold client connections.
pub struct BrokerNotifier {
    broker: Arc<dyn CacheStore>,
}

impl BrokerNotifier {
    pub fn new(broker: Arc<dyn CacheStore>) -> Self {
        Self { broker }
    }

    async fn publish(&self, envelope: EventEnvelope) {
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to serialize event envelope for {}: {e}", envelope.event);
                return;
            }
        };
        if let Err(e) = self.broker.publish(BROKER_CHANNEL, payload).await {
            warn!("broker publish failed for {}: {e}", envelope.event);
        }
    }
}

#[async_trait]
impl Notifier for BrokerNotifier {
    async fn emit_to_room(&self, room: &str, event: &str, payload: Value) {
        self.publish(EventEnvelope {
            room: Some(room.to_string()),
            event: event.to_string(),
            payload,
        })
        .await;
    }

    async fn broadcast(&self, event: &str, payload: Value) {
        self.publish(EventEnvelope {
            room: None,
            event: event.to_string(),
            payload,
        })
        .await;
    }
}

/// Bridge task for request-handling processes: subscribes to the broker
/// channel and replays worker-emitted envelopes onto the local transport.
/// Returns when the broker subscription closes.
pub async fn forward_broker_events(
    broker: Arc<dyn CacheStore>,
    transport: Arc<dyn TransportEmitter>,
) -> Result<()> {
    let mut rx = broker.subscribe(BROKER_CHANNEL).await?;
    loop {
        match rx.recv().await {
            Ok(raw) => {
                let envelope: EventEnvelope = match serde_json::from_str(&raw) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("dropping malformed event envelope: {e}");
                        continue;
                    }
                };
                debug!("forwarding {} to {:?}", envelope.event, envelope.room);
                if let Err(e) = transport
                    .emit(envelope.room.as_deref(), &envelope.event, &envelope.payload)
                    .await
                {
                    warn!("transport emit failed while forwarding {}: {e}", envelope.event);
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event forwarder lagged, {skipped} notifications dropped");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Fallback transport for processes that host no WebSocket server:
/// events are logged at debug and otherwise dropped. A real transport
/// replaces this at wiring time.
pub struct LogTransport;

#[async_trait]
impl TransportEmitter for LogTransport {
    async fn emit(&self, room: Option<&str>, event: &str, payload: &Value) -> Result<()> {
        debug!("event {event} to {}: {payload}", room.unwrap_or("*"));
        Ok(())
    }
}

/// Transport double that records every emit. Shared by the crawler,
/// worker and workflow test suites.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingTransport {
    pub emitted: std::sync::Mutex<Vec<(Option<String>, String, Value)>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn events(&self) -> Vec<(Option<String>, String, Value)> {
        self.emitted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events().into_iter().map(|(_, name, _)| name).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl TransportEmitter for RecordingTransport {
    async fn emit(&self, room: Option<&str>, event: &str, payload: &Value) -> Result<()> {
        self.emitted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((room.map(String::from), event.to_string(), payload.clone()));
        Ok(())
    }
}
