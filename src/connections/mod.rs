//! Connection, sync-state and sheet-row models plus their store adapters.
//!
//! A connection binds one user to one sheet tab with an ordered column
//! mapping. Sync-state is its per-connection progress cursor; sheet rows
//! are the normalized documents the crawler writes. Every read path
//! filters by owner so data isolation holds at the lowest layer.

use crate::errors::SheetmindError;
use crate::sheets::DataType;
use crate::store::{DocumentStore, FindOptions, collections};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// One column of the sheet mapped to a system field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub system_field: String,
    /// Letter reference (`A`, `P`, `AA`) or header-name string.
    pub sheet_column: String,
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
}

/// A user's binding to one external sheet tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    /// Display name used by the agent tools; defaults to the tab name.
    pub name: String,
    pub sheet_id: String,
    pub tab_name: String,
    pub column_mappings: Vec<ColumnMapping>,
    /// 1-based row holding the header names.
    pub header_row: u32,
    /// 1-based first data row.
    pub data_start_row: u32,
    pub sync_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn sheet_type(&self) -> SheetType {
        SheetType::detect(&self.tab_name)
    }
}

/// Sheet type detected from the tab name. Drives strategy selection in
/// the analytics engine and field descriptions in the schema tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetType {
    Orders,
    OrderItems,
    Customers,
    Products,
}

impl SheetType {
    /// Case-insensitive match on the tab name; unknown names default to
    /// `orders`.
    pub fn detect(tab_name: &str) -> Self {
        match tab_name.trim().to_lowercase().as_str() {
            "order_items" | "order items" => Self::OrderItems,
            "customers" => Self::Customers,
            "products" => Self::Products,
            _ => Self::Orders,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::OrderItems => "order_items",
            Self::Customers => "customers",
            Self::Products => "products",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Success,
    Failed,
}

/// Per-connection progress cursor. Created lazily on first sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub connection_id: String,
    /// Highest row number processed by a successful sync; 0 before the
    /// first success.
    pub last_synced_row: u32,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub last_error: Option<String>,
    pub total_rows_synced: u64,
}

impl SyncState {
    pub fn initial(connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            last_synced_row: 0,
            last_sync_time: None,
            status: SyncStatus::Pending,
            last_error: None,
            total_rows_synced: 0,
        }
    }
}

/// One persisted sheet row, keyed by `(connection_id, row_number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetRow {
    pub connection_id: String,
    /// 1-based position in the source tab.
    pub row_number: u32,
    /// Mapped document: system field → coerced value.
    pub document: Value,
    /// The raw ordered cell strings, kept for re-mapping and debugging.
    pub raw: Vec<String>,
    pub synced_at: DateTime<Utc>,
}

/// Store adapter for connections, sync-states and sheet rows.
#[derive(Clone)]
pub struct ConnectionRepo {
    store: Arc<dyn DocumentStore>,
}

impl ConnectionRepo {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, connection: &Connection) -> Result<()> {
        self.store
            .insert_one(collections::CONNECTIONS, serde_json::to_value(connection)?)
            .await
    }

    pub async fn get(&self, connection_id: &str) -> Result<Option<Connection>> {
        let doc = self
            .store
            .find_one(collections::CONNECTIONS, &json!({"id": connection_id}))
            .await?;
        doc.map(|d| serde_json::from_value(d).context("malformed connection document"))
            .transpose()
    }

    /// Load a connection enforcing ownership. A connection that exists but
    /// belongs to someone else is indistinguishable from one that does
    /// not exist.
    pub async fn get_owned(
        &self,
        connection_id: &str,
        user_id: &str,
    ) -> Result<Connection, SheetmindError> {
        let found = self
            .get(connection_id)
            .await?
            .filter(|c| c.user_id == user_id);
        found.ok_or_else(|| SheetmindError::NotFound("connection".into()))
    }

    /// All of one user's connections, newest first.
    pub async fn for_user(&self, user_id: &str) -> Result<Vec<Connection>> {
        let docs = self
            .store
            .find_many(
                collections::CONNECTIONS,
                FindOptions {
                    filter: json!({"user_id": user_id}),
                    sort: vec![("created_at".into(), -1)],
                    ..FindOptions::default()
                },
            )
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).context("malformed connection document"))
            .collect()
    }

    pub async fn by_name_for_user(&self, user_id: &str, name: &str) -> Result<Option<Connection>> {
        let wanted = name.trim().to_lowercase();
        Ok(self
            .for_user(user_id)
            .await?
            .into_iter()
            .find(|c| c.name.trim().to_lowercase() == wanted))
    }

    /// Every sync-enabled connection across all users. Used by the
    /// trigger endpoint's fan-out.
    pub async fn enabled(&self) -> Result<Vec<Connection>> {
        let docs = self
            .store
            .find_many(
                collections::CONNECTIONS,
                FindOptions::filter(json!({"sync_enabled": true})),
            )
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).context("malformed connection document"))
            .collect()
    }

    /// Destroy a connection, cascading to its sync-state and rows.
    pub async fn delete(&self, connection_id: &str) -> Result<()> {
        self.store
            .delete_many(collections::CONNECTIONS, &json!({"id": connection_id}))
            .await?;
        self.store
            .delete_many(
                collections::SYNC_STATES,
                &json!({"connection_id": connection_id}),
            )
            .await?;
        let rows = self
            .store
            .delete_many(
                collections::SHEET_ROWS,
                &json!({"connection_id": connection_id}),
            )
            .await?;
        debug!("deleted connection {connection_id} and {rows} rows");
        Ok(())
    }

    // --- sync-state ---

    pub async fn sync_state(&self, connection_id: &str) -> Result<Option<SyncState>> {
        let doc = self
            .store
            .find_one(
                collections::SYNC_STATES,
                &json!({"connection_id": connection_id}),
            )
            .await?;
        doc.map(|d| serde_json::from_value(d).context("malformed sync-state document"))
            .transpose()
    }

    /// Load the state, synthesizing the lazy initial row on first attempt.
    pub async fn sync_state_or_default(&self, connection_id: &str) -> Result<SyncState> {
        Ok(self
            .sync_state(connection_id)
            .await?
            .unwrap_or_else(|| SyncState::initial(connection_id)))
    }

    pub async fn mark_syncing(&self, connection_id: &str, state: &SyncState) -> Result<()> {
        let mut next = state.clone();
        next.status = SyncStatus::Syncing;
        next.last_error = None;
        self.put_sync_state(&next).await
    }

    pub async fn mark_success(
        &self,
        connection_id: &str,
        last_synced_row: u32,
        rows_processed: u64,
    ) -> Result<()> {
        let mut state = self.sync_state_or_default(connection_id).await?;
        state.status = SyncStatus::Success;
        state.last_synced_row = last_synced_row;
        state.last_sync_time = Some(Utc::now());
        state.last_error = None;
        state.total_rows_synced += rows_processed;
        self.put_sync_state(&state).await
    }

    pub async fn mark_failed(&self, connection_id: &str, error: &str) -> Result<()> {
        let mut state = self.sync_state_or_default(connection_id).await?;
        state.status = SyncStatus::Failed;
        state.last_error = Some(error.to_string());
        self.put_sync_state(&state).await
    }

    async fn put_sync_state(&self, state: &SyncState) -> Result<()> {
        self.store
            .upsert(
                collections::SYNC_STATES,
                &json!({"connection_id": &state.connection_id}),
                serde_json::to_value(state)?,
            )
            .await
    }

    // --- sheet rows ---

    /// Upsert by `(connection_id, row_number)`: re-syncing a row number
    /// replaces, never duplicates.
    pub async fn upsert_row(&self, row: &SheetRow) -> Result<()> {
        self.store
            .upsert(
                collections::SHEET_ROWS,
                &json!({
                    "connection_id": &row.connection_id,
                    "row_number": row.row_number,
                }),
                serde_json::to_value(row)?,
            )
            .await
    }

    pub async fn count_rows(&self, connection_id: &str) -> Result<u64> {
        self.store
            .count(
                collections::SHEET_ROWS,
                &json!({"connection_id": connection_id}),
            )
            .await
    }
}

#[cfg(test)]
pub(crate) fn test_connection(id: &str, user_id: &str, tab_name: &str) -> Connection {
    Connection {
        id: id.to_string(),
        user_id: user_id.to_string(),
        name: tab_name.to_string(),
        sheet_id: format!("sheet-{id}"),
        tab_name: tab_name.to_string(),
        column_mappings: vec![
            ColumnMapping {
                system_field: "order_id".into(),
                sheet_column: "A".into(),
                data_type: DataType::String,
                required: false,
            },
            ColumnMapping {
                system_field: "platform".into(),
                sheet_column: "C".into(),
                data_type: DataType::String,
                required: false,
            },
            ColumnMapping {
                system_field: "total_amount".into(),
                sheet_column: "P".into(),
                data_type: DataType::Number,
                required: true,
            },
        ],
        header_row: 1,
        data_start_row: 2,
        sync_enabled: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Fresh entity id. One place so the id format can change once.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
