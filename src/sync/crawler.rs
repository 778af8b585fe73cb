//! Incremental crawler: fetches new sheet rows, maps and coerces them,
//! and upserts them into the document store.

use crate::analytics::AnalyticsCache;
use crate::connections::{Connection, ConnectionRepo, SheetRow, SyncState};
use crate::errors::{SheetmindError, codes};
use crate::notify::{Notifier, events};
use crate::sheets::{ResolvedMapping, SheetSource, coerce_value, resolve_mappings};
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one sync invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReport {
    /// Connection exists but syncing is disabled; nothing was fetched and
    /// no events were emitted.
    Skipped,
    Completed {
        rows_synced: u64,
        total_rows: u64,
        last_synced_row: u32,
    },
}

pub struct CrawlerService {
    repo: ConnectionRepo,
    sheets: Arc<dyn SheetSource>,
    notifier: Arc<dyn Notifier>,
    cache: AnalyticsCache,
}

impl CrawlerService {
    pub fn new(
        repo: ConnectionRepo,
        sheets: Arc<dyn SheetSource>,
        notifier: Arc<dyn Notifier>,
        cache: AnalyticsCache,
    ) -> Self {
        Self {
            repo,
            sheets,
            notifier,
            cache,
        }
    }

    /// Run one sync attempt for a connection.
    ///
    /// Emits `sync:started` exactly once, then exactly one terminal event:
    /// `sync:completed` on success or `sync:failed` on error (which also
    /// propagates so the worker can decide on a retry). The caller is
    /// expected to have acquired rate-limiter tokens for the two sheet
    /// reads this performs.
    pub async fn sync(&self, connection_id: &str) -> Result<SyncReport, SheetmindError> {
        let connection = self
            .repo
            .get(connection_id)
            .await?
            .ok_or_else(|| SheetmindError::NotFound("connection".into()))?;

        if !connection.sync_enabled {
            debug!("connection {connection_id} has sync disabled, skipping");
            return Ok(SyncReport::Skipped);
        }

        let state = self.repo.sync_state_or_default(connection_id).await?;

        self.notifier
            .emit_to_user(
                &connection.user_id,
                events::SYNC_STARTED,
                json!({"connection_id": &connection.id, "tab_name": &connection.tab_name}),
            )
            .await;
        self.repo.mark_syncing(connection_id, &state).await?;

        match self.run_sync(&connection, &state).await {
            Ok(report) => {
                if let SyncReport::Completed {
                    rows_synced,
                    total_rows,
                    ..
                } = &report
                {
                    info!(
                        "sync completed for {connection_id}: {rows_synced} new rows, {total_rows} total"
                    );
                    self.notifier
                        .emit_to_user(
                            &connection.user_id,
                            events::SYNC_COMPLETED,
                            json!({
                                "connection_id": &connection.id,
                                "rows_synced": rows_synced,
                                "total_rows": total_rows,
                            }),
                        )
                        .await;
                }
                Ok(report)
            }
            Err(e) => {
                let message = e.to_string();
                warn!("sync failed for {connection_id}: {message}");
                if let Err(store_err) = self.repo.mark_failed(connection_id, &message).await {
                    warn!("failed to record sync failure for {connection_id}: {store_err}");
                }
                self.notifier
                    .emit_to_user(
                        &connection.user_id,
                        events::SYNC_FAILED,
                        json!({"connection_id": &connection.id, "error": message}),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn run_sync(
        &self,
        connection: &Connection,
        state: &SyncState,
    ) -> Result<SyncReport, SheetmindError> {
        let start_row = connection.data_start_row.max(state.last_synced_row + 1);

        let metadata = self
            .sheets
            .metadata(&connection.sheet_id)
            .await
            .map_err(|e| SheetmindError::External(format!("sheet metadata fetch failed: {e}")))?;
        if !metadata.tabs.iter().any(|t| t == &connection.tab_name) {
            return Err(SheetmindError::validation(
                codes::MAPPING_ERROR,
                format!("tab '{}' not found in sheet", connection.tab_name),
            ));
        }

        // Header-name mappings need the header row; fetch far back enough
        // to include it, but never write rows before start_row.
        let needs_headers = connection
            .column_mappings
            .iter()
            .any(|m| crate::sheets::column_index(&m.sheet_column).is_none());
        let fetch_from = if needs_headers {
            start_row.min(connection.header_row)
        } else {
            start_row
        };

        let rows = self
            .sheets
            .values(&connection.sheet_id, &connection.tab_name, fetch_from)
            .await
            .map_err(|e| SheetmindError::External(format!("sheet values fetch failed: {e}")))?;

        let header_cells: Option<Vec<String>> = if needs_headers {
            let index = (connection.header_row - fetch_from) as usize;
            Some(rows.get(index).cloned().ok_or_else(|| {
                SheetmindError::validation(
                    codes::MAPPING_ERROR,
                    format!("header row {} is empty", connection.header_row),
                )
            })?)
        } else {
            None
        };
        let resolved = resolve_mappings(&connection.column_mappings, header_cells.as_deref())?;

        let mut rows_synced: u64 = 0;
        let mut last_synced_row = state.last_synced_row;
        for (offset, raw) in rows.iter().enumerate() {
            let row_number = fetch_from + offset as u32;
            if row_number < start_row {
                continue;
            }
            let document = map_row(raw, &resolved);
            self.repo
                .upsert_row(&SheetRow {
                    connection_id: connection.id.clone(),
                    row_number,
                    document,
                    raw: raw.clone(),
                    synced_at: Utc::now(),
                })
                .await?;
            rows_synced += 1;
            last_synced_row = last_synced_row.max(row_number);
        }

        self.repo
            .mark_success(&connection.id, last_synced_row, rows_synced)
            .await?;
        self.cache.invalidate(&connection.id).await;

        let total_rows = self.repo.count_rows(&connection.id).await?;
        Ok(SyncReport::Completed {
            rows_synced,
            total_rows,
            last_synced_row,
        })
    }
}

/// Build the mapped document for one raw row. Cells beyond the row's
/// width and empty cells leave the field out; coercion failures keep the
/// original string.
fn map_row(raw: &[String], mappings: &[ResolvedMapping]) -> Value {
    let mut document = Map::new();
    for mapping in mappings {
        let Some(index) = mapping.index else {
            continue;
        };
        let Some(cell) = raw.get(index) else {
            continue;
        };
        if cell.trim().is_empty() {
            continue;
        }
        document.insert(
            mapping.system_field.clone(),
            coerce_value(cell, mapping.data_type),
        );
    }
    Value::Object(document)
}
