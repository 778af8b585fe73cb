use anyhow::Result;
use async_trait::async_trait;

mod coerce;
mod columns;
mod http;

pub use coerce::{DataType, coerce_value};
pub use columns::{ResolvedMapping, column_index, resolve_mappings};
pub use http::{AccessTokenProvider, HttpSheetSource, StaticTokenProvider};

/// Spreadsheet-level metadata: the document title and its tab names.
#[derive(Debug, Clone)]
pub struct SheetMetadata {
    pub title: String,
    pub tabs: Vec<String>,
}

/// Source-sheet boundary. Implementations perform raw reads only; quota
/// management belongs to the caller (the crawler routes every call through
/// the rate limiter).
#[async_trait]
pub trait SheetSource: Send + Sync {
    async fn metadata(&self, sheet_id: &str) -> Result<SheetMetadata>;

    /// Fetch all rows of `tab` from `start_row` (1-based, inclusive) to the
    /// last non-empty row. Each row is the ordered list of cell strings.
    async fn values(&self, sheet_id: &str, tab: &str, start_row: u32) -> Result<Vec<Vec<String>>>;

    /// Whether the service account can read the sheet at all.
    async fn check_access(&self, sheet_id: &str) -> bool;
}
