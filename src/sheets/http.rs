//! Google Sheets v4 REST adapter.
//!
//! Raw reads only: authorization is a bearer token obtained from an
//! [`AccessTokenProvider`] (service-account token exchange lives behind
//! that trait), and quota management belongs to the crawler's rate
//! limiter, not this client.

use super::{SheetMetadata, SheetSource};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Widest column fetched per read. Mappings beyond `ZZ` are not supported.
const LAST_COLUMN: &str = "ZZ";

/// Supplies the bearer token for sheet API calls.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Fixed-token provider for tests and short-lived jobs.
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub struct HttpSheetSource {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

#[derive(Deserialize)]
struct SpreadsheetResponse {
    properties: Option<SpreadsheetProperties>,
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Deserialize)]
struct SpreadsheetProperties {
    title: Option<String>,
}

#[derive(Deserialize)]
struct SheetEntry {
    properties: Option<TabProperties>,
}

#[derive(Deserialize)]
struct TabProperties {
    title: Option<String>,
}

#[derive(Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl HttpSheetSource {
    pub fn new(tokens: Arc<dyn AccessTokenProvider>) -> Result<Self> {
        Self::with_base_url(tokens, DEFAULT_BASE_URL)
    }

    /// Override the API origin. Tests point this at a wiremock server.
    pub fn with_base_url(tokens: Arc<dyn AccessTokenProvider>, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build sheets HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("sheets request failed: {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("sheets API returned {status}: {body}");
        }
        response
            .json::<T>()
            .await
            .context("failed to decode sheets API response")
    }
}

#[async_trait]
impl SheetSource for HttpSheetSource {
    async fn metadata(&self, sheet_id: &str) -> Result<SheetMetadata> {
        let url = format!(
            "{}/v4/spreadsheets/{}?fields=properties.title,sheets.properties.title",
            self.base_url, sheet_id
        );
        let response: SpreadsheetResponse = self.get_json(&url).await?;
        Ok(SheetMetadata {
            title: response
                .properties
                .and_then(|p| p.title)
                .unwrap_or_default(),
            tabs: response
                .sheets
                .into_iter()
                .filter_map(|s| s.properties.and_then(|p| p.title))
                .collect(),
        })
    }

    async fn values(&self, sheet_id: &str, tab: &str, start_row: u32) -> Result<Vec<Vec<String>>> {
        // reqwest's URL parser percent-encodes spaces and non-ASCII tab
        // names; `!` and `:` are valid path characters and stay literal.
        let range = format!("{tab}!A{start_row}:{LAST_COLUMN}");
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}?majorDimension=ROWS",
            self.base_url, sheet_id, range
        );
        let response: ValuesResponse = self.get_json(&url).await?;
        debug!("fetched {} rows from {range}", response.values.len());
        Ok(response
            .values
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|cell| match cell {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect()
            })
            .collect())
    }

    async fn check_access(&self, sheet_id: &str) -> bool {
        let url = format!(
            "{}/v4/spreadsheets/{}?fields=properties.title",
            self.base_url, sheet_id
        );
        self.get_json::<SpreadsheetResponse>(&url).await.is_ok()
    }
}
