//! Analytics engine: summary, time-series, distribution, top and raw-data
//! queries, delegated to the per-sheet-type strategy and cached per
//! connection.

use super::cache::AnalyticsCache;
use super::strategy::{Period, SheetStrategy, TopMetric, date_range_match, strategy_for};
use crate::connections::ConnectionRepo;
use crate::errors::{SheetmindError, codes};
use crate::store::{DocumentStore, FindOptions, collections};
use regex::escape as regex_escape;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

const DEFAULT_TOP_LIMIT: u32 = 10;
const MAX_TOP_LIMIT: u32 = 50;
const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeriesPoint {
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionEntry {
    pub value: Value,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopEntry {
    pub value: Value,
    pub count: u64,
    pub metric_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Raw-data query parameters. Defaults: first page of 20, newest rows
/// first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for DataQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            search: None,
            sort_by: None,
            sort_order: None,
            date_from: None,
            date_to: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub data: Vec<Value>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

#[derive(Clone)]
pub struct AnalyticsEngine {
    store: Arc<dyn DocumentStore>,
    repo: ConnectionRepo,
    cache: AnalyticsCache,
}

impl AnalyticsEngine {
    pub fn new(store: Arc<dyn DocumentStore>, repo: ConnectionRepo, cache: AnalyticsCache) -> Self {
        Self { store, repo, cache }
    }

    /// Strategy summary for one connection, cached.
    pub async fn summary(
        &self,
        user_id: &str,
        connection_id: &str,
        date_from: Option<&str>,
        date_to: Option<&str>,
    ) -> Result<Value, SheetmindError> {
        let connection = self.repo.get_owned(connection_id, user_id).await?;
        let strategy = strategy_for(connection.sheet_type());
        validate_range(date_from, date_to)?;

        let params = json!({"date_from": date_from, "date_to": date_to});
        if let Some(cached) = self.cache.get(connection_id, "summary", &params).await {
            return Ok(cached);
        }

        let mut pipeline = vec![connection_match(connection_id)];
        pipeline.extend(strategy.summary_pipeline(date_from, date_to));
        let rows = self
            .store
            .aggregate(collections::SHEET_ROWS, &pipeline)
            .await?;
        let result = strategy.shape_summary(rows.first());

        self.cache.put(connection_id, "summary", &params, &result).await;
        Ok(result)
    }

    /// Order counts/amounts grouped by truncated period. Orders only;
    /// both range bounds are required and every point has a distinct date.
    pub async fn time_series(
        &self,
        user_id: &str,
        connection_id: &str,
        date_from: &str,
        date_to: &str,
        period: Period,
        with_count: bool,
        with_amount: bool,
    ) -> Result<Vec<TimeSeriesPoint>, SheetmindError> {
        let connection = self.repo.get_owned(connection_id, user_id).await?;
        let strategy = strategy_for(connection.sheet_type());
        if !strategy.supports_time_series() {
            return Err(SheetmindError::validation(
                codes::FEATURE_UNSUPPORTED,
                format!(
                    "time series is not supported for {} sheets",
                    connection.sheet_type().as_str()
                ),
            ));
        }
        let date_field = strategy.date_field().expect("time-series strategy has a date field");
        validate_range(Some(date_from), Some(date_to))?;

        let params = json!({
            "date_from": date_from,
            "date_to": date_to,
            "period": period.as_str(),
            "with_count": with_count,
            "with_amount": with_amount,
        });
        if let Some(cached) = self.cache.get(connection_id, "time_series", &params).await {
            if let Ok(points) = serde_json::from_value(cached) {
                return Ok(points);
            }
        }

        let mut pipeline = vec![connection_match(connection_id)];
        if let Some(stage) = date_range_match(date_field, Some(date_from), Some(date_to)) {
            pipeline.push(stage);
        }
        let date_expr = format!("$document.{date_field}");
        pipeline.push(json!({"$group": {
            "_id": {"$dateTrunc": {"date": date_expr, "unit": period.as_str()}},
            "count": {"$sum": 1},
            "total_amount": {"$sum": "$document.total_amount"},
        }}));
        pipeline.push(json!({"$sort": {"_id": 1}}));

        let rows = self
            .store
            .aggregate(collections::SHEET_ROWS, &pipeline)
            .await?;
        let points: Vec<TimeSeriesPoint> = rows
            .iter()
            .filter(|row| !row["_id"].is_null())
            .map(|row| TimeSeriesPoint {
                date: row["_id"].as_str().unwrap_or_default().to_string(),
                count: with_count.then(|| row["count"].as_u64().unwrap_or(0)),
                total_amount: with_amount.then(|| row["total_amount"].as_f64().unwrap_or(0.0)),
            })
            .collect();

        if let Ok(value) = serde_json::to_value(&points) {
            self.cache.put(connection_id, "time_series", &params, &value).await;
        }
        Ok(points)
    }

    /// Count per distinct value of `field`, with percentages summing to
    /// 100.0 (the largest group absorbs the rounding residual).
    pub async fn distribution(
        &self,
        user_id: &str,
        connection_id: &str,
        field: &str,
    ) -> Result<Vec<DistributionEntry>, SheetmindError> {
        let connection = self.repo.get_owned(connection_id, user_id).await?;
        let strategy = strategy_for(connection.sheet_type());
        if strategy.distribution_fields().is_empty() {
            return Err(SheetmindError::validation(
                codes::FEATURE_UNSUPPORTED,
                format!(
                    "distribution is not supported for {} sheets",
                    connection.sheet_type().as_str()
                ),
            ));
        }
        if !strategy.distribution_fields().contains(&field) {
            return Err(SheetmindError::validation(
                codes::FIELD_UNSUPPORTED,
                format!("field '{field}' does not support distribution"),
            ));
        }

        let params = json!({"field": field});
        if let Some(cached) = self.cache.get(connection_id, "distribution", &params).await {
            if let Ok(entries) = serde_json::from_value(cached) {
                return Ok(entries);
            }
        }

        let group_expr = format!("$document.{field}");
        let pipeline = vec![
            connection_match(connection_id),
            json!({"$group": {"_id": group_expr, "count": {"$sum": 1}}}),
            json!({"$sort": {"count": -1}}),
        ];
        let rows = self
            .store
            .aggregate(collections::SHEET_ROWS, &pipeline)
            .await?;

        let total: u64 = rows.iter().map(|r| r["count"].as_u64().unwrap_or(0)).sum();
        let mut entries: Vec<DistributionEntry> = rows
            .into_iter()
            .map(|row| {
                let count = row["count"].as_u64().unwrap_or(0);
                DistributionEntry {
                    value: row["_id"].clone(),
                    count,
                    percentage: if total == 0 {
                        0.0
                    } else {
                        round1(count as f64 / total as f64 * 100.0)
                    },
                }
            })
            .collect();

        if total > 0 && !entries.is_empty() {
            let residual = 100.0 - entries.iter().map(|e| e.percentage).sum::<f64>();
            if residual.abs() > f64::EPSILON {
                entries[0].percentage = round1(entries[0].percentage + residual);
            }
        }

        if let Ok(value) = serde_json::to_value(&entries) {
            self.cache.put(connection_id, "distribution", &params, &value).await;
        }
        Ok(entries)
    }

    /// Top groups by metric, descending, capped at `limit` in `[1, 50]`.
    pub async fn top(
        &self,
        user_id: &str,
        connection_id: &str,
        field: &str,
        metric: TopMetric,
        limit: Option<u32>,
    ) -> Result<Vec<TopEntry>, SheetmindError> {
        let connection = self.repo.get_owned(connection_id, user_id).await?;
        let strategy = strategy_for(connection.sheet_type());
        if strategy.top_fields().is_empty() {
            return Err(SheetmindError::validation(
                codes::FEATURE_UNSUPPORTED,
                format!(
                    "top is not supported for {} sheets",
                    connection.sheet_type().as_str()
                ),
            ));
        }
        if !strategy.top_fields().contains(&field) {
            return Err(SheetmindError::validation(
                codes::FIELD_UNSUPPORTED,
                format!("field '{field}' does not support top"),
            ));
        }
        if !strategy.top_metrics().contains(&metric) {
            return Err(SheetmindError::validation(
                codes::FIELD_UNSUPPORTED,
                format!(
                    "metric is not supported for {} sheets",
                    connection.sheet_type().as_str()
                ),
            ));
        }
        let limit = limit.unwrap_or(DEFAULT_TOP_LIMIT);
        if !(1..=MAX_TOP_LIMIT).contains(&limit) {
            return Err(SheetmindError::validation(
                codes::BAD_LIMIT,
                format!("limit must be between 1 and {MAX_TOP_LIMIT}, got {limit}"),
            ));
        }

        let params = json!({"field": field, "metric": metric, "limit": limit});
        if let Some(cached) = self.cache.get(connection_id, "top", &params).await {
            if let Ok(entries) = serde_json::from_value(cached) {
                return Ok(entries);
            }
        }

        let group_expr = format!("$document.{field}");
        let mut group = json!({"_id": group_expr, "count": {"$sum": 1}});
        let sort_key = match strategy.metric_expr(metric) {
            Some(expr) => {
                group["metric_value"] = json!({"$sum": expr});
                "metric_value"
            }
            None => "count",
        };
        let mut sort = serde_json::Map::new();
        sort.insert(sort_key.to_string(), json!(-1));
        let pipeline = vec![
            connection_match(connection_id),
            json!({"$group": group}),
            json!({"$sort": Value::Object(sort)}),
            json!({"$limit": limit}),
        ];
        let rows = self
            .store
            .aggregate(collections::SHEET_ROWS, &pipeline)
            .await?;

        let entries: Vec<TopEntry> = rows
            .into_iter()
            .map(|row| {
                let count = row["count"].as_u64().unwrap_or(0);
                TopEntry {
                    value: row["_id"].clone(),
                    metric_value: row
                        .get("metric_value")
                        .and_then(Value::as_f64)
                        .unwrap_or(count as f64),
                    count,
                }
            })
            .collect();

        if let Ok(value) = serde_json::to_value(&entries) {
            self.cache.put(connection_id, "top", &params, &value).await;
        }
        Ok(entries)
    }

    /// Paginated raw documents with optional substring search, sort and
    /// (orders only) date-range filter.
    pub async fn data(
        &self,
        user_id: &str,
        connection_id: &str,
        query: &DataQuery,
    ) -> Result<Page, SheetmindError> {
        let connection = self.repo.get_owned(connection_id, user_id).await?;
        let strategy = strategy_for(connection.sheet_type());

        if query.date_from.is_some() || query.date_to.is_some() {
            if strategy.date_field().is_none() {
                return Err(SheetmindError::validation(
                    codes::FEATURE_UNSUPPORTED,
                    format!(
                        "date filtering is not supported for {} sheets",
                        connection.sheet_type().as_str()
                    ),
                ));
            }
            validate_range(query.date_from.as_deref(), query.date_to.as_deref())?;
        }
        if let Some(sort_by) = &query.sort_by {
            if !strategy.sortable_fields().contains(&sort_by.as_str()) {
                return Err(SheetmindError::validation(
                    codes::FIELD_UNSUPPORTED,
                    format!("field '{sort_by}' is not sortable"),
                ));
            }
        }

        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);

        let params = json!({
            "page": page,
            "page_size": page_size,
            "search": &query.search,
            "sort_by": &query.sort_by,
            "sort_order": &query.sort_order,
            "date_from": &query.date_from,
            "date_to": &query.date_to,
        });
        if let Some(cached) = self.cache.get(connection_id, "data", &params).await {
            if let Ok(page) = serde_json::from_value(cached) {
                return Ok(page);
            }
        }

        let mut conditions = serde_json::Map::new();
        conditions.insert("connection_id".into(), json!(connection_id));
        if let Some(date_field) = strategy.date_field() {
            let mut range = serde_json::Map::new();
            if let Some(from) = &query.date_from {
                range.insert("$gte".into(), json!(from));
            }
            if let Some(to) = &query.date_to {
                range.insert("$lte".into(), json!(to));
            }
            if !range.is_empty() {
                conditions.insert(format!("document.{date_field}"), Value::Object(range));
            }
        }
        if let Some(search) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
            // User input is escaped before it reaches the regex engine.
            let pattern = regex_escape(search.trim());
            let clauses: Vec<Value> = strategy
                .searchable_fields()
                .iter()
                .map(|field| {
                    let mut clause = serde_json::Map::new();
                    clause.insert(
                        format!("document.{field}"),
                        json!({"$regex": pattern, "$options": "i"}),
                    );
                    Value::Object(clause)
                })
                .collect();
            conditions.insert("$or".into(), Value::Array(clauses));
        }
        let filter = Value::Object(conditions);

        let total = self.store.count(collections::SHEET_ROWS, &filter).await?;
        let total_pages = total.div_ceil(u64::from(page_size));

        let direction = match query.sort_order {
            Some(SortOrder::Asc) => 1,
            _ => -1,
        };
        let sort = match &query.sort_by {
            Some(field) => vec![(format!("document.{field}"), direction)],
            // Default: newest rows first.
            None => vec![("row_number".to_string(), -1)],
        };

        let data = self
            .store
            .find_many(
                collections::SHEET_ROWS,
                FindOptions {
                    filter,
                    sort,
                    skip: Some(u64::from(page - 1) * u64::from(page_size)),
                    limit: Some(u64::from(page_size)),
                },
            )
            .await?;

        let result = Page {
            data,
            total,
            page,
            page_size,
            total_pages,
        };
        if let Ok(value) = serde_json::to_value(&result) {
            self.cache.put(connection_id, "data", &params, &value).await;
        }
        Ok(result)
    }
}

fn connection_match(connection_id: &str) -> Value {
    json!({"$match": {"connection_id": connection_id}})
}

fn validate_range(date_from: Option<&str>, date_to: Option<&str>) -> Result<(), SheetmindError> {
    if let (Some(from), Some(to)) = (date_from, date_to) {
        if from > to {
            return Err(SheetmindError::validation(
                codes::BAD_RANGE,
                format!("date_from {from} is after date_to {to}"),
            ));
        }
    }
    Ok(())
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests;
