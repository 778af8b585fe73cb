//! Per-sheet-type analytics strategies.
//!
//! Each strategy declares which fields can be searched, sorted, grouped
//! and ranked, and builds the summary pipeline for its document shape.
//! The engine prepends the connection match to every pipeline, so
//! strategies only emit domain stages.

use crate::connections::SheetType;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Truncation period for time-series grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Week,
    Month,
    Year,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

/// Ranking metric for the top endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopMetric {
    Count,
    Amount,
    Quantity,
}

pub trait SheetStrategy: Send + Sync {
    fn sheet_type(&self) -> SheetType;

    fn searchable_fields(&self) -> &'static [&'static str];
    fn sortable_fields(&self) -> &'static [&'static str];

    fn supports_time_series(&self) -> bool {
        false
    }
    fn distribution_fields(&self) -> &'static [&'static str] {
        &[]
    }
    fn top_fields(&self) -> &'static [&'static str] {
        &[]
    }
    fn top_metrics(&self) -> &'static [TopMetric] {
        &[]
    }

    /// The document field a date-range filter applies to, when supported.
    fn date_field(&self) -> Option<&'static str> {
        None
    }

    /// Aggregation stages computing the summary for this sheet type.
    /// `date_from`/`date_to` are ISO dates, honored only when the
    /// strategy has a date field.
    fn summary_pipeline(&self, date_from: Option<&str>, date_to: Option<&str>) -> Vec<Value>;

    /// Shape the raw group row (if any) into the summary object.
    fn shape_summary(&self, row: Option<&Value>) -> Value;

    /// The accumulator expression for a top metric, or `None` when the
    /// metric is count.
    fn metric_expr(&self, metric: TopMetric) -> Option<Value> {
        match (self.sheet_type(), metric) {
            (SheetType::Orders, TopMetric::Amount) => Some(json!("$document.total_amount")),
            (SheetType::OrderItems, TopMetric::Quantity) => Some(json!("$document.quantity")),
            _ => None,
        }
    }
}

/// Build the `$match` stage for an inclusive date range on `field`.
pub(crate) fn date_range_match(
    field: &str,
    date_from: Option<&str>,
    date_to: Option<&str>,
) -> Option<Value> {
    let mut range = serde_json::Map::new();
    if let Some(from) = date_from {
        range.insert("$gte".into(), json!(from));
    }
    if let Some(to) = date_to {
        range.insert("$lte".into(), json!(to));
    }
    if range.is_empty() {
        return None;
    }
    let mut matcher = serde_json::Map::new();
    matcher.insert(format!("document.{field}"), Value::Object(range));
    Some(json!({"$match": Value::Object(matcher)}))
}

struct OrdersStrategy;
struct OrderItemsStrategy;
struct CustomersStrategy;
struct ProductsStrategy;

impl SheetStrategy for OrdersStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::Orders
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["order_id", "customer_name", "platform", "order_status"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &["order_date", "total_amount", "platform", "order_status"]
    }

    fn supports_time_series(&self) -> bool {
        true
    }

    fn distribution_fields(&self) -> &'static [&'static str] {
        &["platform", "order_status"]
    }

    fn top_fields(&self) -> &'static [&'static str] {
        &["platform"]
    }

    fn top_metrics(&self) -> &'static [TopMetric] {
        &[TopMetric::Count, TopMetric::Amount]
    }

    fn date_field(&self) -> Option<&'static str> {
        Some("order_date")
    }

    fn summary_pipeline(&self, date_from: Option<&str>, date_to: Option<&str>) -> Vec<Value> {
        let mut pipeline = Vec::new();
        if let Some(stage) = date_range_match("order_date", date_from, date_to) {
            pipeline.push(stage);
        }
        pipeline.push(json!({"$group": {
            "_id": null,
            "total_count": {"$sum": 1},
            "total_amount": {"$sum": "$document.total_amount"},
            "avg_amount": {"$avg": "$document.total_amount"},
        }}));
        pipeline
    }

    fn shape_summary(&self, row: Option<&Value>) -> Value {
        match row {
            Some(row) => json!({
                "total_count": row["total_count"],
                "total_amount": row["total_amount"],
                "avg_amount": row["avg_amount"],
            }),
            None => json!({"total_count": 0, "total_amount": 0, "avg_amount": null}),
        }
    }
}

impl SheetStrategy for OrderItemsStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::OrderItems
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["product_name", "order_id", "sku"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &["quantity", "line_total", "product_name"]
    }

    fn top_fields(&self) -> &'static [&'static str] {
        &["product_name"]
    }

    fn top_metrics(&self) -> &'static [TopMetric] {
        &[TopMetric::Count, TopMetric::Quantity]
    }

    fn summary_pipeline(&self, _date_from: Option<&str>, _date_to: Option<&str>) -> Vec<Value> {
        vec![json!({"$group": {
            "_id": null,
            "total_quantity": {"$sum": "$document.quantity"},
            "total_line_total": {"$sum": "$document.line_total"},
            "products": {"$addToSet": "$document.product_name"},
        }})]
    }

    fn shape_summary(&self, row: Option<&Value>) -> Value {
        match row {
            Some(row) => json!({
                "total_quantity": row["total_quantity"],
                "total_line_total": row["total_line_total"],
                "unique_products": row["products"].as_array().map_or(0, Vec::len),
            }),
            None => json!({"total_quantity": 0, "total_line_total": 0, "unique_products": 0}),
        }
    }
}

impl SheetStrategy for CustomersStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::Customers
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["customer_name", "phone", "email"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &["customer_name"]
    }

    fn summary_pipeline(&self, _date_from: Option<&str>, _date_to: Option<&str>) -> Vec<Value> {
        vec![json!({"$group": {"_id": null, "total_count": {"$sum": 1}}})]
    }

    fn shape_summary(&self, row: Option<&Value>) -> Value {
        json!({"total_count": row.map_or(json!(0), |r| r["total_count"].clone())})
    }
}

impl SheetStrategy for ProductsStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::Products
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["product_name", "sku", "category"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &["product_name", "price", "stock"]
    }

    fn summary_pipeline(&self, _date_from: Option<&str>, _date_to: Option<&str>) -> Vec<Value> {
        vec![json!({"$group": {"_id": null, "total_count": {"$sum": 1}}})]
    }

    fn shape_summary(&self, row: Option<&Value>) -> Value {
        json!({"total_count": row.map_or(json!(0), |r| r["total_count"].clone())})
    }
}

static ORDERS: OrdersStrategy = OrdersStrategy;
static ORDER_ITEMS: OrderItemsStrategy = OrderItemsStrategy;
static CUSTOMERS: CustomersStrategy = CustomersStrategy;
static PRODUCTS: ProductsStrategy = ProductsStrategy;

pub fn strategy_for(sheet_type: SheetType) -> &'static dyn SheetStrategy {
    match sheet_type {
        SheetType::Orders => &ORDERS,
        SheetType::OrderItems => &ORDER_ITEMS,
        SheetType::Customers => &CUSTOMERS,
        SheetType::Products => &PRODUCTS,
    }
}
