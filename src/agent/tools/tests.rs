use super::*;
use crate::connections::test_connection;
use crate::store::{MemStore, collections};

struct Fixture {
    store: Arc<MemStore>,
    registry: ToolRegistry,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemStore::new());
    let repo = ConnectionRepo::new(store.clone());
    repo.create(&test_connection("c1", "alice", "Orders"))
        .await
        .unwrap();
    repo.create(&test_connection("c2", "bob", "Orders"))
        .await
        .unwrap();
    let registry = data_query_tools(store.clone(), repo);
    Fixture { store, registry }
}

async fn seed_order(
    fixture: &Fixture,
    connection_id: &str,
    row_number: u32,
    platform: &str,
    amount: f64,
    date: &str,
) {
    fixture
        .store
        .insert_one(
            collections::SHEET_ROWS,
            serde_json::json!({
                "connection_id": connection_id,
                "row_number": row_number,
                "document": {
                    "order_id": format!("O{row_number}"),
                    "platform": platform,
                    "total_amount": amount,
                    "order_date": date,
                },
            }),
        )
        .await
        .unwrap();
}

fn alice() -> ToolContext {
    ToolContext {
        user_id: "alice".into(),
    }
}

async fn run(fixture: &Fixture, tool: &str, args: Value) -> ToolResult {
    fixture
        .registry
        .get(tool)
        .unwrap_or_else(|| panic!("tool {tool} not registered"))
        .execute(args, &alice())
        .await
        .unwrap()
}

#[tokio::test]
async fn registry_exposes_five_tools_in_order() {
    let fixture = fixture().await;
    assert_eq!(
        fixture.registry.names(),
        vec![
            "get_schema",
            "aggregate_data",
            "top_records",
            "compare_periods",
            "custom_pipeline",
        ]
    );
    assert_eq!(fixture.registry.specs().len(), 5);
}

#[tokio::test]
async fn schema_lists_fields_with_samples() {
    let fixture = fixture().await;
    seed_order(&fixture, "c1", 2, "Shopee", 100.0, "2024-01-05").await;
    seed_order(&fixture, "c1", 3, "Lazada", 200.0, "2024-01-06").await;

    let result = run(&fixture, "get_schema", json!({})).await;
    assert!(!result.is_error);
    let parsed: Vec<Value> = serde_json::from_str(&result.content).unwrap();
    assert_eq!(parsed.len(), 1, "only alice's connections are visible");
    assert_eq!(parsed[0]["name"], "Orders");
    assert_eq!(parsed[0]["sheet_type"], "orders");

    let fields = parsed[0]["fields"].as_array().unwrap();
    let platform = fields
        .iter()
        .find(|f| f["name"] == "platform")
        .expect("platform field");
    let samples = platform["sample_values"].as_array().unwrap();
    assert!(samples.contains(&json!("Shopee")));
}

#[tokio::test]
async fn unknown_connection_error_lists_available() {
    let fixture = fixture().await;
    let result = run(
        &fixture,
        "get_schema",
        json!({"connection_name": "KhongCo"}),
    )
    .await;
    assert!(result.is_error);
    assert!(result.content.contains("Orders"));
}

#[tokio::test]
async fn tools_cannot_see_other_users_connections() {
    let fixture = fixture().await;
    seed_order(&fixture, "c2", 2, "Shopee", 999.0, "2024-01-05").await;

    // Bob's connection is also named "Orders"; alice resolves her own.
    let result = run(
        &fixture,
        "aggregate_data",
        json!({"connection_name": "Orders", "operation": "sum", "field": "total_amount"}),
    )
    .await;
    assert!(!result.is_error);
    let parsed: Value = serde_json::from_str(&result.content).unwrap();
    // Alice has no rows; bob's 999 must not leak through.
    assert_eq!(parsed["value"], json!(0));
}

#[tokio::test]
async fn aggregate_sum_and_grouped() {
    let fixture = fixture().await;
    seed_order(&fixture, "c1", 2, "Shopee", 100.0, "2024-01-05").await;
    seed_order(&fixture, "c1", 3, "Shopee", 200.0, "2024-01-10").await;
    seed_order(&fixture, "c1", 4, "Lazada", 50.0, "2024-02-01").await;

    let result = run(
        &fixture,
        "aggregate_data",
        json!({"connection_name": "Orders", "operation": "sum", "field": "total_amount"}),
    )
    .await;
    let parsed: Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(parsed["value"], json!(350));

    // Date-ranged
    let result = run(
        &fixture,
        "aggregate_data",
        json!({
            "connection_name": "Orders",
            "operation": "sum",
            "field": "total_amount",
            "date_from": "2024-01-01",
            "date_to": "2024-01-31",
        }),
    )
    .await;
    let parsed: Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(parsed["value"], json!(300));

    // Grouped, ordered by value descending
    let result = run(
        &fixture,
        "aggregate_data",
        json!({
            "connection_name": "Orders",
            "operation": "sum",
            "field": "total_amount",
            "group_by": "platform",
        }),
    )
    .await;
    let parsed: Value = serde_json::from_str(&result.content).unwrap();
    let results = parsed["results"].as_array().unwrap();
    assert_eq!(results[0]["group"], "Shopee");
    assert_eq!(results[0]["value"], json!(300));
    assert_eq!(results[1]["group"], "Lazada");
}

#[tokio::test]
async fn aggregate_requires_field_for_non_count() {
    let fixture = fixture().await;
    let result = run(
        &fixture,
        "aggregate_data",
        json!({"connection_name": "Orders", "operation": "sum"}),
    )
    .await;
    assert!(result.is_error);
    assert!(result.content.contains("requires a field"));

    // count works without a field
    let result = run(
        &fixture,
        "aggregate_data",
        json!({"connection_name": "Orders", "operation": "count"}),
    )
    .await;
    assert!(!result.is_error);
}

#[tokio::test]
async fn top_groups_rank_by_aggregate_field() {
    let fixture = fixture().await;
    seed_order(&fixture, "c1", 2, "Shopee", 1000.0, "2024-01-05").await;
    seed_order(&fixture, "c1", 3, "Shopee", 2000.0, "2024-01-06").await;
    seed_order(&fixture, "c1", 4, "Lazada", 2000.0, "2024-01-07").await;
    seed_order(&fixture, "c1", 5, "Tiki", 1000.0, "2024-01-08").await;

    let result = run(
        &fixture,
        "top_records",
        json!({
            "connection_name": "Orders",
            "sort_field": "total_amount",
            "group_by": "platform",
            "aggregate_field": "total_amount",
            "limit": 2,
        }),
    )
    .await;
    let parsed: Vec<Value> = serde_json::from_str(&result.content).unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0]["group"], "Shopee");
    assert_eq!(parsed[0]["value"], json!(3000));
    assert_eq!(parsed[1]["group"], "Lazada");
}

#[tokio::test]
async fn top_rows_sorted_descending_by_default() {
    let fixture = fixture().await;
    seed_order(&fixture, "c1", 2, "Shopee", 100.0, "2024-01-05").await;
    seed_order(&fixture, "c1", 3, "Lazada", 300.0, "2024-01-06").await;
    seed_order(&fixture, "c1", 4, "Tiki", 200.0, "2024-01-07").await;

    let result = run(
        &fixture,
        "top_records",
        json!({"connection_name": "Orders", "sort_field": "total_amount", "limit": 2}),
    )
    .await;
    let parsed: Vec<Value> = serde_json::from_str(&result.content).unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0]["platform"], "Lazada");
    assert_eq!(parsed[1]["platform"], "Tiki");
}

#[tokio::test]
async fn compare_periods_matches_scenario() {
    let fixture = fixture().await;
    // January totals 10,000,000; February totals 12,000,000
    seed_order(&fixture, "c1", 2, "Shopee", 4_000_000.0, "2024-01-10").await;
    seed_order(&fixture, "c1", 3, "Lazada", 6_000_000.0, "2024-01-20").await;
    seed_order(&fixture, "c1", 4, "Shopee", 12_000_000.0, "2024-02-15").await;

    let result = run(
        &fixture,
        "compare_periods",
        json!({
            "connection_name": "Orders",
            "operation": "sum",
            "field": "total_amount",
            "date_field": "order_date",
            "period1_from": "2024-01-01",
            "period1_to": "2024-01-31",
            "period2_from": "2024-02-01",
            "period2_to": "2024-02-29",
        }),
    )
    .await;
    let parsed: Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(parsed["period1_value"], json!(10_000_000.0));
    assert_eq!(parsed["period2_value"], json!(12_000_000.0));
    assert_eq!(parsed["difference"], json!(2_000_000.0));
    assert!((parsed["percentage_change"].as_f64().unwrap() - 20.0).abs() < 1e-9);
}

#[tokio::test]
async fn compare_periods_null_change_on_zero_baseline() {
    let fixture = fixture().await;
    seed_order(&fixture, "c1", 2, "Shopee", 500.0, "2024-02-15").await;

    let result = run(
        &fixture,
        "compare_periods",
        json!({
            "connection_name": "Orders",
            "operation": "sum",
            "field": "total_amount",
            "date_field": "order_date",
            "period1_from": "2024-01-01",
            "period1_to": "2024-01-31",
            "period2_from": "2024-02-01",
            "period2_to": "2024-02-29",
        }),
    )
    .await;
    let parsed: Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(parsed["period1_value"], json!(0.0));
    assert_eq!(parsed["percentage_change"], Value::Null);
}

#[tokio::test]
async fn custom_pipeline_is_sanitized_and_scoped() {
    let fixture = fixture().await;
    seed_order(&fixture, "c1", 2, "Shopee", 100.0, "2024-01-05").await;
    seed_order(&fixture, "c2", 2, "Shopee", 999.0, "2024-01-05").await;

    // A plain match: limit appended, only alice's rows visible.
    let result = run(
        &fixture,
        "custom_pipeline",
        json!({
            "connection_name": "Orders",
            "pipeline": [{"$match": {"document.platform": "Shopee"}}],
            "description": "Shopee rows",
        }),
    )
    .await;
    assert!(!result.is_error);
    let parsed: Vec<Value> = serde_json::from_str(&result.content).unwrap();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0]["document"]["total_amount"], json!(100.0));

    // Forbidden stage
    let result = run(
        &fixture,
        "custom_pipeline",
        json!({
            "connection_name": "Orders",
            "pipeline": [{"$match": {}}, {"$out": "exfil"}],
        }),
    )
    .await;
    assert!(result.is_error);
    assert!(result.content.contains("FORBIDDEN_STAGE"));

    // Lookup into a connection alice does not own
    let result = run(
        &fixture,
        "custom_pipeline",
        json!({
            "connection_name": "Orders",
            "pipeline": [
                {"$lookup": {"from": "c2", "localField": "a", "foreignField": "b", "as": "j"}},
            ],
        }),
    )
    .await;
    assert!(result.is_error);
    assert!(result.content.contains("FORBIDDEN_LOOKUP"));

    // Lookup into her own connection id passes validation
    let result = run(
        &fixture,
        "custom_pipeline",
        json!({
            "connection_name": "Orders",
            "pipeline": [
                {"$lookup": {"from": "c1", "localField": "a", "foreignField": "b", "as": "j"}},
            ],
        }),
    )
    .await;
    assert!(!result.is_error);
}

#[tokio::test]
async fn invalid_arguments_become_tool_errors() {
    let fixture = fixture().await;
    let result = run(&fixture, "aggregate_data", json!({"operation": "sum"})).await;
    assert!(result.is_error);
    assert!(result.content.contains("Invalid arguments"));

    let result = run(
        &fixture,
        "aggregate_data",
        json!({"connection_name": "Orders", "operation": "median", "field": "x"}),
    )
    .await;
    assert!(result.is_error);
}
