use super::*;
use crate::cache::MemCache;
use crate::connections::test_connection;
use crate::store::MemStore;

struct Fixture {
    store: Arc<MemStore>,
    repo: ConnectionRepo,
    engine: AnalyticsEngine,
}

async fn fixture(tab: &str) -> Fixture {
    let store = Arc::new(MemStore::new());
    let repo = ConnectionRepo::new(store.clone());
    repo.create(&test_connection("c1", "u1", tab)).await.unwrap();
    let engine = AnalyticsEngine::new(
        store.clone(),
        repo.clone(),
        AnalyticsCache::new(Arc::new(MemCache::new())),
    );
    Fixture {
        store,
        repo,
        engine,
    }
}

async fn seed_order(fx: &Fixture, row_number: u32, platform: &str, amount: f64, date: &str) {
    fx.store
        .insert_one(
            collections::SHEET_ROWS,
            json!({
                "connection_id": "c1",
                "row_number": row_number,
                "document": {
                    "order_id": format!("O{row_number}"),
                    "platform": platform,
                    "order_status": "delivered",
                    "total_amount": amount,
                    "order_date": date,
                },
            }),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn summary_shape_for_orders() {
    let fx = fixture("Orders").await;
    seed_order(&fx, 2, "Shopee", 100.0, "2024-01-05").await;
    seed_order(&fx, 3, "Lazada", 200.0, "2024-01-06").await;

    let summary = fx.engine.summary("u1", "c1", None, None).await.unwrap();
    assert_eq!(summary["total_count"], json!(2));
    assert_eq!(summary["total_amount"], json!(300));
    assert!((summary["avg_amount"].as_f64().unwrap() - 150.0).abs() < 1e-9);
}

#[tokio::test]
async fn summary_respects_date_range() {
    let fx = fixture("Orders").await;
    seed_order(&fx, 2, "Shopee", 100.0, "2024-01-05").await;
    seed_order(&fx, 3, "Lazada", 200.0, "2024-02-06").await;

    let january = fx
        .engine
        .summary("u1", "c1", Some("2024-01-01"), Some("2024-01-31"))
        .await
        .unwrap();
    assert_eq!(january["total_count"], json!(1));
    assert_eq!(january["total_amount"], json!(100));
}

#[tokio::test]
async fn summary_of_empty_connection() {
    let fx = fixture("Orders").await;
    let summary = fx.engine.summary("u1", "c1", None, None).await.unwrap();
    assert_eq!(
        summary,
        json!({"total_count": 0, "total_amount": 0, "avg_amount": null})
    );
}

#[tokio::test]
async fn bad_range_is_rejected() {
    let fx = fixture("Orders").await;
    let err = fx
        .engine
        .summary("u1", "c1", Some("2024-02-01"), Some("2024-01-01"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::BAD_RANGE));

    // Equal bounds are a valid one-day range.
    assert!(fx
        .engine
        .summary("u1", "c1", Some("2024-01-01"), Some("2024-01-01"))
        .await
        .is_ok());
}

#[tokio::test]
async fn ownership_mismatch_is_not_found() {
    let fx = fixture("Orders").await;
    let err = fx.engine.summary("mallory", "c1", None, None).await.unwrap_err();
    assert!(matches!(err, SheetmindError::NotFound(_)));
}

#[tokio::test]
async fn distribution_matches_scenario_proportions() {
    let fx = fixture("Orders").await;
    let mut row = 2;
    for (platform, count) in [("Shopee", 450u32), ("Lazada", 350), ("Tiki", 200)] {
        for _ in 0..count {
            seed_order(&fx, row, platform, 10.0, "2024-01-05").await;
            row += 1;
        }
    }

    let entries = fx.engine.distribution("u1", "c1", "platform").await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].value, json!("Shopee"));
    assert_eq!(entries[0].count, 450);
    assert!((entries[0].percentage - 45.0).abs() < 1e-9);
    assert!((entries[1].percentage - 35.0).abs() < 1e-9);
    assert!((entries[2].percentage - 20.0).abs() < 1e-9);

    let sum: f64 = entries.iter().map(|e| e.percentage).sum();
    assert!((sum - 100.0).abs() < 0.1);
}

#[tokio::test]
async fn distribution_percentages_always_total_100() {
    let fx = fixture("Orders").await;
    // Three equal groups: naive rounding gives 33.3 * 3 = 99.9.
    for (i, platform) in ["Shopee", "Lazada", "Tiki"].iter().enumerate() {
        seed_order(&fx, 2 + i as u32, platform, 10.0, "2024-01-05").await;
    }

    let entries = fx.engine.distribution("u1", "c1", "platform").await.unwrap();
    let sum: f64 = entries.iter().map(|e| e.percentage).sum();
    assert!((sum - 100.0).abs() < 0.1, "sum was {sum}");
}

#[tokio::test]
async fn distribution_validation() {
    let fx = fixture("Orders").await;
    let err = fx
        .engine
        .distribution("u1", "c1", "total_amount")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::FIELD_UNSUPPORTED));

    let fx = fixture("Customers").await;
    let err = fx.engine.distribution("u1", "c1", "platform").await.unwrap_err();
    assert_eq!(err.code(), Some(codes::FEATURE_UNSUPPORTED));
}

#[tokio::test]
async fn top_by_amount_orders_descending() {
    let fx = fixture("Orders").await;
    // Shopee 3000, Lazada 2000, Tiki 1000
    seed_order(&fx, 2, "Shopee", 1000.0, "2024-01-05").await;
    seed_order(&fx, 3, "Shopee", 2000.0, "2024-01-06").await;
    seed_order(&fx, 4, "Lazada", 2000.0, "2024-01-07").await;
    seed_order(&fx, 5, "Tiki", 1000.0, "2024-01-08").await;

    let entries = fx
        .engine
        .top("u1", "c1", "platform", TopMetric::Amount, Some(2))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].value, json!("Shopee"));
    assert!((entries[0].metric_value - 3000.0).abs() < 1e-9);
    assert_eq!(entries[1].value, json!("Lazada"));
    assert!((entries[1].metric_value - 2000.0).abs() < 1e-9);
    assert!(entries[0].metric_value >= entries[1].metric_value);
}

#[tokio::test]
async fn top_limit_bounds_are_enforced() {
    let fx = fixture("Orders").await;
    for limit in [0, 51, 99] {
        let err = fx
            .engine
            .top("u1", "c1", "platform", TopMetric::Count, Some(limit))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::BAD_LIMIT), "limit {limit}");
    }
    // Default and bounds are accepted.
    for limit in [None, Some(1), Some(50)] {
        assert!(fx
            .engine
            .top("u1", "c1", "platform", TopMetric::Count, limit)
            .await
            .is_ok());
    }
}

#[tokio::test]
async fn top_metric_must_be_supported_by_strategy() {
    let fx = fixture("Orders").await;
    let err = fx
        .engine
        .top("u1", "c1", "platform", TopMetric::Quantity, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::FIELD_UNSUPPORTED));

    let fx = fixture("Products").await;
    let err = fx
        .engine
        .top("u1", "c1", "product_name", TopMetric::Count, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::FEATURE_UNSUPPORTED));
}

#[tokio::test]
async fn time_series_groups_by_period_without_duplicate_dates() {
    let fx = fixture("Orders").await;
    seed_order(&fx, 2, "Shopee", 100.0, "2024-01-08").await;
    seed_order(&fx, 3, "Shopee", 50.0, "2024-01-08").await;
    seed_order(&fx, 4, "Lazada", 200.0, "2024-01-10").await;
    seed_order(&fx, 5, "Tiki", 300.0, "2024-01-16").await;

    let daily = fx
        .engine
        .time_series("u1", "c1", "2024-01-01", "2024-01-31", Period::Day, true, true)
        .await
        .unwrap();
    assert_eq!(
        daily,
        vec![
            TimeSeriesPoint {
                date: "2024-01-08".into(),
                count: Some(2),
                total_amount: Some(150.0),
            },
            TimeSeriesPoint {
                date: "2024-01-10".into(),
                count: Some(1),
                total_amount: Some(200.0),
            },
            TimeSeriesPoint {
                date: "2024-01-16".into(),
                count: Some(1),
                total_amount: Some(300.0),
            },
        ]
    );

    // Weekly truncation collapses the 8th and 10th into Monday the 8th.
    let weekly = fx
        .engine
        .time_series("u1", "c1", "2024-01-01", "2024-01-31", Period::Week, true, false)
        .await
        .unwrap();
    assert_eq!(weekly.len(), 2);
    assert_eq!(weekly[0].date, "2024-01-08");
    assert_eq!(weekly[0].count, Some(3));
    assert_eq!(weekly[0].total_amount, None);
    assert_eq!(weekly[1].date, "2024-01-15");

    // No two points share a date.
    for points in [&daily, &weekly] {
        let mut dates: Vec<&str> = points.iter().map(|p| p.date.as_str()).collect();
        let len = dates.len();
        dates.dedup();
        assert_eq!(dates.len(), len);
    }
}

#[tokio::test]
async fn time_series_rejected_for_non_orders() {
    let fx = fixture("Customers").await;
    let err = fx
        .engine
        .time_series("u1", "c1", "2024-01-01", "2024-01-31", Period::Day, true, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::FEATURE_UNSUPPORTED));
}

#[tokio::test]
async fn data_pagination_boundaries() {
    let fx = fixture("Orders").await;
    for row in 2..=8 {
        seed_order(&fx, row, "Shopee", 10.0, "2024-01-05").await;
    }
    // 7 rows, page_size 3 → 3 pages.
    let query = |page| DataQuery {
        page,
        page_size: 3,
        ..DataQuery::default()
    };

    let first = fx.engine.data("u1", "c1", &query(1)).await.unwrap();
    assert_eq!(first.total, 7);
    assert_eq!(first.total_pages, 3);
    assert_eq!(first.data.len(), 3);
    // Without an explicit sort, the newest rows come first.
    assert_eq!(first.data[0]["row_number"], json!(8));

    let last = fx.engine.data("u1", "c1", &query(3)).await.unwrap();
    assert_eq!(last.data.len(), 1);
    assert_eq!(last.total_pages, 3);

    let beyond = fx.engine.data("u1", "c1", &query(4)).await.unwrap();
    assert!(beyond.data.is_empty());
    assert_eq!(beyond.total, 7);
    assert_eq!(beyond.total_pages, 3);
}

#[tokio::test]
async fn data_page_size_is_clamped() {
    let fx = fixture("Orders").await;
    seed_order(&fx, 2, "Shopee", 10.0, "2024-01-05").await;

    let page = fx
        .engine
        .data(
            "u1",
            "c1",
            &DataQuery {
                page_size: 500,
                ..DataQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.page_size, 100);

    let page = fx
        .engine
        .data(
            "u1",
            "c1",
            &DataQuery {
                page_size: 0,
                ..DataQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.page_size, 1);
}

#[tokio::test]
async fn data_search_is_case_insensitive_and_escaped() {
    let fx = fixture("Orders").await;
    seed_order(&fx, 2, "Shopee", 10.0, "2024-01-05").await;
    seed_order(&fx, 3, "Lazada", 10.0, "2024-01-05").await;

    let found = fx
        .engine
        .data(
            "u1",
            "c1",
            &DataQuery {
                search: Some("shop".into()),
                ..DataQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(found.total, 1);
    assert_eq!(found.data[0]["document"]["platform"], json!("Shopee"));

    // Regex metacharacters in user input must not break the query.
    let none = fx
        .engine
        .data(
            "u1",
            "c1",
            &DataQuery {
                search: Some("a(b[c".into()),
                ..DataQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(none.total, 0);
}

#[tokio::test]
async fn data_sort_and_date_filter_validation() {
    let fx = fixture("Orders").await;
    seed_order(&fx, 2, "Shopee", 100.0, "2024-01-05").await;
    seed_order(&fx, 3, "Lazada", 300.0, "2024-01-06").await;

    let sorted = fx
        .engine
        .data(
            "u1",
            "c1",
            &DataQuery {
                sort_by: Some("total_amount".into()),
                ..DataQuery::default()
            },
        )
        .await
        .unwrap();
    // Default sort order is descending.
    assert_eq!(sorted.data[0]["document"]["total_amount"], json!(300.0));

    let err = fx
        .engine
        .data(
            "u1",
            "c1",
            &DataQuery {
                sort_by: Some("nonexistent".into()),
                ..DataQuery::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::FIELD_UNSUPPORTED));

    let fx2 = fixture("Customers").await;
    let err = fx2
        .engine
        .data(
            "u1",
            "c1",
            &DataQuery {
                date_from: Some("2024-01-01".into()),
                ..DataQuery::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::FEATURE_UNSUPPORTED));
}

#[tokio::test]
async fn summary_is_cached_until_invalidated() {
    let store = Arc::new(MemStore::new());
    let repo = ConnectionRepo::new(store.clone());
    repo.create(&test_connection("c1", "u1", "Orders")).await.unwrap();
    let analytics_cache = AnalyticsCache::new(Arc::new(MemCache::new()));
    let engine = AnalyticsEngine::new(store.clone(), repo.clone(), analytics_cache.clone());

    let empty = engine.summary("u1", "c1", None, None).await.unwrap();
    assert_eq!(empty["total_count"], json!(0));

    // New data lands, but the cached summary is still served.
    store
        .insert_one(
            collections::SHEET_ROWS,
            json!({"connection_id": "c1", "row_number": 2, "document": {"total_amount": 50.0}}),
        )
        .await
        .unwrap();
    let cached = engine.summary("u1", "c1", None, None).await.unwrap();
    assert_eq!(cached["total_count"], json!(0));

    // Invalidation (what the crawler does post-sync) forces a recompute.
    analytics_cache.invalidate("c1").await;
    let fresh = engine.summary("u1", "c1", None, None).await.unwrap();
    assert_eq!(fresh["total_count"], json!(1));
}
