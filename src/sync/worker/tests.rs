use super::*;
use crate::analytics::AnalyticsCache;
use crate::cache::MemCache;
use crate::connections::{ConnectionRepo, test_connection};
use crate::notify::{LocalNotifier, RecordingTransport};
use crate::sheets::{SheetMetadata, SheetSource};
use crate::store::MemStore;
use crate::sync::{MemQueue, SyncTask};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Sheet source that fails a configurable number of times, then serves
/// one data row. Tracks concurrent `values` calls to prove serialization.
struct FlakySheets {
    failures_left: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
}

impl FlakySheets {
    fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SheetSource for FlakySheets {
    async fn metadata(&self, _sheet_id: &str) -> anyhow::Result<SheetMetadata> {
        Ok(SheetMetadata {
            title: "Stub".into(),
            tabs: vec!["Orders".into()],
        })
    }

    async fn values(&self, _s: &str, _t: &str, start_row: u32) -> anyhow::Result<Vec<Vec<String>>> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("quota exceeded");
        }
        if start_row > 2 {
            return Ok(vec![]);
        }
        let mut row = vec![String::new(); 16];
        row[0] = "O1".into();
        row[2] = "Shopee".into();
        row[15] = "100".into();
        Ok(vec![row])
    }

    async fn check_access(&self, _sheet_id: &str) -> bool {
        true
    }
}

struct Fixture {
    queue: Arc<MemQueue>,
    worker: Arc<SyncWorker>,
    sheets: Arc<FlakySheets>,
    transport: Arc<RecordingTransport>,
}

async fn fixture(sheets: FlakySheets, connections: &[(&str, &str)]) -> Fixture {
    let store = Arc::new(MemStore::new());
    let repo = ConnectionRepo::new(store.clone());
    for (id, user) in connections {
        repo.create(&test_connection(id, user, "Orders")).await.unwrap();
    }
    let sheets = Arc::new(sheets);
    let transport = Arc::new(RecordingTransport::default());
    let crawler = Arc::new(CrawlerService::new(
        repo,
        sheets.clone(),
        Arc::new(LocalNotifier::new(transport.clone())),
        AnalyticsCache::new(Arc::new(MemCache::new())),
    ));
    let queue = Arc::new(MemQueue::new());
    let worker = Arc::new(SyncWorker::new(
        queue.clone(),
        Arc::new(RateLimiter::with_defaults(1.0)),
        crawler,
    ));
    Fixture {
        queue,
        worker,
        sheets,
        transport,
    }
}

#[tokio::test]
async fn success_acks_and_leaves_queue_empty() {
    let fx = fixture(FlakySheets::new(0), &[("c1", "u1")]).await;
    fx.queue.enqueue(SyncTask::new("c1", "u1")).await.unwrap();

    let delivery = fx.queue.dequeue().await.unwrap();
    fx.worker.process(delivery).await;

    assert_eq!(fx.queue.in_flight_len(), 0);
    assert_eq!(
        fx.transport.event_names(),
        vec!["sheet:sync:started", "sheet:sync:completed"]
    );
}

#[tokio::test]
async fn retryable_failure_requeues_with_incremented_count() {
    let fx = fixture(FlakySheets::new(1), &[("c1", "u1")]).await;
    fx.queue.enqueue(SyncTask::new("c1", "u1")).await.unwrap();

    let delivery = fx.queue.dequeue().await.unwrap();
    fx.worker.process(delivery).await;

    // The failed attempt was acked and a retry enqueued.
    assert_eq!(fx.queue.in_flight_len(), 0);
    let retry = fx.queue.dequeue().await.unwrap();
    assert_eq!(retry.task.retry_count, 1);
    assert_eq!(retry.task.connection_id, "c1");

    // The retry succeeds (only one failure was scripted).
    fx.worker.process(retry).await;
    let names = fx.transport.event_names();
    assert_eq!(
        names,
        vec![
            "sheet:sync:started",
            "sheet:sync:failed",
            "sheet:sync:started",
            "sheet:sync:completed",
        ]
    );
}

#[tokio::test]
async fn retries_stop_at_cap() {
    let fx = fixture(FlakySheets::new(usize::MAX), &[("c1", "u1")]).await;
    fx.queue.enqueue(SyncTask::new("c1", "u1")).await.unwrap();

    // Initial attempt + 3 retries, then the chain ends.
    for _ in 0..4 {
        let delivery = fx.queue.dequeue().await.unwrap();
        fx.worker.process(delivery).await;
    }
    assert_eq!(fx.queue.in_flight_len(), 0);

    // No fifth task was enqueued.
    let empty = tokio::time::timeout(Duration::from_millis(50), fx.queue.dequeue()).await;
    assert!(empty.is_err());

    // Every attempt produced its started/failed pair.
    let names = fx.transport.event_names();
    assert_eq!(names.len(), 8);
    assert_eq!(
        names.iter().filter(|n| *n == "sheet:sync:failed").count(),
        4
    );
}

#[tokio::test]
async fn missing_connection_is_acked_and_dropped() {
    let fx = fixture(FlakySheets::new(0), &[]).await;
    fx.queue.enqueue(SyncTask::new("ghost", "u1")).await.unwrap();

    let delivery = fx.queue.dequeue().await.unwrap();
    fx.worker.process(delivery).await;

    assert_eq!(fx.queue.in_flight_len(), 0);
    assert!(fx.transport.events().is_empty());
    let empty = tokio::time::timeout(Duration::from_millis(50), fx.queue.dequeue()).await;
    assert!(empty.is_err(), "missing connection must not be retried");
}

#[tokio::test]
async fn same_connection_tasks_never_overlap() {
    let fx = fixture(
        FlakySheets::new(0).with_delay(Duration::from_millis(30)),
        &[("c1", "u1")],
    )
    .await;

    for _ in 0..3 {
        fx.queue.enqueue(SyncTask::new("c1", "u1")).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..3 {
        let worker = fx.worker.clone();
        let delivery = fx.queue.dequeue().await.unwrap();
        handles.push(tokio::spawn(async move { worker.process(delivery).await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(fx.sheets.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_drains_the_in_flight_sync() {
    let fx = fixture(
        FlakySheets::new(0).with_delay(Duration::from_millis(40)),
        &[("c1", "u1")],
    )
    .await;
    fx.queue.enqueue(SyncTask::new("c1", "u1")).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(fx.worker.clone().run_until(shutdown_rx));

    // Let the worker pick up the task, then request shutdown mid-sync.
    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // The in-flight attempt ran to its terminal event and was acked.
    assert_eq!(
        fx.transport.event_names(),
        vec!["sheet:sync:started", "sheet:sync:completed"]
    );
    assert_eq!(fx.queue.in_flight_len(), 0);
}

#[tokio::test]
async fn different_connections_may_run_concurrently() {
    let fx = fixture(
        FlakySheets::new(0).with_delay(Duration::from_millis(30)),
        &[("c1", "u1"), ("c2", "u2")],
    )
    .await;

    fx.queue.enqueue(SyncTask::new("c1", "u1")).await.unwrap();
    fx.queue.enqueue(SyncTask::new("c2", "u2")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let worker = fx.worker.clone();
        let delivery = fx.queue.dequeue().await.unwrap();
        handles.push(tokio::spawn(async move { worker.process(delivery).await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(fx.sheets.max_active.load(Ordering::SeqCst) >= 2);
}
