//! Sync queue boundary.
//!
//! The queue is a durable FIFO broker with at-least-once delivery:
//! dequeue hands out a task plus a receipt, and only an explicit ack
//! retires it. `MemQueue` implements the contract in-process for tests
//! and single-node deployments; a hosted broker mounts behind the same
//! trait.

use super::SyncTask;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A dequeued task with the receipt needed to ack it.
#[derive(Debug)]
pub struct Delivery {
    pub task: SyncTask,
    pub receipt: String,
}

#[async_trait]
pub trait SyncQueue: Send + Sync {
    async fn enqueue(&self, task: SyncTask) -> Result<()>;

    /// Blocking pop. Resolves when a task becomes available.
    async fn dequeue(&self) -> Result<Delivery>;

    /// Retire a delivery. Un-acked deliveries are eligible for redelivery.
    async fn ack(&self, receipt: &str) -> Result<()>;
}

pub struct MemQueue {
    tx: mpsc::UnboundedSender<SyncTask>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SyncTask>>,
    in_flight: Mutex<HashMap<String, SyncTask>>,
}

impl Default for MemQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of dequeued-but-unacked tasks. Test/diagnostic hook.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Push every un-acked delivery back onto the queue, oldest first.
    /// A broker does this automatically when a consumer dies.
    pub fn redeliver_unacked(&self) -> Result<()> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut tasks: Vec<SyncTask> = in_flight.drain().map(|(_, t)| t).collect();
        tasks.sort_by_key(|t| t.queued_at);
        for task in tasks {
            self.tx.send(task).context("queue receiver closed")?;
        }
        Ok(())
    }
}

#[async_trait]
impl SyncQueue for MemQueue {
    async fn enqueue(&self, task: SyncTask) -> Result<()> {
        self.tx.send(task).context("queue receiver closed")
    }

    async fn dequeue(&self) -> Result<Delivery> {
        let task = {
            let mut rx = self.rx.lock().await;
            rx.recv().await.context("queue closed")?
        };
        let receipt = Uuid::new_v4().to_string();
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(receipt.clone(), task.clone());
        Ok(Delivery { task, receipt })
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(receipt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_and_ack() {
        let queue = MemQueue::new();
        queue.enqueue(SyncTask::new("c1", "u1")).await.unwrap();
        queue.enqueue(SyncTask::new("c2", "u1")).await.unwrap();

        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.task.connection_id, "c1");
        assert_eq!(queue.in_flight_len(), 1);

        queue.ack(&first.receipt).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);

        let second = queue.dequeue().await.unwrap();
        assert_eq!(second.task.connection_id, "c2");
    }

    #[tokio::test]
    async fn unacked_tasks_are_redelivered() {
        let queue = MemQueue::new();
        queue.enqueue(SyncTask::new("c1", "u1")).await.unwrap();

        let delivery = queue.dequeue().await.unwrap();
        drop(delivery); // consumer died without acking

        queue.redeliver_unacked().unwrap();
        let again = queue.dequeue().await.unwrap();
        assert_eq!(again.task.connection_id, "c1");
    }

    #[tokio::test]
    async fn dequeue_blocks_until_enqueue() {
        let queue = std::sync::Arc::new(MemQueue::new());
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.dequeue().await.unwrap().task.connection_id });

        tokio::task::yield_now().await;
        queue.enqueue(SyncTask::new("c9", "u1")).await.unwrap();
        assert_eq!(waiter.await.unwrap(), "c9");
    }

    #[test]
    fn retry_increments_and_restamps() {
        let task = SyncTask::new("c1", "u1");
        let retried = task.retry();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.connection_id, "c1");
        assert!(retried.queued_at >= task.queued_at);
    }
}
