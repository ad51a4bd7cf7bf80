//! Message-bus seams and the in-memory bus.
//!
//! The bus client library is an external collaborator; only its contract
//! matters here. A consumer delivers partition-ordered records at least
//! once, each carrying the composite key
//! `"<uve-key>|<type>|<generator>|<collector>"` and an optional JSON value.
//! The producer side exists solely for the health probe, which produces to a
//! sentinel topic and requires a bounded flush acknowledgement.
//!
//! [`MemoryBus`] implements both sides over per-partition queues, for tests
//! and single-process runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::Value;

/// Bus failures, split by whether a reconnect can help.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("transient bus error: {0}")]
    Transient(String),
    /// File-descriptor exhaustion and friends; the process should exit and
    /// let the supervisor restart it.
    #[error("unrecoverable bus error: {0}")]
    Fatal(String),
}

/// One record read from a partition topic.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub offset: i64,
    /// `"<uve-key>|<type>|<generator>|<collector>"`.
    pub key: String,
    /// `None` withdraws the contribution; `Some({})` is a notification with
    /// the payload unchanged; anything else is the new payload.
    pub value: Option<Value>,
}

impl BusRecord {
    /// Splits the composite key into `(uve_key, type, generator, collector)`.
    #[must_use]
    pub fn split_key(&self) -> Option<(&str, &str, &str, &str)> {
        let mut it = self.key.split('|');
        let uve_key = it.next()?;
        let typ = it.next()?;
        let generator = it.next()?;
        let collector = it.next()?;
        if it.next().is_some() || uve_key.is_empty() || typ.is_empty() {
            return None;
        }
        Some((uve_key, typ, generator, collector))
    }
}

/// Consumer of one partition topic.
#[async_trait]
pub trait BusConsumer: Send {
    /// Polls up to `max_records` records, returning immediately with
    /// whatever is available.
    async fn poll(&mut self, max_records: usize) -> Result<Vec<BusRecord>, BusError>;
}

/// Creates consumers; one per owned partition, re-created after transient
/// failures.
pub trait BusConsumerFactory: Send + Sync {
    /// # Errors
    ///
    /// Transient errors are retried by the worker with backoff.
    fn create(&self, partition: u32) -> Result<Box<dyn BusConsumer>, BusError>;
}

/// Producer side, used only by the health probe.
#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn produce(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;
    /// Waits until all produced records are acknowledged.
    async fn flush(&self, timeout: Duration) -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PartitionQueue {
    records: Mutex<VecDeque<BusRecord>>,
    next_offset: AtomicI64,
}

/// In-memory bus with per-partition queues.
///
/// Tests publish with [`MemoryBus::publish`]; partitions can be marked down
/// to exercise the transient-error path, and the producer flush can be
/// forced to fail to exercise the health probe escalation.
#[derive(Default)]
pub struct MemoryBus {
    partitions: DashMap<u32, Arc<PartitionQueue>>,
    down: DashSet<u32>,
    flush_fails: AtomicBool,
    produced: DashMap<String, u64>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, partition: u32) -> Arc<PartitionQueue> {
        Arc::clone(&self.partitions.entry(partition).or_default())
    }

    /// Appends one record to a partition topic, assigning the next offset.
    pub fn publish(&self, partition: u32, key: &str, value: Option<Value>) {
        let q = self.queue(partition);
        let offset = q.next_offset.fetch_add(1, Ordering::SeqCst);
        q.records.lock().push_back(BusRecord {
            offset,
            key: key.to_string(),
            value,
        });
    }

    /// Marks a partition unreachable; polls return transient errors.
    pub fn set_down(&self, partition: u32, down: bool) {
        if down {
            self.down.insert(partition);
        } else {
            self.down.remove(&partition);
        }
    }

    /// Forces subsequent producer flushes to fail.
    pub fn fail_flushes(&self, fail: bool) {
        self.flush_fails.store(fail, Ordering::SeqCst);
    }

    /// Number of records produced to `topic` (health probe assertions).
    #[must_use]
    pub fn produced_count(&self, topic: &str) -> u64 {
        self.produced.get(topic).map_or(0, |c| *c)
    }
}

struct MemoryBusConsumer {
    partition: u32,
    bus: Arc<MemoryBus>,
    queue: Arc<PartitionQueue>,
}

#[async_trait]
impl BusConsumer for MemoryBusConsumer {
    async fn poll(&mut self, max_records: usize) -> Result<Vec<BusRecord>, BusError> {
        if self.bus.down.contains(&self.partition) {
            return Err(BusError::Transient(format!(
                "partition {} unreachable",
                self.partition
            )));
        }
        let mut records = self.queue.records.lock();
        let n = records.len().min(max_records);
        Ok(records.drain(..n).collect())
    }
}

impl BusConsumerFactory for Arc<MemoryBus> {
    fn create(&self, partition: u32) -> Result<Box<dyn BusConsumer>, BusError> {
        if self.down.contains(&partition) {
            return Err(BusError::Transient(format!(
                "partition {partition} unreachable"
            )));
        }
        Ok(Box::new(MemoryBusConsumer {
            partition,
            bus: Arc::clone(self),
            queue: self.queue(partition),
        }))
    }
}

#[async_trait]
impl BusProducer for MemoryBus {
    async fn produce(&self, topic: &str, _payload: &[u8]) -> Result<(), BusError> {
        *self.produced.entry(topic.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BusError> {
        if self.flush_fails.load(Ordering::SeqCst) {
            return Err(BusError::Transient("flush not acknowledged".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
