//! Durable, priority-ordered operation queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use edgesync_common::{Error, OperationId, Priority, Result};
use edgesync_storage::SnapshotStore;

use crate::version::SyncRecord;

/// Kind of deferred work. Each kind maps to one registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OperationKind {
    InferenceResultPush,
    ModelPush,
    ModelPull,
    ConfigPull,
    TelemetryUpload,
    /// Caller-defined kind.
    Custom(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::InferenceResultPush => "inference-result-push",
            Self::ModelPush => "model-push",
            Self::ModelPull => "model-pull",
            Self::ConfigPull => "config-pull",
            Self::TelemetryUpload => "telemetry-upload",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(Error::InvalidInput("Operation kind cannot be empty".to_string())),
            "inference-result-push" => Ok(Self::InferenceResultPush),
            "model-push" => Ok(Self::ModelPush),
            "model-pull" => Ok(Self::ModelPull),
            "config-pull" => Ok(Self::ConfigPull),
            "telemetry-upload" => Ok(Self::TelemetryUpload),
            other => Ok(Self::Custom(other.to_string())),
        }
    }
}

impl TryFrom<String> for OperationKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub priority: Priority,
    /// Opaque to the engine; handed to the handler as-is.
    pub payload: serde_json::Value,
    /// Record this operation transfers, if any. Used for conflict checks
    /// and written to the version tracker on success.
    #[serde(default)]
    pub record: Option<SyncRecord>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Not eligible for dequeue before this time (set by backoff).
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl QueuedOperation {
    pub fn new(
        kind: OperationKind,
        payload: serde_json::Value,
        priority: Priority,
        max_retries: u32,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            kind,
            priority,
            payload,
            record: None,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries,
            not_before: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach the record this operation transfers.
    pub fn with_record(mut self, record: SyncRecord) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the operation may be dequeued at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Transfer size used for throttling and scoring.
    pub fn payload_size(&self) -> u64 {
        match &self.record {
            Some(record) => record.size_bytes,
            None => serde_json::to_vec(&self.payload)
                .map(|v| v.len() as u64)
                .unwrap_or(0),
        }
    }

    /// Data kind used for scoring: the record's kind, else the operation kind.
    pub fn data_kind(&self) -> &str {
        match &self.record {
            Some(record) => &record.data_kind,
            None => self.kind.as_str(),
        }
    }
}

struct QueueInner {
    pending: VecDeque<QueuedOperation>,
    /// Handed out by `dequeue` but not yet acked or requeued. Still part
    /// of the durable snapshot.
    in_flight: Vec<QueuedOperation>,
}

impl QueueInner {
    fn total(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    fn snapshot(&self) -> Vec<QueuedOperation> {
        let mut ordered: Vec<QueuedOperation> = self.in_flight.clone();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        let mut ordered: VecDeque<QueuedOperation> = ordered.into();
        for op in &self.pending {
            insert_by_priority(&mut ordered, op.clone());
        }
        ordered.into()
    }
}

/// Stable priority insert: after every item of equal or higher priority.
fn insert_by_priority(list: &mut VecDeque<QueuedOperation>, op: QueuedOperation) {
    let pos = list
        .iter()
        .position(|existing| existing.priority < op.priority)
        .unwrap_or(list.len());
    list.insert(pos, op);
}

/// Bounded, priority-ordered queue persisted after every mutation.
pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    store: Arc<dyn SnapshotStore>,
    document: String,
    durability_degraded: AtomicBool,
}

impl OperationQueue {
    /// Open the queue, loading the persisted snapshot if one exists.
    ///
    /// Operations that were in flight when the snapshot was written are
    /// pending again.
    pub async fn open(
        store: Arc<dyn SnapshotStore>,
        document: impl Into<String>,
        capacity: usize,
    ) -> Result<Self> {
        let document = document.into();
        let loaded: Vec<QueuedOperation> = match store.load(&document).await? {
            None => Vec::new(),
            Some(content) => match serde_json::from_str(&content) {
                Ok(ops) => ops,
                Err(e) => {
                    error!("Queue snapshot {} is unreadable ({}); starting empty", document, e);
                    store.quarantine(&document).await?;
                    Vec::new()
                }
            },
        };

        if loaded.len() > capacity {
            warn!(
                "Queue snapshot holds {} operations, above capacity {}; keeping all",
                loaded.len(),
                capacity
            );
        }

        let mut pending = VecDeque::with_capacity(loaded.len());
        for op in loaded {
            insert_by_priority(&mut pending, op);
        }
        debug!("Loaded {} queued operations from {}", pending.len(), document);

        Ok(Self {
            inner: Mutex::new(QueueInner {
                pending,
                in_flight: Vec::new(),
            }),
            capacity,
            store,
            document,
            durability_degraded: AtomicBool::new(false),
        })
    }

    /// Insert `op` in priority order.
    ///
    /// # Errors
    /// - `QueueFull` when the queue is at capacity; the queue is untouched
    pub async fn enqueue(&self, op: QueuedOperation) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.total() >= self.capacity {
            warn!(
                "Queue at capacity ({}); rejecting {} operation {}",
                self.capacity, op.kind, op.id
            );
            return Err(Error::QueueFull(self.capacity));
        }

        debug!("Enqueued {} operation {} ({})", op.kind, op.id, op.priority);
        insert_by_priority(&mut inner.pending, op);
        self.persist_locked(&inner).await;
        Ok(())
    }

    /// Remove up to `n` operations from the head, regardless of backoff.
    pub async fn dequeue(&self, n: usize) -> Vec<QueuedOperation> {
        let mut inner = self.inner.lock().await;
        let take = n.min(inner.pending.len());
        let ops: Vec<QueuedOperation> = inner.pending.drain(..take).collect();
        if !ops.is_empty() {
            inner.in_flight.extend(ops.iter().cloned());
            self.persist_locked(&inner).await;
        }
        ops
    }

    /// Remove up to `n` operations that are due at `now`, in queue order.
    pub async fn dequeue_ready(&self, n: usize, now: DateTime<Utc>) -> Vec<QueuedOperation> {
        self.dequeue_ready_where(n, now, |_| true).await
    }

    /// Like `dequeue_ready`, but leaves operations rejected by `eligible`
    /// in place without counting them toward `n`.
    pub async fn dequeue_ready_where<F>(
        &self,
        n: usize,
        now: DateTime<Utc>,
        eligible: F,
    ) -> Vec<QueuedOperation>
    where
        F: Fn(&QueuedOperation) -> bool,
    {
        let mut inner = self.inner.lock().await;
        let mut ops = Vec::new();
        let mut idx = 0;
        while idx < inner.pending.len() && ops.len() < n {
            let op = &inner.pending[idx];
            if op.is_ready(now) && eligible(op) {
                if let Some(op) = inner.pending.remove(idx) {
                    ops.push(op);
                }
            } else {
                idx += 1;
            }
        }
        if !ops.is_empty() {
            inner.in_flight.extend(ops.iter().cloned());
            self.persist_locked(&inner).await;
        }
        ops
    }

    /// Read-only view of up to `n` head operations.
    pub async fn peek(&self, n: usize) -> Vec<QueuedOperation> {
        let inner = self.inner.lock().await;
        inner.pending.iter().take(n).cloned().collect()
    }

    /// Finish an in-flight operation (completed or dropped).
    pub async fn ack(&self, id: &OperationId) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.in_flight.len();
        inner.in_flight.retain(|op| &op.id != id);
        let removed = inner.in_flight.len() != before;
        if removed {
            self.persist_locked(&inner).await;
        }
        removed
    }

    /// Put an in-flight operation back, in priority position.
    ///
    /// The operation keeps the slot it held while in flight, so this
    /// never exceeds capacity.
    pub async fn requeue(&self, op: QueuedOperation) {
        let mut inner = self.inner.lock().await;
        inner.in_flight.retain(|existing| existing.id != op.id);
        insert_by_priority(&mut inner.pending, op);
        self.persist_locked(&inner).await;
    }

    /// Number of pending operations.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.pending.is_empty()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Full snapshot, including in-flight operations, in queue order.
    pub async fn snapshot(&self) -> Vec<QueuedOperation> {
        self.inner.lock().await.snapshot()
    }

    /// Write the snapshot to durable storage.
    pub async fn persist(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        let json = serde_json::to_string_pretty(&inner.snapshot())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        match self.store.save(&self.document, &json).await {
            Ok(()) => {
                self.durability_degraded.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.durability_degraded.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Whether the last write to durable storage failed.
    pub fn durability_degraded(&self) -> bool {
        self.durability_degraded.load(Ordering::SeqCst)
    }

    async fn persist_locked(&self, inner: &QueueInner) {
        let result = match serde_json::to_string_pretty(&inner.snapshot()) {
            Ok(json) => self.store.save(&self.document, &json).await,
            Err(e) => Err(Error::Serialization(e.to_string())),
        };

        match result {
            Ok(()) => self.durability_degraded.store(false, Ordering::SeqCst),
            Err(e) => {
                self.durability_degraded.store(true, Ordering::SeqCst);
                error!(
                    "DURABILITY DEGRADED: failed to persist queue {}: {}",
                    self.document, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use edgesync_common::{RecordId, Side};
    use edgesync_storage::MemorySnapshotStore;
    use proptest::prelude::*;

    fn op(priority: Priority, tag: &str) -> QueuedOperation {
        QueuedOperation::new(
            OperationKind::TelemetryUpload,
            serde_json::json!({ "tag": tag }),
            priority,
            3,
        )
    }

    fn tag(op: &QueuedOperation) -> String {
        op.payload["tag"].as_str().unwrap().to_string()
    }

    async fn queue(capacity: usize) -> (OperationQueue, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::new());
        let queue = OperationQueue::open(store.clone(), "queue.json", capacity)
            .await
            .unwrap();
        (queue, store)
    }

    #[test]
    fn test_operation_kind_names() {
        assert_eq!("config-pull".parse::<OperationKind>().unwrap(), OperationKind::ConfigPull);
        assert_eq!(
            "firmware-check".parse::<OperationKind>().unwrap(),
            OperationKind::Custom("firmware-check".to_string())
        );
        assert!("".parse::<OperationKind>().is_err());

        let json = serde_json::to_string(&OperationKind::ModelPush).unwrap();
        assert_eq!(json, "\"model-push\"");
    }

    #[tokio::test]
    async fn test_priority_scenario() {
        let (queue, _) = queue(10).await;
        queue.enqueue(op(Priority::Low, "low")).await.unwrap();
        queue.enqueue(op(Priority::Critical, "critical")).await.unwrap();
        queue.enqueue(op(Priority::Normal, "normal")).await.unwrap();

        let tags: Vec<String> = queue.dequeue(3).await.iter().map(tag).collect();
        assert_eq!(tags, vec!["critical", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let (queue, _) = queue(10).await;
        for t in ["a", "b", "c"] {
            queue.enqueue(op(Priority::High, t)).await.unwrap();
        }
        let tags: Vec<String> = queue.peek(3).await.iter().map(tag).collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_capacity_rejects_without_mutation() {
        let (queue, store) = queue(2).await;
        queue.enqueue(op(Priority::Low, "a")).await.unwrap();
        queue.enqueue(op(Priority::Low, "b")).await.unwrap();
        let saves = store.save_count();
        let before = queue.snapshot().await;

        assert!(matches!(
            queue.enqueue(op(Priority::Critical, "c")).await,
            Err(Error::QueueFull(_))
        ));
        assert_eq!(queue.snapshot().await, before);
        assert_eq!(store.save_count(), saves);
    }

    #[tokio::test]
    async fn test_in_flight_counts_toward_capacity() {
        let (queue, _) = queue(1).await;
        queue.enqueue(op(Priority::Low, "a")).await.unwrap();
        let taken = queue.dequeue(1).await;

        assert!(matches!(
            queue.enqueue(op(Priority::Low, "b")).await,
            Err(Error::QueueFull(_))
        ));
        queue.ack(&taken[0].id).await;
        queue.enqueue(op(Priority::Low, "b")).await.unwrap();
    }

    #[tokio::test]
    async fn test_peek_does_not_remove() {
        let (queue, _) = queue(10).await;
        queue.enqueue(op(Priority::Normal, "a")).await.unwrap();
        assert_eq!(queue.peek(5).await.len(), 1);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_durability_round_trip() {
        let (queue, store) = queue(10).await;
        let mut first = op(Priority::Normal, "with-record");
        first.record = Some(crate::version::SyncRecord::from_content(
            RecordId::new("r1").unwrap(),
            "model",
            Side::Edge,
            1,
            b"weights",
        ));
        queue.enqueue(first).await.unwrap();
        queue.enqueue(op(Priority::High, "b")).await.unwrap();
        queue.enqueue(op(Priority::Low, "c")).await.unwrap();
        queue.persist().await.unwrap();

        let reloaded = OperationQueue::open(store, "queue.json", 10).await.unwrap();
        assert_eq!(reloaded.snapshot().await, queue.snapshot().await);
    }

    #[tokio::test]
    async fn test_in_flight_survives_restart() {
        let (queue, store) = queue(10).await;
        queue.enqueue(op(Priority::High, "a")).await.unwrap();
        queue.enqueue(op(Priority::High, "b")).await.unwrap();
        let _taken = queue.dequeue(1).await;

        let reloaded = OperationQueue::open(store, "queue.json", 10).await.unwrap();
        let tags: Vec<String> = reloaded.peek(10).await.iter().map(tag).collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let (queue, _) = queue(10).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_requeue_after_ack_cycle() {
        let (queue, _) = queue(10).await;
        queue.enqueue(op(Priority::Normal, "a")).await.unwrap();
        queue.enqueue(op(Priority::Normal, "b")).await.unwrap();

        let mut taken = queue.dequeue(1).await;
        let mut failed = taken.remove(0);
        failed.retry_count += 1;
        queue.requeue(failed).await;

        assert_eq!(queue.in_flight_len().await, 0);
        let tags: Vec<String> = queue.peek(10).await.iter().map(tag).collect();
        assert_eq!(tags, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_dequeue_ready_skips_backoff() {
        let (queue, _) = queue(10).await;
        let now = Utc::now();
        let mut later = op(Priority::Critical, "later");
        later.not_before = Some(now + Duration::seconds(30));
        queue.enqueue(later).await.unwrap();
        queue.enqueue(op(Priority::Low, "now")).await.unwrap();

        let ready: Vec<String> = queue.dequeue_ready(10, now).await.iter().map(tag).collect();
        assert_eq!(ready, vec!["now"]);
        assert_eq!(queue.len().await, 1);

        let due = queue.dequeue_ready(10, now + Duration::seconds(31)).await;
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_ready_where_passes_over_ineligible() {
        let (queue, _) = queue(10).await;
        queue.enqueue(op(Priority::Critical, "blocked")).await.unwrap();
        queue.enqueue(op(Priority::Low, "free")).await.unwrap();

        let taken = queue
            .dequeue_ready_where(1, Utc::now(), |op| tag(op) != "blocked")
            .await;
        assert_eq!(taken.iter().map(tag).collect::<Vec<_>>(), vec!["free"]);

        let left: Vec<String> = queue.peek(10).await.iter().map(tag).collect();
        assert_eq!(left, vec!["blocked"]);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_quarantined() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.save("queue.json", "[{").await.unwrap();

        let queue = OperationQueue::open(store.clone(), "queue.json", 10).await.unwrap();
        assert!(queue.is_empty().await);
        assert_eq!(store.quarantined().await.len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_queue_in_memory() {
        let (queue, store) = queue(10).await;
        store.set_fail_writes(true);

        queue.enqueue(op(Priority::Normal, "a")).await.unwrap();
        assert!(queue.durability_degraded());
        assert_eq!(queue.len().await, 1);
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
    }

    proptest! {
        #[test]
        fn prop_dequeue_is_priority_ordered_and_stable(
            priorities in proptest::collection::vec(priority_strategy(), 0..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let drained = rt.block_on(async {
                let (queue, _) = queue(100).await;
                for (i, p) in priorities.iter().enumerate() {
                    queue.enqueue(op(*p, &i.to_string())).await.unwrap();
                }
                queue.dequeue(priorities.len()).await
            });

            prop_assert_eq!(drained.len(), priorities.len());
            for pair in drained.windows(2) {
                prop_assert!(pair[0].priority >= pair[1].priority);
                if pair[0].priority == pair[1].priority {
                    let a: usize = tag(&pair[0]).parse().unwrap();
                    let b: usize = tag(&pair[1]).parse().unwrap();
                    prop_assert!(a < b);
                }
            }
        }
    }
}
