//! Core sync engine that orchestrates queue draining, conflict handling
//! and transfers.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use edgesync_common::{Error, OperationId, Priority, Result};
use edgesync_storage::{LocalSnapshotStore, SnapshotStore};

use crate::bandwidth::BandwidthOptimizer;
use crate::config::SyncConfig;
use crate::conflict::{by_side, ConflictRecord, ConflictResolver, MergeFn};
use crate::connectivity::{ConnectivityMonitor, ConnectivityStatus, Probe};
use crate::handler::{HandlerRegistry, OperationHandler};
use crate::http::HttpProbe;
use crate::queue::{OperationKind, OperationQueue, QueuedOperation};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::{run_connectivity_loop, run_sync_loop, ReconnectSignal};
use crate::transfer::{RecordTransport, SyncDirection, SyncOperation};
use crate::version::{SyncRecord, VersionTracker};

/// Identifier returned by `submit_transfer`.
pub type TransferId = String;

/// Counters accumulated since the engine was constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub enqueued: u64,
    pub rejected: u64,
    pub completed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub manual_skips: u64,
    pub bytes_transferred: u64,
    pub batches: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    manual_skips: AtomicU64,
    bytes_transferred: AtomicU64,
    batches: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineCounters {
        EngineCounters {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            manual_skips: self.manual_skips.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub connectivity: ConnectivityStatus,
    /// Pending operations, excluding those currently being processed.
    pub queue_size: usize,
    pub in_flight: usize,
    pub consecutive_failures: u32,
    pub last_check_time: Option<DateTime<Utc>>,
    pub counters: EngineCounters,
    /// True while the last write of the queue or version map failed.
    pub durability_degraded: bool,
    pub pending_conflicts: usize,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
}

/// An operation that will never be attempted again.
#[derive(Debug, Clone, Serialize)]
pub struct DroppedOperation {
    pub operation: QueuedOperation,
    pub reason: String,
    pub dropped_at: DateTime<Utc>,
}

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub completed: usize,
    pub retried: usize,
    pub dropped: usize,
    /// Skipped pending manual conflict resolution.
    pub skipped: usize,
    pub conflicts_resolved: usize,
    pub duration: Duration,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0
    }
}

enum Outcome {
    Completed { conflict_resolved: bool },
    Retried,
    Dropped,
    Skipped,
}

struct Runtime {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started_at: DateTime<Utc>,
}

struct EngineInner {
    config: SyncConfig,
    monitor: Arc<ConnectivityMonitor>,
    queue: OperationQueue,
    tracker: VersionTracker,
    resolver: Mutex<ConflictResolver>,
    handlers: RwLock<HandlerRegistry>,
    optimizer: BandwidthOptimizer,
    retry: RetryPolicy,
    /// Bounds concurrent handler invocations and transfers.
    permits: Semaphore,
    /// Serializes throttling sleeps so the cap holds across a batch.
    throttle: Mutex<()>,
    /// One sync pass at a time, whether from the loop or `sync_once`.
    pass_lock: Mutex<()>,
    counters: Counters,
    dropped: Mutex<VecDeque<DroppedOperation>>,
    transport: Option<Arc<dyn RecordTransport>>,
    transfers: RwLock<HashMap<TransferId, SyncOperation>>,
    transfer_tasks: Mutex<Vec<JoinHandle<()>>>,
    signal: Arc<ReconnectSignal>,
}

/// Builder for [`SyncEngine`].
///
/// Without an explicit probe the engine probes over HTTP; without an
/// explicit store it persists under `config.state_dir`.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    probe: Option<Arc<dyn Probe>>,
    store: Option<Arc<dyn SnapshotStore>>,
    merge_fn: Option<MergeFn>,
    transport: Option<Arc<dyn RecordTransport>>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            probe: None,
            store: None,
            merge_fn: None,
            transport: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Merge callback used by the `merge` conflict strategy.
    pub fn with_merge_fn(mut self, merge_fn: MergeFn) -> Self {
        self.merge_fn = Some(merge_fn);
        self
    }

    /// Transport used by `submit_transfer`.
    pub fn with_transport(mut self, transport: Arc<dyn RecordTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validate the configuration and load durable state.
    pub async fn build(self) -> Result<SyncEngine> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn SnapshotStore> = match self.store {
            Some(store) => store,
            None => Arc::new(LocalSnapshotStore::new(&config.state_dir)?),
        };
        let probe: Arc<dyn Probe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpProbe::new()?),
        };

        let queue =
            OperationQueue::open(store.clone(), config.queue_file.clone(), config.queue_capacity)
                .await?;
        let tracker = VersionTracker::open(store.clone(), config.versions_file.clone()).await?;

        let mut resolver = ConflictResolver::new(config.conflict_strategy);
        if let Some(merge_fn) = self.merge_fn {
            resolver = resolver.with_merge_fn(merge_fn);
        }

        let monitor = Arc::new(ConnectivityMonitor::new(
            config.endpoints.clone(),
            probe,
            config.probe_timeout(),
            config.history_limit,
        ));
        let retry = RetryPolicy::new(config.max_retries)
            .with_backoff_base(config.backoff_base)
            .with_max_delay(config.max_backoff());

        info!(
            "Sync engine ready: store {}, {} queued operations, {} tracked records",
            store.name(),
            queue.len().await,
            tracker.len().await
        );

        let inner = EngineInner {
            monitor,
            queue,
            tracker,
            resolver: Mutex::new(resolver),
            handlers: RwLock::new(HandlerRegistry::new()),
            optimizer: BandwidthOptimizer::from_config(&config),
            retry,
            permits: Semaphore::new(config.max_in_flight),
            throttle: Mutex::new(()),
            pass_lock: Mutex::new(()),
            counters: Counters::default(),
            dropped: Mutex::new(VecDeque::new()),
            transport: self.transport,
            transfers: RwLock::new(HashMap::new()),
            transfer_tasks: Mutex::new(Vec::new()),
            signal: Arc::new(ReconnectSignal::new()),
            config,
        };

        Ok(SyncEngine {
            inner: Arc::new(inner),
            runtime: Mutex::new(None),
        })
    }
}

/// Offline-tolerant sync engine.
///
/// Owned by its caller; nothing is process-global. Background loops run
/// between `start` and `stop`; `sync_once` drives a pass directly.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    runtime: Mutex<Option<Runtime>>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    /// Create an engine with an explicit probe and store.
    pub async fn new(
        config: SyncConfig,
        probe: Arc<dyn Probe>,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        Self::builder(config)
            .with_probe(probe)
            .with_store(store)
            .build()
            .await
    }

    /// Create an engine that probes over HTTP and persists to disk.
    pub async fn open(config: SyncConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Queue work for later execution.
    ///
    /// Returns `None` if the queue is at capacity.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Option<OperationId> {
        let op = QueuedOperation::new(kind, payload, priority, self.inner.config.max_retries);
        self.enqueue_operation(op).await
    }

    /// Queue a fully built operation (e.g. one carrying a record).
    pub async fn enqueue_operation(&self, op: QueuedOperation) -> Option<OperationId> {
        let id = op.id.clone();
        match self.inner.queue.enqueue(op).await {
            Ok(()) => {
                Counters::bump(&self.inner.counters.enqueued);
                Some(id)
            }
            Err(e) => {
                debug!("Operation {} rejected: {}", id, e);
                Counters::bump(&self.inner.counters.rejected);
                None
            }
        }
    }

    /// Register the handler for `kind`.
    ///
    /// # Errors
    /// - `AlreadyExists` if `kind` already has a handler
    pub async fn register_handler<H>(&self, kind: OperationKind, handler: H) -> Result<()>
    where
        H: OperationHandler + 'static,
    {
        self.inner
            .handlers
            .write()
            .await
            .register(kind, Arc::new(handler))
    }

    pub fn is_online(&self) -> bool {
        self.inner.monitor.status() == ConnectivityStatus::Online
    }

    /// Probe connectivity now, outside the background loop.
    pub async fn check_connectivity(&self) -> ConnectivityStatus {
        self.inner.monitor.check_connectivity().await
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.inner.monitor
    }

    pub async fn get_status(&self) -> EngineStatus {
        let inner = &self.inner;
        let started_at = self.runtime.lock().await.as_ref().map(|rt| rt.started_at);
        EngineStatus {
            connectivity: inner.monitor.status(),
            queue_size: inner.queue.len().await,
            in_flight: inner.queue.in_flight_len().await,
            consecutive_failures: inner.monitor.consecutive_failures().await,
            last_check_time: inner.monitor.last_check_time().await,
            counters: inner.counters.snapshot(),
            durability_degraded: inner.queue.durability_degraded()
                || inner.tracker.durability_degraded(),
            pending_conflicts: inner.resolver.lock().await.pending_conflicts().len(),
            running: started_at.is_some(),
            started_at,
        }
    }

    /// Spawn the connectivity and sync loops.
    ///
    /// Calling `start` on a running engine does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            warn!("Sync engine already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let config = &self.inner.config;

        let connectivity = tokio::spawn(run_connectivity_loop(
            self.inner.monitor.clone(),
            config.probe_interval(),
            self.inner.signal.clone(),
            cancel.clone(),
        ));

        let inner = self.inner.clone();
        let sync = tokio::spawn(run_sync_loop(
            config.sync_interval(),
            self.inner.signal.clone(),
            cancel.clone(),
            move || {
                let inner = inner.clone();
                async move {
                    inner.run_pass().await;
                }
            },
        ));

        *runtime = Some(Runtime {
            cancel,
            tasks: vec![connectivity, sync],
            started_at: Utc::now(),
        });
        info!(
            "Sync engine started: {} endpoints, probe every {:?}, sync every {:?}",
            config.endpoints.len(),
            config.probe_interval(),
            config.sync_interval()
        );
        Ok(())
    }

    /// Stop the background loops and flush durable state.
    ///
    /// A sync pass already under way finishes first. The queue and version
    /// map are written even if the engine was never started.
    pub async fn stop(&self) -> Result<()> {
        let runtime = self.runtime.lock().await.take();
        if let Some(runtime) = runtime {
            runtime.cancel.cancel();
            for task in runtime.tasks {
                if let Err(e) = task.await {
                    error!("Background task ended abnormally: {}", e);
                }
            }
            info!("Sync engine stopped");
        }

        let transfers: Vec<JoinHandle<()>> =
            self.inner.transfer_tasks.lock().await.drain(..).collect();
        for task in transfers {
            if let Err(e) = task.await {
                error!("Transfer task ended abnormally: {}", e);
            }
        }

        let queue = self.inner.queue.persist().await;
        if let Err(e) = &queue {
            error!("DURABILITY DEGRADED: final queue flush failed: {}", e);
        }
        let versions = self.inner.tracker.persist().await;
        if let Err(e) = &versions {
            error!("DURABILITY DEGRADED: final version map flush failed: {}", e);
        }
        queue.and(versions)
    }

    /// Run one sync pass now. A no-op unless connectivity is Online.
    pub async fn sync_once(&self) -> BatchReport {
        self.inner.run_pass().await
    }

    /// Conflicts waiting for a manual winner, oldest first.
    pub async fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.resolver.lock().await.pending_conflicts()
    }

    /// Supply the winner of a manual conflict. It is applied on the next
    /// pass that reaches the affected record.
    pub async fn resolve_conflict_manually(
        &self,
        conflict_id: &str,
        winner: SyncRecord,
    ) -> Result<ConflictRecord> {
        self.inner
            .resolver
            .lock()
            .await
            .resolve_manually(conflict_id, winner)
    }

    /// Operations dropped after exhausting retries or lacking a handler,
    /// oldest first.
    pub async fn dropped_operations(&self) -> Vec<DroppedOperation> {
        self.inner.dropped.lock().await.iter().cloned().collect()
    }

    /// Tracked record versions.
    pub async fn tracked_records(&self) -> Vec<SyncRecord> {
        self.inner.tracker.records().await
    }

    /// Start a direct batch transfer of `records`.
    ///
    /// The transfer runs in the background; poll it with
    /// `transfer_status`. When the engine is not online it is failed
    /// immediately.
    ///
    /// # Errors
    /// - `Config` if no record transport was configured
    pub async fn submit_transfer(
        &self,
        direction: SyncDirection,
        data_kind: impl Into<String>,
        records: Vec<SyncRecord>,
    ) -> Result<TransferId> {
        if self.inner.transport.is_none() {
            return Err(Error::Config("No record transport configured".to_string()));
        }

        let mut transfer = SyncOperation::new(direction, data_kind, records);
        let id = transfer.id.clone();

        if !self.is_online() {
            transfer.fail("offline")?;
            warn!("Transfer {} failed: engine is offline", id);
            self.inner.transfers.write().await.insert(id.clone(), transfer);
            return Ok(id);
        }

        debug!(
            "Transfer {} submitted: {} {:?} records, {} bytes",
            id,
            transfer.records.len(),
            transfer.direction,
            transfer.bytes_total
        );
        self.inner.transfers.write().await.insert(id.clone(), transfer);

        let inner = self.inner.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move { inner.execute_transfer(&task_id).await });

        let mut tasks = self.inner.transfer_tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(id)
    }

    pub async fn transfer_status(&self, id: &str) -> Option<SyncOperation> {
        self.inner.transfers.read().await.get(id).cloned()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.cancel.cancel();
        }
    }
}

impl EngineInner {
    async fn run_pass(&self) -> BatchReport {
        let _pass = self.pass_lock.lock().await;
        let started = Instant::now();
        let mut report = BatchReport::default();

        let status = self.monitor.status();
        if status != ConnectivityStatus::Online {
            debug!("Skipping sync pass: connectivity is {}", status);
            return report;
        }

        // Operations still waiting on a manual winner stay queued without
        // taking batch slots from other work.
        let now = Utc::now();
        let resolver = self.resolver.lock().await;
        let batch = self
            .queue
            .dequeue_ready_where(self.config.batch_size, now, |op| {
                op.record
                    .as_ref()
                    .map_or(true, |record| !resolver.awaits_manual(record))
            })
            .await;
        drop(resolver);
        if batch.is_empty() {
            return report;
        }
        let batch = self.optimizer.order_batch(batch, now);
        report.attempted = batch.len();

        let outcomes = join_all(batch.into_iter().map(|op| self.process(op))).await;
        for outcome in outcomes {
            match outcome {
                Outcome::Completed { conflict_resolved } => {
                    report.completed += 1;
                    if conflict_resolved {
                        report.conflicts_resolved += 1;
                    }
                }
                Outcome::Retried => report.retried += 1,
                Outcome::Dropped => report.dropped += 1,
                Outcome::Skipped => report.skipped += 1,
            }
        }

        if let Err(e) = self.queue.persist().await {
            error!("DURABILITY DEGRADED: failed to persist queue after batch: {}", e);
        }
        Counters::bump(&self.counters.batches);
        report.duration = started.elapsed();

        info!(
            "Sync batch: {} attempted, {} completed, {} retried, {} dropped, {} skipped in {:?}",
            report.attempted,
            report.completed,
            report.retried,
            report.dropped,
            report.skipped,
            report.duration
        );
        report
    }

    async fn process(&self, mut op: QueuedOperation) -> Outcome {
        let handler = self.handlers.read().await.get(&op.kind);
        let Some(handler) = handler else {
            warn!(
                "No handler registered for {}; dropping operation {}",
                op.kind, op.id
            );
            let reason = format!("no handler registered for {}", op.kind);
            self.drop_operation(op, reason).await;
            return Outcome::Dropped;
        };

        let mut conflict_resolved = false;
        if let Some(incoming) = op.record.clone() {
            match self.reconcile(incoming).await {
                Ok((record, resolved)) => {
                    op.record = Some(record);
                    conflict_resolved = resolved;
                }
                Err(Error::ManualResolutionRequired(record_id)) => {
                    info!(
                        "Skipping operation {}: record {} awaits manual resolution",
                        op.id, record_id
                    );
                    Counters::bump(&self.counters.manual_skips);
                    self.queue.requeue(op).await;
                    return Outcome::Skipped;
                }
                Err(e) => return self.on_failure(op, e).await,
            }
        }

        let bytes = op.payload_size();
        {
            let _throttle = self.throttle.lock().await;
            self.optimizer.throttle(bytes).await;
        }

        let result = match self.permits.acquire().await {
            Ok(_permit) => {
                let timeout = self.config.handler_timeout();
                match tokio::time::timeout(timeout, handler.handle(&op)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "{} handler exceeded {:?}",
                        op.kind, timeout
                    ))),
                }
            }
            Err(e) => Err(Error::Handler(format!("Handler pool closed: {}", e))),
        };

        match result {
            Ok(()) => {
                if let Some(record) = &op.record {
                    self.accept(record.clone()).await;
                }
                self.queue.ack(&op.id).await;
                Counters::bump(&self.counters.completed);
                self.counters
                    .bytes_transferred
                    .fetch_add(bytes, Ordering::Relaxed);
                debug!("Operation {} ({}) completed", op.id, op.kind);
                Outcome::Completed { conflict_resolved }
            }
            Err(e) => self.on_failure(op, e).await,
        }
    }

    async fn on_failure(&self, mut op: QueuedOperation, err: Error) -> Outcome {
        match self.retry.on_failure(&mut op, Utc::now()) {
            RetryDecision::Retry { attempt, delay, .. } => {
                warn!(
                    "Operation {} ({}) failed: {}; retry {}/{} in {:?}",
                    op.id, op.kind, err, attempt, op.max_retries, delay
                );
                Counters::bump(&self.counters.retried);
                self.queue.requeue(op).await;
                Outcome::Retried
            }
            RetryDecision::Exhausted => {
                error!(
                    "Operation {} ({}) dropped after {} retries: {}",
                    op.id, op.kind, op.retry_count, err
                );
                self.drop_operation(op, err.to_string()).await;
                Outcome::Dropped
            }
        }
    }

    async fn drop_operation(&self, op: QueuedOperation, reason: String) {
        self.queue.ack(&op.id).await;
        Counters::bump(&self.counters.dropped);

        let mut dropped = self.dropped.lock().await;
        dropped.push_back(DroppedOperation {
            operation: op,
            reason,
            dropped_at: Utc::now(),
        });
        while dropped.len() > self.config.dropped_history_limit {
            dropped.pop_front();
        }
    }

    /// Check `incoming` against the tracked record of the other side.
    ///
    /// Returns the record to accept and whether a conflict was resolved.
    async fn reconcile(&self, incoming: SyncRecord) -> Result<(SyncRecord, bool)> {
        let Some(tracked) = self.tracker.get_version(&incoming.record_id).await else {
            return Ok((incoming, false));
        };
        let Some((edge, cloud)) = by_side(&incoming, &tracked) else {
            return Ok((incoming, false));
        };
        if !VersionTracker::has_conflict(edge, cloud) {
            return Ok((incoming, false));
        }

        let mut resolver = self.resolver.lock().await;
        let known = resolver.find(edge, cloud).is_some();
        let Some(conflict) = resolver.detect_conflict(edge, cloud) else {
            return Ok((incoming, false));
        };
        if !known {
            Counters::bump(&self.counters.conflicts_detected);
        }

        let winner = resolver.resolve_conflict(&conflict)?;
        Counters::bump(&self.counters.conflicts_resolved);
        info!(
            "Conflict on {} resolved: {} v{} wins",
            winner.record_id, winner.origin, winner.version
        );
        Ok((winner, true))
    }

    /// Make `record` the tracked version and drop conflicts it settles.
    async fn accept(&self, record: SyncRecord) {
        self.resolver.lock().await.retire_stale(&record);
        self.tracker.update_version(record).await;
    }

    async fn execute_transfer(&self, id: &str) {
        let (direction, data_kind, records) = {
            let mut transfers = self.transfers.write().await;
            let Some(transfer) = transfers.get_mut(id) else {
                return;
            };
            if let Err(e) = transfer.start() {
                warn!("Cannot start transfer {}: {}", id, e);
                return;
            }
            (
                transfer.direction,
                transfer.data_kind.clone(),
                transfer.records.clone(),
            )
        };

        let result = self.run_transfer(id, direction, &data_kind, &records).await;

        let mut transfers = self.transfers.write().await;
        if let Some(transfer) = transfers.get_mut(id) {
            let finished = match &result {
                Ok(()) => transfer.complete(),
                Err(e) => transfer.fail(e.to_string()),
            };
            if let Err(e) = finished {
                warn!("Transfer {} could not be finalized: {}", id, e);
            }
            match result {
                Ok(()) => info!(
                    "Transfer {} completed: {} bytes",
                    id, transfer.bytes_transferred
                ),
                Err(e) => warn!("Transfer {} failed: {}", id, e),
            }
        }
    }

    async fn run_transfer(
        &self,
        id: &str,
        direction: SyncDirection,
        data_kind: &str,
        records: &[SyncRecord],
    ) -> Result<()> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| Error::Config("No record transport configured".to_string()))?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::Handler(format!("Handler pool closed: {}", e)))?;

        for record in records {
            if direction.pushes() {
                {
                    let _throttle = self.throttle.lock().await;
                    self.optimizer.throttle(record.size_bytes).await;
                }
                let (accepted, _) = self.reconcile(record.clone()).await?;
                transport.push(&accepted).await?;
                self.accept(accepted).await;
                self.record_progress(id, record.size_bytes).await;
            }

            if direction.pulls() {
                if let Some(remote) = transport.fetch(data_kind, &record.record_id).await? {
                    let size = remote.size_bytes;
                    let (accepted, _) = self.reconcile(remote).await?;
                    self.accept(accepted).await;
                    self.record_progress(id, size).await;
                }
            }
        }
        Ok(())
    }

    async fn record_progress(&self, id: &str, bytes: u64) {
        self.counters
            .bytes_transferred
            .fetch_add(bytes, Ordering::Relaxed);
        if let Some(transfer) = self.transfers.write().await.get_mut(id) {
            transfer.record_progress(bytes);
        }
    }
}
