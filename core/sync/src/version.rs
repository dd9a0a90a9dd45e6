//! Version tracking and persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

use edgesync_common::{content_hash, Error, RecordId, Result, Side};
use edgesync_storage::SnapshotStore;

/// Versioned description of one data item as known by one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub record_id: RecordId,
    /// Kind of data (e.g. "model", "telemetry").
    pub data_kind: String,
    pub origin: Side,
    pub content_hash: String,
    /// Monotonically increasing per side.
    pub version: u64,
    pub modified_at: DateTime<Utc>,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SyncRecord {
    /// Describe `content` as version `version` of `record_id` on `origin`.
    pub fn from_content(
        record_id: RecordId,
        data_kind: impl Into<String>,
        origin: Side,
        version: u64,
        content: &[u8],
    ) -> Self {
        Self {
            record_id,
            data_kind: data_kind.into(),
            origin,
            content_hash: content_hash(content),
            version,
            modified_at: Utc::now(),
            size_bytes: content.len() as u64,
            metadata: HashMap::new(),
        }
    }

    /// Override the modification time.
    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = modified_at;
        self
    }

    /// Whether both sides hold identical content.
    pub fn has_converged_with(&self, other: &SyncRecord) -> bool {
        self.content_hash == other.content_hash
    }
}

/// Ledger of the most recently accepted record per identity.
///
/// The full map is persisted after every mutation. A failed write is
/// logged and latched in `durability_degraded`; the in-memory map stays
/// authoritative for the current run.
pub struct VersionTracker {
    records: RwLock<BTreeMap<RecordId, SyncRecord>>,
    store: Arc<dyn SnapshotStore>,
    document: String,
    durability_degraded: AtomicBool,
}

impl VersionTracker {
    /// Open the tracker, loading the persisted map if one exists.
    ///
    /// A missing document is an empty map. An unreadable document is
    /// quarantined and also treated as empty.
    pub async fn open(store: Arc<dyn SnapshotStore>, document: impl Into<String>) -> Result<Self> {
        let document = document.into();
        let records = match store.load(&document).await? {
            None => BTreeMap::new(),
            Some(content) => match serde_json::from_str(&content) {
                Ok(records) => records,
                Err(e) => {
                    error!("Version map {} is unreadable ({}); starting empty", document, e);
                    store.quarantine(&document).await?;
                    BTreeMap::new()
                }
            },
        };

        debug!("Loaded {} tracked versions from {}", records.len(), document);

        Ok(Self {
            records: RwLock::new(records),
            store,
            document,
            durability_degraded: AtomicBool::new(false),
        })
    }

    /// Last accepted record for `id`, if any.
    pub async fn get_version(&self, id: &RecordId) -> Option<SyncRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Accept `record` as the authoritative version for its identity.
    pub async fn update_version(&self, record: SyncRecord) {
        let mut records = self.records.write().await;
        records.insert(record.record_id.clone(), record);
        self.persist_locked(&records).await;
    }

    /// Stop tracking `id`.
    pub async fn remove(&self, id: &RecordId) -> Option<SyncRecord> {
        let mut records = self.records.write().await;
        let removed = records.remove(id);
        if removed.is_some() {
            self.persist_locked(&records).await;
        }
        removed
    }

    /// Divergence rule: versions differ and hashes differ.
    ///
    /// Identical hashes under different versions have already converged.
    pub fn has_conflict(a: &SyncRecord, b: &SyncRecord) -> bool {
        a.version != b.version && a.content_hash != b.content_hash
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Snapshot of all tracked records, ordered by id.
    pub async fn records(&self) -> Vec<SyncRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Write the full map to durable storage.
    pub async fn persist(&self) -> Result<()> {
        let records = self.records.read().await;
        let json = serde_json::to_string_pretty(&*records)
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

    async fn persist_locked(&self, records: &BTreeMap<RecordId, SyncRecord>) {
        let result = match serde_json::to_string_pretty(records) {
            Ok(json) => self.store.save(&self.document, &json).await,
            Err(e) => Err(Error::Serialization(e.to_string())),
        };

        match result {
            Ok(()) => self.durability_degraded.store(false, Ordering::SeqCst),
            Err(e) => {
                self.durability_degraded.store(true, Ordering::SeqCst);
                error!(
                    "DURABILITY DEGRADED: failed to persist version map {}: {}",
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
    use edgesync_storage::MemorySnapshotStore;

    fn record(id: &str, side: Side, version: u64, content: &[u8]) -> SyncRecord {
        SyncRecord::from_content(RecordId::new(id).unwrap(), "model", side, version, content)
    }

    #[test]
    fn test_conflict_requires_version_and_hash_difference() {
        let a = record("x", Side::Edge, 2, b"a");
        let b = record("x", Side::Cloud, 3, b"b");
        assert!(VersionTracker::has_conflict(&a, &b));

        let same_hash = record("x", Side::Cloud, 3, b"a");
        assert!(!VersionTracker::has_conflict(&a, &same_hash));

        let same_version = record("x", Side::Cloud, 2, b"b");
        assert!(!VersionTracker::has_conflict(&a, &same_version));
    }

    #[test]
    fn test_with_modified_at() {
        let ts = Utc::now() - Duration::hours(1);
        let r = record("x", Side::Edge, 1, b"a").with_modified_at(ts);
        assert_eq!(r.modified_at, ts);
    }

    #[tokio::test]
    async fn test_update_and_get() {
        let store = Arc::new(MemorySnapshotStore::new());
        let tracker = VersionTracker::open(store.clone(), "versions.json").await.unwrap();
        let id = RecordId::new("x").unwrap();

        assert!(tracker.get_version(&id).await.is_none());
        tracker.update_version(record("x", Side::Edge, 1, b"a")).await;
        tracker.update_version(record("x", Side::Cloud, 2, b"b")).await;

        let tracked = tracker.get_version(&id).await.unwrap();
        assert_eq!(tracked.version, 2);
        assert_eq!(tracked.origin, Side::Cloud);
        assert_eq!(tracker.len().await, 1);
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let store = Arc::new(MemorySnapshotStore::new());
        {
            let tracker = VersionTracker::open(store.clone(), "versions.json").await.unwrap();
            tracker.update_version(record("a", Side::Edge, 1, b"1")).await;
            tracker.update_version(record("b", Side::Cloud, 4, b"2")).await;
        }

        let reopened = VersionTracker::open(store, "versions.json").await.unwrap();
        let ids: Vec<String> = reopened
            .records()
            .await
            .iter()
            .map(|r| r.record_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_remove_persists() {
        let store = Arc::new(MemorySnapshotStore::new());
        let tracker = VersionTracker::open(store.clone(), "versions.json").await.unwrap();
        tracker.update_version(record("a", Side::Edge, 1, b"1")).await;

        assert!(tracker.remove(&RecordId::new("a").unwrap()).await.is_some());
        let reopened = VersionTracker::open(store, "versions.json").await.unwrap();
        assert!(reopened.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_quarantined() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.save("versions.json", "{ not json").await.unwrap();

        let tracker = VersionTracker::open(store.clone(), "versions.json").await.unwrap();
        assert!(tracker.is_empty().await);
        assert_eq!(store.quarantined().await.len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_degrades_durability() {
        let store = Arc::new(MemorySnapshotStore::new());
        let tracker = VersionTracker::open(store.clone(), "versions.json").await.unwrap();

        store.set_fail_writes(true);
        tracker.update_version(record("a", Side::Edge, 1, b"1")).await;
        assert!(tracker.durability_degraded());
        assert_eq!(tracker.len().await, 1);

        store.set_fail_writes(false);
        tracker.persist().await.unwrap();
        assert!(!tracker.durability_degraded());
    }
}
