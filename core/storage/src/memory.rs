//! In-memory snapshot store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::provider::{validate_document_name, SnapshotStore};
use edgesync_common::{Error, Result};

/// In-memory snapshot store.
///
/// Useful for testing and ephemeral engines. All data is stored in
/// memory and lost on drop. Clones share the same documents, so a test
/// can hand one clone to an engine and inspect another.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    documents: Arc<RwLock<HashMap<String, String>>>,
    quarantined: Arc<RwLock<Vec<(String, String)>>>,
    fail_writes: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl MemorySnapshotStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail (simulates a full disk).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Documents moved aside by `quarantine`, as `(name, contents)`.
    pub async fn quarantined(&self) -> Vec<(String, String)> {
        self.quarantined.read().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, document: &str) -> Result<Option<String>> {
        validate_document_name(document)?;
        Ok(self.documents.read().await.get(document).cloned())
    }

    async fn save(&self, document: &str, contents: &str) -> Result<()> {
        validate_document_name(document)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence(format!(
                "simulated write failure for {}",
                document
            )));
        }

        self.documents
            .write()
            .await
            .insert(document.to_string(), contents.to_string());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn quarantine(&self, document: &str) -> Result<()> {
        validate_document_name(document)?;
        if let Some(contents) = self.documents.write().await.remove(document) {
            self.quarantined
                .write()
                .await
                .push((document.to_string(), contents));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_save_load() {
        let store = MemorySnapshotStore::new();
        store.save("queue.json", "[1]").await.unwrap();

        assert_eq!(store.load("queue.json").await.unwrap().as_deref(), Some("[1]"));
        assert!(store.load("other.json").await.unwrap().is_none());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_clones_share_documents() {
        let store = MemorySnapshotStore::new();
        let view = store.clone();

        store.save("versions.json", "{}").await.unwrap();
        assert!(view.load("versions.json").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_fail_writes() {
        let store = MemorySnapshotStore::new();
        store.set_fail_writes(true);

        let err = store.save("queue.json", "[]").await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(store.load("queue.json").await.unwrap().is_none());

        store.set_fail_writes(false);
        store.save("queue.json", "[]").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_quarantine() {
        let store = MemorySnapshotStore::new();
        store.save("queue.json", "garbage").await.unwrap();
        store.quarantine("queue.json").await.unwrap();

        assert!(store.load("queue.json").await.unwrap().is_none());
        assert_eq!(
            store.quarantined().await,
            vec![("queue.json".to_string(), "garbage".to_string())]
        );
    }
}
