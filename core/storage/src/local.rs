//! Local filesystem snapshot store.

use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::provider::{validate_document_name, SnapshotStore};
use edgesync_common::{Error, Result};

/// Local filesystem snapshot store.
///
/// Each document is a file directly under the root directory. Writes go
/// to a sibling temp file first and are renamed into place.
pub struct LocalSnapshotStore {
    root: PathBuf,
}

impl LocalSnapshotStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, document: &str) -> Result<PathBuf> {
        validate_document_name(document)?;
        Ok(self.root.join(document))
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn load(&self, document: &str) -> Result<Option<String>> {
        let path = self.document_path(document)?;

        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn save(&self, document: &str, contents: &str) -> Result<()> {
        let path = self.document_path(document)?;
        let tmp_path = self.root.join(format!(".{}.tmp", document));

        fs::write(&tmp_path, contents)
            .await
            .map_err(|e| Error::Persistence(format!("writing {}: {}", tmp_path.display(), e)))?;

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::Persistence(format!(
                "replacing {}: {}",
                path.display(),
                e
            )));
        }

        debug!("Saved {} ({} bytes)", path.display(), contents.len());
        Ok(())
    }

    async fn quarantine(&self, document: &str) -> Result<()> {
        let path = self.document_path(document)?;
        let aside = self.root.join(format!(
            "{}.corrupt-{}",
            document,
            Utc::now().format("%Y%m%d_%H%M%S")
        ));

        match fs::rename(&path, &aside).await {
            Ok(()) => {
                warn!("Moved unreadable {} to {}", path.display(), aside.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_save_load() {
        let temp = TempDir::new().unwrap();
        let store = LocalSnapshotStore::new(temp.path()).unwrap();

        store.save("queue.json", "[]").await.unwrap();
        let loaded = store.load("queue.json").await.unwrap();

        assert_eq!(loaded.as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_local_missing_document_is_none() {
        let temp = TempDir::new().unwrap();
        let store = LocalSnapshotStore::new(temp.path()).unwrap();

        assert!(store.load("versions.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_save_overwrites_and_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let store = LocalSnapshotStore::new(temp.path()).unwrap();

        store.save("queue.json", "first").await.unwrap();
        store.save("queue.json", "second").await.unwrap();

        assert_eq!(
            store.load("queue.json").await.unwrap().as_deref(),
            Some("second")
        );
        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["queue.json".to_string()]);
    }

    #[tokio::test]
    async fn test_local_creates_missing_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("nested").join("state");
        let store = LocalSnapshotStore::new(&root).unwrap();

        store.save("versions.json", "{}").await.unwrap();
        assert!(root.join("versions.json").exists());
    }

    #[tokio::test]
    async fn test_local_quarantine_moves_document() {
        let temp = TempDir::new().unwrap();
        let store = LocalSnapshotStore::new(temp.path()).unwrap();

        store.save("queue.json", "not json").await.unwrap();
        store.quarantine("queue.json").await.unwrap();

        assert!(store.load("queue.json").await.unwrap().is_none());
        let moved = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("queue.json.corrupt-"));
        assert!(moved);
    }

    #[tokio::test]
    async fn test_local_rejects_nested_names() {
        let temp = TempDir::new().unwrap();
        let store = LocalSnapshotStore::new(temp.path()).unwrap();

        assert!(store.save("../escape.json", "{}").await.is_err());
    }
}
