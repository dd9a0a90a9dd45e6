//! Snapshot store trait definition.

use async_trait::async_trait;

use edgesync_common::{Error, Result};

/// Storage backend for whole-document snapshots.
///
/// Documents are addressed by a flat name such as `queue.json`.
/// Implementations must make `save` atomic with respect to `load`: a
/// reader observes either the previous or the new contents, never a
/// partial write.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Get the backend name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Load a document.
    ///
    /// # Returns
    /// - `Ok(None)` if the document has never been written
    ///
    /// # Errors
    /// - I/O errors other than absence
    async fn load(&self, document: &str) -> Result<Option<String>>;

    /// Replace a document with new contents.
    ///
    /// # Postconditions
    /// - A subsequent `load` returns exactly `contents`
    ///
    /// # Errors
    /// - Disk full, permission denied, or other I/O errors
    async fn save(&self, document: &str, contents: &str) -> Result<()>;

    /// Move an unreadable document aside so it is kept for inspection
    /// and the next `save` does not overwrite it.
    async fn quarantine(&self, document: &str) -> Result<()>;
}

/// Check that a document name is a single plain path component.
pub fn validate_document_name(document: &str) -> Result<()> {
    if document.is_empty() {
        return Err(Error::InvalidInput(
            "Document name cannot be empty".to_string(),
        ));
    }
    if document.contains('/') || document.contains('\\') || document == "." || document == ".." {
        return Err(Error::InvalidInput(format!(
            "Document name '{}' must be a single path component",
            document
        )));
    }
    Ok(())
}
