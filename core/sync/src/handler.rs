//! Operation handlers and their registration table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use edgesync_common::{Error, Result};

use crate::queue::{OperationKind, QueuedOperation};

/// Performs the actual work for one kind of queued operation.
///
/// Handlers may be invoked more than once for the same operation
/// (delivery is at-least-once), so they should be idempotent. Any `Err`
/// is treated as retryable.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, op: &QueuedOperation) -> Result<()>;
}

#[async_trait]
impl<F, Fut> OperationHandler for F
where
    F: Fn(QueuedOperation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, op: &QueuedOperation) -> Result<()> {
        (self)(op.clone()).await
    }
}

/// Registry mapping each operation kind to its handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationKind, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`.
    ///
    /// # Errors
    /// - Returns error if `kind` already has a handler
    pub fn register(
        &mut self,
        kind: OperationKind,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<()> {
        if self.handlers.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Handler for '{}' is already registered",
                kind
            )));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Remove the handler for `kind`, returning it.
    pub fn unregister(&mut self, kind: &OperationKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.remove(kind)
    }

    pub fn get(&self, kind: &OperationKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &OperationKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted by name.
    pub fn kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<OperationKind> = self.handlers.keys().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }
}
