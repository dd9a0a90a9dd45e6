//! Direct batch transfers of records between edge and cloud.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use edgesync_common::{Error, RecordId, Result};

use crate::version::SyncRecord;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    EdgeToCloud,
    CloudToEdge,
    Both,
}

impl SyncDirection {
    pub fn pushes(&self) -> bool {
        matches!(self, Self::EdgeToCloud | Self::Both)
    }

    pub fn pulls(&self) -> bool {
        matches!(self, Self::CloudToEdge | Self::Both)
    }
}

/// Transfer lifecycle. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One batch transfer request. Kept in memory for status polling only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub direction: SyncDirection,
    pub data_kind: String,
    pub records: Vec<SyncRecord>,
    pub status: TransferStatus,
    pub bytes_total: u64,
    pub bytes_transferred: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    pub fn new(direction: SyncDirection, data_kind: impl Into<String>, records: Vec<SyncRecord>) -> Self {
        let bytes_total = records.iter().map(|r| r.size_bytes).sum();
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            data_kind: data_kind.into(),
            records,
            status: TransferStatus::Pending,
            bytes_total,
            bytes_transferred: 0,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Pending -> InProgress.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TransferStatus::Pending, TransferStatus::InProgress)
    }

    /// InProgress -> Completed.
    pub fn complete(&mut self) -> Result<()> {
        self.transition(TransferStatus::InProgress, TransferStatus::Completed)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Pending or InProgress -> Failed.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "Transfer {} is already {}",
                self.id, self.status
            )));
        }
        self.status = TransferStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn record_progress(&mut self, bytes: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);
    }

    fn transition(&mut self, from: TransferStatus, to: TransferStatus) -> Result<()> {
        if self.status != from {
            return Err(Error::InvalidInput(format!(
                "Transfer {} cannot go from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }
}

/// Moves records to and from the cloud store.
#[async_trait]
pub trait RecordTransport: Send + Sync {
    /// Transport name (e.g., "http").
    fn name(&self) -> &str;

    /// Upload the edge copy of a record.
    async fn push(&self, record: &SyncRecord) -> Result<()>;

    /// Fetch the cloud copy of a record, `None` if the cloud has none.
    async fn fetch(&self, data_kind: &str, record_id: &RecordId) -> Result<Option<SyncRecord>>;
}
