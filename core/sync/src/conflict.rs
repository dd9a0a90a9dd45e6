//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use edgesync_common::{Error, RecordId, Result, Side};

use crate::version::SyncRecord;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Later modification time wins; ties go to cloud.
    LatestWins,
    /// Cloud version always wins.
    CloudWins,
    /// Edge version always wins.
    EdgeWins,
    /// Caller-supplied merge function; latest-wins if none is set.
    Merge,
    /// Wait for an external actor to pick the winner.
    Manual,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LatestWins => "latest-wins",
            Self::CloudWins => "cloud-wins",
            Self::EdgeWins => "edge-wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Merge callback: `(edge, cloud) -> merged`.
pub type MergeFn = Arc<dyn Fn(&SyncRecord, &SyncRecord) -> Result<SyncRecord> + Send + Sync>;

/// A detected divergence between the edge and cloud copies of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub record_id: RecordId,
    pub edge: SyncRecord,
    pub cloud: SyncRecord,
    pub detected_at: DateTime<Utc>,
    pub strategy: ConflictStrategy,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub winner: Option<SyncRecord>,
}

impl ConflictRecord {
    fn key(&self) -> ConflictKey {
        conflict_key(&self.edge, &self.cloud)
    }

    fn side(&self, side: Side) -> &SyncRecord {
        match side {
            Side::Edge => &self.edge,
            Side::Cloud => &self.cloud,
        }
    }

    /// Whether `record` is one of the two diverging copies.
    pub fn involves(&self, record: &SyncRecord) -> bool {
        record.record_id == self.record_id
            && self.side(record.origin).content_hash == record.content_hash
    }
}

/// A conflict is identified by the record and the two diverging contents.
type ConflictKey = (RecordId, String, String);

fn conflict_key(edge: &SyncRecord, cloud: &SyncRecord) -> ConflictKey {
    (
        edge.record_id.clone(),
        edge.content_hash.clone(),
        cloud.content_hash.clone(),
    )
}

/// Conflict detector and resolver.
///
/// Keeps at most one live conflict per diverging (edge, cloud) pair, so
/// two queued updates of the same record each get their own. The
/// resolver never touches the version tracker; callers write the winner
/// back and then call `retire_stale`.
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    merge_fn: Option<MergeFn>,
    live: HashMap<ConflictKey, ConflictRecord>,
}

impl ConflictResolver {
    /// Create a new conflict resolver with the given strategy.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            merge_fn: None,
            live: HashMap::new(),
        }
    }

    /// Set the merge callback used by `ConflictStrategy::Merge`.
    pub fn with_merge_fn(mut self, merge_fn: MergeFn) -> Self {
        self.merge_fn = Some(merge_fn);
        self
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Compare the two sides of a record.
    ///
    /// Returns `None` when the hashes match. Re-detecting the same pair
    /// returns the conflict already on file, including one that was
    /// resolved manually but not yet applied.
    pub fn detect_conflict(
        &mut self,
        edge: &SyncRecord,
        cloud: &SyncRecord,
    ) -> Option<ConflictRecord> {
        if edge.has_converged_with(cloud) {
            return None;
        }

        let key = conflict_key(edge, cloud);
        if let Some(existing) = self.live.get(&key) {
            return Some(existing.clone());
        }

        let conflict = ConflictRecord {
            conflict_id: Uuid::new_v4().to_string(),
            record_id: edge.record_id.clone(),
            edge: edge.clone(),
            cloud: cloud.clone(),
            detected_at: Utc::now(),
            strategy: self.strategy,
            resolved: false,
            resolved_at: None,
            winner: None,
        };
        info!(
            "Conflict {} detected on {}: edge v{} vs cloud v{}",
            conflict.conflict_id, conflict.record_id, edge.version, cloud.version
        );
        self.live.insert(key, conflict.clone());
        Some(conflict)
    }

    /// Look up the live conflict for this pair without creating one.
    pub fn find(&self, edge: &SyncRecord, cloud: &SyncRecord) -> Option<&ConflictRecord> {
        self.live.get(&conflict_key(edge, cloud))
    }

    /// Resolve a conflict with the configured strategy.
    ///
    /// A conflict resolved through `resolve_manually` yields that winner.
    /// On success the conflict is discarded.
    ///
    /// # Errors
    /// - `ManualResolutionRequired` when the strategy is manual and no
    ///   winner has been supplied yet; the conflict stays on file
    /// - errors returned by the merge callback
    pub fn resolve_conflict(&mut self, conflict: &ConflictRecord) -> Result<SyncRecord> {
        let key = conflict.key();
        if let Some(stored) = self.live.get(&key) {
            if stored.conflict_id == conflict.conflict_id && stored.resolved {
                if let Some(winner) = stored.winner.clone() {
                    self.live.remove(&key);
                    debug!("Applying manual resolution for {}", conflict.record_id);
                    return Ok(winner);
                }
            }
        }

        let winner = match self.strategy {
            ConflictStrategy::LatestWins => latest_wins(&conflict.edge, &conflict.cloud),
            ConflictStrategy::CloudWins => conflict.cloud.clone(),
            ConflictStrategy::EdgeWins => conflict.edge.clone(),
            ConflictStrategy::Merge => match &self.merge_fn {
                Some(merge) => merge(&conflict.edge, &conflict.cloud)?,
                None => {
                    warn!(
                        "No merge function configured; resolving {} with latest-wins",
                        conflict.record_id
                    );
                    latest_wins(&conflict.edge, &conflict.cloud)
                }
            },
            ConflictStrategy::Manual => {
                return Err(Error::ManualResolutionRequired(conflict.record_id.to_string()));
            }
        };

        self.live.remove(&key);
        debug!(
            "Resolved {} with {}: {} v{} wins",
            conflict.record_id, self.strategy, winner.origin, winner.version
        );
        Ok(winner)
    }

    /// Supply the winner for a conflict awaiting manual resolution.
    ///
    /// # Errors
    /// - `NotFound` if no live conflict has this id
    /// - `InvalidInput` if the winner is for a different record
    pub fn resolve_manually(
        &mut self,
        conflict_id: &str,
        winner: SyncRecord,
    ) -> Result<ConflictRecord> {
        let conflict = self
            .live
            .values_mut()
            .find(|c| c.conflict_id == conflict_id)
            .ok_or_else(|| Error::NotFound(format!("No live conflict {}", conflict_id)))?;

        if winner.record_id != conflict.record_id {
            return Err(Error::InvalidInput(format!(
                "Winner is for {}, conflict {} is for {}",
                winner.record_id, conflict_id, conflict.record_id
            )));
        }

        conflict.resolved = true;
        conflict.resolved_at = Some(Utc::now());
        conflict.winner = Some(winner);
        info!("Conflict {} resolved manually", conflict_id);
        Ok(conflict.clone())
    }

    /// Drop conflicts made obsolete by `accepted` becoming the tracked
    /// version of its record.
    ///
    /// A conflict survives only if its copy on the accepted record's side
    /// is still the accepted content. Returns how many were dropped.
    pub fn retire_stale(&mut self, accepted: &SyncRecord) -> usize {
        let before = self.live.len();
        self.live.retain(|_, c| {
            c.record_id != accepted.record_id
                || c.side(accepted.origin).content_hash == accepted.content_hash
        });
        let retired = before - self.live.len();
        if retired > 0 {
            debug!(
                "Retired {} stale conflicts on {} after accepting v{}",
                retired, accepted.record_id, accepted.version
            );
        }
        retired
    }

    /// Whether `record` is part of a conflict still waiting for a manual
    /// winner.
    pub fn awaits_manual(&self, record: &SyncRecord) -> bool {
        self.strategy == ConflictStrategy::Manual
            && self.live.values().any(|c| !c.resolved && c.involves(record))
    }

    /// Conflicts waiting for a manual winner.
    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        let mut pending: Vec<ConflictRecord> =
            self.live.values().filter(|c| !c.resolved).cloned().collect();
        pending.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        pending
    }

    /// Live conflicts on one record, resolved or not.
    pub fn conflicts_for(&self, record_id: &RecordId) -> Vec<&ConflictRecord> {
        self.live
            .values()
            .filter(|c| &c.record_id == record_id)
            .collect()
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::LatestWins)
    }
}

fn latest_wins(edge: &SyncRecord, cloud: &SyncRecord) -> SyncRecord {
    if edge.modified_at > cloud.modified_at {
        edge.clone()
    } else {
        cloud.clone()
    }
}

/// Split two records of the same identity into `(edge, cloud)`.
///
/// Returns `None` unless exactly one of them originates on each side.
pub fn by_side<'a>(
    a: &'a SyncRecord,
    b: &'a SyncRecord,
) -> Option<(&'a SyncRecord, &'a SyncRecord)> {
    match (a.origin, b.origin) {
        (Side::Edge, Side::Cloud) => Some((a, b)),
        (Side::Cloud, Side::Edge) => Some((b, a)),
        _ => None,
    }
}
