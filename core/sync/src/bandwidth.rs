//! Transfer prioritization and throttling.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use edgesync_common::Priority;

use crate::config::SyncConfig;
use crate::queue::QueuedOperation;

/// Scores operations for transfer order and paces transfers under an
/// optional byte-rate cap.
#[derive(Debug, Clone)]
pub struct BandwidthOptimizer {
    high_priority_kinds: HashSet<String>,
    large_payload_threshold: u64,
    recency_window: Duration,
    cap_bytes_per_sec: Option<u64>,
}

impl BandwidthOptimizer {
    pub fn new(
        high_priority_kinds: impl IntoIterator<Item = String>,
        large_payload_threshold: u64,
        recency_window: Duration,
        cap_bytes_per_sec: Option<u64>,
    ) -> Self {
        Self {
            high_priority_kinds: high_priority_kinds.into_iter().collect(),
            large_payload_threshold,
            recency_window,
            cap_bytes_per_sec,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.high_priority_data_kinds.iter().cloned(),
            config.large_payload_threshold_bytes,
            config.recency_window(),
            config.bandwidth_cap_bytes_per_sec,
        )
    }

    /// Transfer score; higher goes first.
    pub fn priority_score(&self, op: &QueuedOperation, now: DateTime<Utc>) -> f64 {
        let mut score = match op.priority {
            Priority::Low => 1.0,
            Priority::Normal => 2.0,
            Priority::High => 4.0,
            Priority::Critical => 8.0,
        };

        if self.high_priority_kinds.contains(op.data_kind()) {
            score *= 2.0;
        }
        if op.payload_size() > self.large_payload_threshold {
            score *= 0.5;
        }

        let modified = op.record.as_ref().map_or(op.created_at, |r| r.modified_at);
        let age = now.signed_duration_since(modified);
        if let Ok(age) = age.to_std() {
            if age <= self.recency_window {
                score *= 1.5;
            }
        } else {
            // Timestamp in the future; treat as fresh.
            score *= 1.5;
        }

        score
    }

    /// Order a batch by descending score. Equal scores keep queue order.
    pub fn order_batch(
        &self,
        mut batch: Vec<QueuedOperation>,
        now: DateTime<Utc>,
    ) -> Vec<QueuedOperation> {
        batch.sort_by(|a, b| {
            self.priority_score(b, now)
                .total_cmp(&self.priority_score(a, now))
        });
        batch
    }

    /// How long to wait before moving `bytes` under the cap.
    pub fn throttle_delay(&self, bytes: u64) -> Duration {
        match self.cap_bytes_per_sec {
            Some(cap) if cap > 0 && bytes > 0 => Duration::from_secs_f64(bytes as f64 / cap as f64),
            _ => Duration::ZERO,
        }
    }

    /// Sleep for `throttle_delay(bytes)`.
    pub async fn throttle(&self, bytes: u64) {
        let delay = self.throttle_delay(bytes);
        if !delay.is_zero() {
            debug!("Throttling {} bytes for {:?}", bytes, delay);
            tokio::time::sleep(delay).await;
        }
    }

    pub fn cap_bytes_per_sec(&self) -> Option<u64> {
        self.cap_bytes_per_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OperationKind;
    use crate::version::SyncRecord;
    use chrono::Duration as ChronoDuration;
    use edgesync_common::{RecordId, Side};

    fn optimizer(cap: Option<u64>) -> BandwidthOptimizer {
        BandwidthOptimizer::new(
            vec!["model".to_string()],
            1_000,
            Duration::from_secs(60),
            cap,
        )
    }

    fn op_with(priority: Priority, kind: &str, size: usize, age_minutes: i64) -> QueuedOperation {
        let now = Utc::now();
        let record = SyncRecord::from_content(
            RecordId::new("r").unwrap(),
            kind,
            Side::Edge,
            1,
            &vec![0u8; size],
        )
        .with_modified_at(now - ChronoDuration::minutes(age_minutes));
        QueuedOperation::new(
            OperationKind::ModelPush,
            serde_json::Value::Null,
            priority,
            3,
        )
        .with_record(record)
    }

    #[test]
    fn test_score_adjustments() {
        let opt = optimizer(None);
        let now = Utc::now();

        let base = opt.priority_score(&op_with(Priority::Normal, "telemetry", 10, 10), now);
        assert_eq!(base, 2.0);

        let hot_kind = opt.priority_score(&op_with(Priority::Normal, "model", 10, 10), now);
        assert_eq!(hot_kind, 4.0);

        let large = opt.priority_score(&op_with(Priority::Normal, "telemetry", 5_000, 10), now);
        assert_eq!(large, 1.0);

        let recent = opt.priority_score(&op_with(Priority::Normal, "telemetry", 10, 0), now);
        assert_eq!(recent, 3.0);
    }

    #[test]
    fn test_order_batch_by_score() {
        let opt = optimizer(None);
        let now = Utc::now();
        let batch = vec![
            op_with(Priority::Normal, "telemetry", 5_000, 10),
            op_with(Priority::Normal, "model", 10, 10),
            op_with(Priority::Normal, "telemetry", 10, 10),
        ];

        let ordered = opt.order_batch(batch, now);
        let kinds: Vec<(&str, u64)> = ordered
            .iter()
            .map(|op| (op.data_kind(), op.payload_size()))
            .collect();
        assert_eq!(
            kinds,
            vec![("model", 10), ("telemetry", 10), ("telemetry", 5_000)]
        );
    }

    #[test]
    fn test_order_batch_is_stable_on_ties() {
        let opt = optimizer(None);
        let now = Utc::now();
        let batch: Vec<QueuedOperation> = (0..4)
            .map(|_| op_with(Priority::High, "telemetry", 10, 10))
            .collect();
        let ids: Vec<_> = batch.iter().map(|op| op.id.clone()).collect();

        let ordered = opt.order_batch(batch, now);
        let ordered_ids: Vec<_> = ordered.iter().map(|op| op.id.clone()).collect();
        assert_eq!(ordered_ids, ids);
    }

    #[test]
    fn test_throttle_delay() {
        assert_eq!(optimizer(None).throttle_delay(10_000), Duration::ZERO);
        assert_eq!(
            optimizer(Some(1_000)).throttle_delay(2_500),
            Duration::from_millis(2_500)
        );
        assert_eq!(optimizer(Some(1_000)).throttle_delay(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_throttle_sleeps() {
        let opt = optimizer(Some(1_000));
        let start = std::time::Instant::now();
        opt.throttle(50).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
