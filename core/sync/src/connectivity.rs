//! Connectivity detection by probing a set of endpoints.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use edgesync_common::{Error, Result};

/// Derived connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    /// No probe has completed yet.
    Unknown,
    /// Every endpoint answered.
    Online,
    /// Some, but not all, endpoints answered.
    Degraded,
    /// No endpoint answered.
    Offline,
}

impl ConnectivityStatus {
    /// Classify a probe round.
    ///
    /// An empty endpoint list has nothing to reach and counts as offline.
    pub fn classify(reachable: usize, total: usize) -> Self {
        if total == 0 || reachable == 0 {
            Self::Offline
        } else if reachable >= total {
            Self::Online
        } else {
            Self::Degraded
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// One probe round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySample {
    pub timestamp: DateTime<Utc>,
    pub status: ConnectivityStatus,
    pub reachable: usize,
    pub total: usize,
}

/// Reachability check for a single endpoint.
///
/// Unreachability is reported as `Err`; the monitor applies the timeout.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> Result<()>;
}

/// Scriptable probe for tests and offline simulation.
///
/// All endpoints answer while the probe is online, except those marked
/// unreachable. Hanging endpoints never answer, so only the monitor's
/// timeout ends their probe.
#[derive(Default)]
pub struct StaticProbe {
    online: AtomicBool,
    unreachable: RwLock<HashSet<String>>,
    hanging: RwLock<HashSet<String>>,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn new(online: bool) -> Self {
        let probe = Self::default();
        probe.online.store(online, Ordering::SeqCst);
        probe
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub async fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    pub async fn set_hanging(&self, endpoint: &str) {
        self.hanging.write().await.insert(endpoint.to_string());
    }

    /// Total number of probes issued.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for StaticProbe {
    async fn probe(&self, endpoint: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.hanging.read().await.contains(endpoint) {
            futures::future::pending::<()>().await;
        }
        if !self.online.load(Ordering::SeqCst) || self.unreachable.read().await.contains(endpoint) {
            return Err(Error::Network(format!("{} unreachable", endpoint)));
        }
        Ok(())
    }
}

struct MonitorState {
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
    history: VecDeque<ConnectivitySample>,
}

/// Periodically-driven connectivity monitor.
///
/// The status reflects the latest probe round only; there is no
/// debounce between rounds.
pub struct ConnectivityMonitor {
    endpoints: Vec<String>,
    probe: Arc<dyn Probe>,
    timeout: Duration,
    history_limit: usize,
    state: RwLock<MonitorState>,
    status_tx: watch::Sender<ConnectivityStatus>,
}

impl ConnectivityMonitor {
    pub fn new(
        endpoints: Vec<String>,
        probe: Arc<dyn Probe>,
        timeout: Duration,
        history_limit: usize,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectivityStatus::Unknown);
        Self {
            endpoints,
            probe,
            timeout,
            history_limit,
            state: RwLock::new(MonitorState {
                consecutive_failures: 0,
                last_check: None,
                history: VecDeque::new(),
            }),
            status_tx,
        }
    }

    /// Probe every endpoint concurrently and update the derived status.
    pub async fn check_connectivity(&self) -> ConnectivityStatus {
        let timeout = self.timeout;
        let probes = self.endpoints.iter().map(|endpoint| {
            let probe = self.probe.clone();
            async move {
                match tokio::time::timeout(timeout, probe.probe(endpoint)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!("Probe of {} failed: {}", endpoint, e);
                        false
                    }
                    Err(_) => {
                        debug!("Probe of {} timed out after {:?}", endpoint, timeout);
                        false
                    }
                }
            }
        });

        let results = join_all(probes).await;
        let reachable = results.iter().filter(|ok| **ok).count();
        let total = self.endpoints.len();
        let status = ConnectivityStatus::classify(reachable, total);
        let now = Utc::now();

        {
            let mut state = self.state.write().await;
            if status == ConnectivityStatus::Online {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures += 1;
            }
            state.last_check = Some(now);
            state.history.push_back(ConnectivitySample {
                timestamp: now,
                status,
                reachable,
                total,
            });
            while state.history.len() > self.history_limit {
                state.history.pop_front();
            }
        }

        let previous = self.status_tx.send_replace(status);
        if previous != status {
            info!(
                "Connectivity changed: {} -> {} ({}/{} endpoints reachable)",
                previous, status, reachable, total
            );
        }

        status
    }

    /// Latest derived status.
    pub fn status(&self) -> ConnectivityStatus {
        *self.status_tx.borrow()
    }

    /// Receive status updates as they are published.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status_tx.subscribe()
    }

    /// Number of consecutive non-online rounds.
    pub async fn consecutive_failures(&self) -> u32 {
        self.state.read().await.consecutive_failures
    }

    pub async fn last_check_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_check
    }

    /// Recent samples, oldest first.
    pub async fn history(&self) -> Vec<ConnectivitySample> {
        self.state.read().await.history.iter().cloned().collect()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}
