//! Background loops: connectivity polling and periodic sync passes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connectivity::{ConnectivityMonitor, ConnectivityStatus};

/// "Just reconnected" flag handed from the connectivity loop to the sync
/// loop. Marking it wakes the sync loop ahead of its next tick.
#[derive(Debug, Default)]
pub struct ReconnectSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ReconnectSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Consume the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Probe connectivity every `period` until cancelled.
///
/// Marks `signal` on every Offline -> Online transition.
pub async fn run_connectivity_loop(
    monitor: Arc<ConnectivityMonitor>,
    period: Duration,
    signal: Arc<ReconnectSignal>,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(period);
    let mut previous = monitor.status();
    info!("Connectivity loop started ({:?} period)", period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let status = monitor.check_connectivity().await;
        if previous == ConnectivityStatus::Offline && status == ConnectivityStatus::Online {
            debug!("Reconnected; requesting immediate sync pass");
            signal.mark();
        }
        previous = status;
    }

    info!("Connectivity loop stopped");
}

/// Run `pass` every `period`, or as soon as `signal` is marked, until
/// cancelled.
///
/// Cancellation is only observed between passes; a pass that has started
/// always runs to completion.
pub async fn run_sync_loop<F, Fut>(
    period: Duration,
    signal: Arc<ReconnectSignal>,
    cancel: CancellationToken,
    pass: F,
) where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    let mut ticker = ticker(period);
    info!("Sync loop started ({:?} period)", period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = signal.notified() => {
                debug!("Sync pass triggered by reconnect");
            }
            _ = ticker.tick() => {}
        }

        signal.take();
        pass().await;
    }

    info!("Sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::StaticProbe;
    use std::sync::atomic::AtomicU32;

    fn monitor(probe: Arc<StaticProbe>) -> Arc<ConnectivityMonitor> {
        Arc::new(ConnectivityMonitor::new(
            vec!["http://cloud".to_string()],
            probe,
            Duration::from_millis(50),
            10,
        ))
    }

    #[test]
    fn test_signal_take_clears() {
        let signal = ReconnectSignal::new();
        assert!(!signal.take());
        signal.mark();
        assert!(signal.is_set());
        assert!(signal.take());
        assert!(!signal.is_set());
    }

    #[tokio::test]
    async fn test_sync_loop_runs_and_stops() {
        let passes = Arc::new(AtomicU32::new(0));
        let count = passes.clone();
        let cancel = CancellationToken::new();
        let signal = Arc::new(ReconnectSignal::new());

        let task = tokio::spawn(run_sync_loop(
            Duration::from_millis(10),
            signal,
            cancel.clone(),
            move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        task.await.unwrap();

        let seen = passes.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several passes, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(passes.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_reconnect_wakes_sync_loop_early() {
        let passes = Arc::new(AtomicU32::new(0));
        let count = passes.clone();
        let cancel = CancellationToken::new();
        let signal = Arc::new(ReconnectSignal::new());

        let task = tokio::spawn(run_sync_loop(
            Duration::from_secs(3600),
            signal.clone(),
            cancel.clone(),
            move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        signal.mark();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 2);
        assert!(!signal.is_set());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connectivity_loop_marks_reconnect() {
        let probe = Arc::new(StaticProbe::new(false));
        let monitor = monitor(probe.clone());
        let signal = Arc::new(ReconnectSignal::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_connectivity_loop(
            monitor.clone(),
            Duration::from_millis(10),
            signal.clone(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(monitor.status(), ConnectivityStatus::Offline);
        assert!(!signal.is_set());

        probe.set_online(true);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(monitor.status(), ConnectivityStatus::Online);
        assert!(signal.is_set());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_to_online_is_not_a_reconnect() {
        let probe = Arc::new(StaticProbe::new(true));
        let monitor = monitor(probe);
        let signal = Arc::new(ReconnectSignal::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_connectivity_loop(
            monitor.clone(),
            Duration::from_millis(10),
            signal.clone(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(monitor.status(), ConnectivityStatus::Online);
        assert!(!signal.is_set());
    }
}
