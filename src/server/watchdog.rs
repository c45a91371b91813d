//! Connection Timeout Watchdog
//!
//! A background task that periodically checks every registered connection
//! against its idle and lifetime timeouts.
//!
//! ## Design
//!
//! The watchdog runs as a task on the worker runtime and:
//! 1. Sleeps for its period
//! 2. Wakes up and walks the connections of every dispatcher
//! 3. Fires the timeout callback of each expired connection
//!
//! The callback decides whether the connection survives; without a handler
//! or when the handler declines, the connection is destroyed.
//!
//! ## Period
//!
//! The period is a fifth of the shortest configured timeout, so a
//! connection is never more than 20% late in timing out. Connections that
//! get a shorter timeout after the watchdog started lower the shared
//! [`CheckPeriod`]; the period never grows back.

use crate::reactor::DispatcherPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace};

/// Shortest period the watchdog runs at.
pub const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Period for the given timeouts: a fifth of the shorter one, or
/// `fallback` if neither is set.
pub fn period_for(
    idle_timeout: Option<Duration>,
    lifetime_timeout: Option<Duration>,
    fallback: Duration,
) -> Duration {
    let shortest = match (idle_timeout, lifetime_timeout) {
        (Some(idle), Some(lifetime)) => idle.min(lifetime),
        (Some(timeout), None) | (None, Some(timeout)) => timeout,
        (None, None) => return fallback.max(MIN_PERIOD),
    };
    (shortest / 5).max(MIN_PERIOD)
}

/// The watchdog period, shared with the connections it checks.
#[derive(Debug)]
pub struct CheckPeriod {
    millis: AtomicU64,
    changed: Notify,
}

impl CheckPeriod {
    pub fn new(period: Duration) -> Self {
        Self {
            millis: AtomicU64::new(period.max(MIN_PERIOD).as_millis() as u64),
            changed: Notify::new(),
        }
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Acquire))
    }

    /// Lowers the period so the given timeouts are checked often enough.
    ///
    /// Returns true if the period changed.
    pub fn fit(&self, idle_timeout: Option<Duration>, lifetime_timeout: Option<Duration>) -> bool {
        if idle_timeout.is_none() && lifetime_timeout.is_none() {
            return false;
        }
        let wanted = period_for(idle_timeout, lifetime_timeout, MIN_PERIOD).as_millis() as u64;
        let previous = self.millis.fetch_min(wanted, Ordering::AcqRel);
        if wanted >= previous {
            return false;
        }
        debug!(
            from_ms = previous,
            to_ms = wanted,
            "Timeout watchdog period lowered"
        );
        self.changed.notify_one();
        true
    }
}

/// A handle to the running watchdog.
///
/// When this handle is dropped, the watchdog task will be stopped.
#[derive(Debug)]
pub struct TimeoutWatchdog {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
    period: Arc<CheckPeriod>,
}

impl TimeoutWatchdog {
    /// Starts the watchdog on `runtime`.
    pub fn start(runtime: &Handle, dispatchers: Arc<DispatcherPool>, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let period = Arc::new(CheckPeriod::new(period));

        runtime.spawn(watchdog_loop(dispatchers, Arc::clone(&period), shutdown_rx));

        info!(period_ms = period.get().as_millis() as u64, "Timeout watchdog started");

        Self {
            shutdown_tx,
            period,
        }
    }

    /// The period connections lower when they get shorter timeouts.
    pub fn period(&self) -> &Arc<CheckPeriod> {
        &self.period
    }

    /// Stops the watchdog.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            debug!("Timeout watchdog stopped");
        }
    }
}

impl Drop for TimeoutWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main watchdog loop.
async fn watchdog_loop(
    dispatchers: Arc<DispatcherPool>,
    period: Arc<CheckPeriod>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period.get()) => {}
            // Restart the wait with the shorter period.
            _ = period.changed.notified() => continue,
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Timeout watchdog received shutdown signal");
                    return;
                }
            }
        }

        let now = Instant::now();
        let connections = dispatchers.connections();
        trace!(connections = connections.len(), "Checking connection timeouts");
        for connection in connections {
            connection.check_timeouts(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;

    #[test]
    fn test_period_is_fifth_of_shortest_timeout() {
        let period = period_for(
            Some(Duration::from_secs(10)),
            Some(Duration::from_secs(60)),
            Duration::from_secs(1),
        );
        assert_eq!(period, Duration::from_secs(2));

        let period = period_for(None, Some(Duration::from_secs(5)), Duration::from_secs(1));
        assert_eq!(period, Duration::from_secs(1));
    }

    #[test]
    fn test_period_fallback_and_floor() {
        assert_eq!(
            period_for(None, None, Duration::from_millis(750)),
            Duration::from_millis(750)
        );
        assert_eq!(
            period_for(Some(Duration::from_millis(20)), None, Duration::from_secs(1)),
            MIN_PERIOD
        );
    }

    #[test]
    fn test_check_period_only_shrinks() {
        let period = CheckPeriod::new(Duration::from_secs(1));
        assert!(!period.fit(None, None));
        assert_eq!(period.get(), Duration::from_secs(1));

        assert!(period.fit(Some(Duration::from_millis(500)), None));
        assert_eq!(period.get(), Duration::from_millis(100));

        assert!(!period.fit(None, Some(Duration::from_secs(10))));
        assert_eq!(period.get(), Duration::from_millis(100));

        assert!(period.fit(Some(Duration::from_millis(1)), None));
        assert_eq!(period.get(), MIN_PERIOD);
    }

    #[test]
    fn test_start_and_stop() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let dispatchers = Arc::new(DispatcherPool::new(1, &MemoryManager::default(), 4).unwrap());
        let watchdog = TimeoutWatchdog::start(
            runtime.handle(),
            Arc::clone(&dispatchers),
            Duration::from_millis(10),
        );
        std::thread::sleep(Duration::from_millis(50));
        watchdog.stop();
        drop(watchdog);
        dispatchers.close();
    }
}
