//! The client connection pool.
//!
//! ## Checkout
//!
//! ```text
//!   get(address)
//!     │ admit: active < max_active, per-server < max_active_per_server
//!     ▼
//!   idle entry for (address, secure)? ──yes──> validate + reset ──> proxy
//!     │ no                                        │ invalid
//!     ▼                                           ▼
//!   connect with retry ──────────────────────> destroy, try next
//! ```
//!
//! ## Return
//!
//! A returned connection goes back to the idle set if it is healthy, has
//! not expired and the idle set has room. Otherwise it is destroyed. The
//! admission slot is released either way.
//!
//! Idle entries are also evicted by a watchdog task on the worker runtime,
//! and re-validated lazily at checkout.

use super::entry::{Expiry, PoolKey, PooledEntry};
use super::proxy::PooledConnection;
use crate::config::{ConnectionOptions, PoolConfig};
use crate::connection::Handler;
use crate::context::IoContext;
use crate::error::{Error, Result};
use crate::server::watchdog::period_for;
use crate::sync::{lock, wait_timeout};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub destroyed: u64,
    /// Checkouts refused by admission control
    pub rejected: u64,
    pub creation_errors: u64,
    pub idle: usize,
    pub active: usize,
    pub idle_evictions: u64,
    pub lifetime_evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    rejected: AtomicU64,
    creation_errors: AtomicU64,
    idle_evictions: AtomicU64,
    lifetime_evictions: AtomicU64,
}

/// Checked-out connections, overall and per server.
#[derive(Debug, Default)]
struct Admission {
    active: usize,
    per_server: HashMap<SocketAddr, usize>,
}

impl Admission {
    fn has_room(&self, address: &SocketAddr, config: &PoolConfig) -> bool {
        self.active < config.max_active
            && self.per_server.get(address).copied().unwrap_or(0) < config.max_active_per_server
    }
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    context: IoContext,
    idle: Mutex<Vec<PooledEntry>>,
    admission: Mutex<Admission>,
    slot_released: Condvar,
    counters: Counters,
    watchdog: Mutex<Option<watch::Sender<bool>>>,
    open: AtomicBool,
}

/// A cache of idle client connections keyed by address.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool with its own I/O context.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let context = IoContext::new(config.io.clone())?;
        Ok(Self::with_context(config, context))
    }

    /// Creates a pool on an existing context.
    pub fn with_context(config: PoolConfig, context: IoContext) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            context,
            idle: Mutex::new(Vec::new()),
            admission: Mutex::new(Admission::default()),
            slot_released: Condvar::new(),
            counters: Counters::default(),
            watchdog: Mutex::new(None),
            open: AtomicBool::new(true),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let period = period_for(
            inner.config.idle_timeout,
            inner.config.life_timeout,
            inner.config.watchdog_period,
        );
        inner
            .context
            .workers()
            .handle()
            .spawn(watchdog_loop(Arc::downgrade(&inner), period, shutdown_rx));
        *lock(&inner.watchdog) = Some(shutdown_tx);

        info!(
            max_active = inner.config.max_active,
            max_idle = inner.config.max_idle,
            watchdog_ms = period.as_millis() as u64,
            "Connection pool started"
        );
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &IoContext {
        &self.inner.context
    }

    /// Checks out a plain connection using the configured timeouts.
    pub fn get(
        &self,
        address: SocketAddr,
        handler: Option<Box<dyn Handler>>,
    ) -> Result<PooledConnection> {
        self.get_with(
            address,
            false,
            handler,
            self.inner.config.connect_timeout,
            self.inner.config.max_wait,
        )
    }

    /// Checks out a connection.
    ///
    /// `wait_timeout` bounds how long an admission-rejected call waits for
    /// a slot; zero fails immediately with `MaxConnectionsExceeded`.
    pub fn get_with(
        &self,
        address: SocketAddr,
        secure: bool,
        handler: Option<Box<dyn Handler>>,
        connect_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<PooledConnection> {
        let inner = &self.inner;
        if !inner.is_open() {
            return Err(Error::PoolClosed);
        }
        inner.admit(address, wait_timeout)?;

        let key = PoolKey { address, secure };
        let mut entry = match inner.take_idle(&key) {
            Some(entry) => {
                entry.connection.set_handler(handler);
                entry.connection.notify_connect();
                trace!(connection = entry.connection.id(), peer = %address, "Reusing pooled connection");
                entry
            }
            None => match inner.open_entry(key, handler, connect_timeout) {
                Ok(entry) => entry,
                Err(err) => {
                    inner.release_slot(&address);
                    return Err(err);
                }
            },
        };

        entry.checked_out();
        Ok(PooledConnection::new(entry, Arc::clone(inner)))
    }

    /// Destroys idle connections and stops the watchdog. Connections that
    /// are checked out are destroyed when they come back. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        PoolStats {
            created: counters.created.load(Ordering::Relaxed),
            destroyed: counters.destroyed.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            creation_errors: counters.creation_errors.load(Ordering::Relaxed),
            idle: lock(&self.inner.idle).len(),
            active: lock(&self.inner.admission).active,
            idle_evictions: counters.idle_evictions.load(Ordering::Relaxed),
            lifetime_evictions: counters.lifetime_evictions.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .field("open", &self.is_open())
            .finish()
    }
}

impl PoolInner {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Takes an admission slot, waiting up to `wait` for one to be released.
    fn admit(&self, address: SocketAddr, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        let mut admission = lock(&self.admission);
        while !admission.has_room(&address, &self.config) {
            let now = Instant::now();
            if now >= deadline || !self.is_open() {
                drop(admission);
                if !self.is_open() {
                    return Err(Error::PoolClosed);
                }
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %address, "Pool admission rejected");
                return Err(Error::MaxConnectionsExceeded(format!(
                    "max active {} / per server {} reached for {}",
                    self.config.max_active, self.config.max_active_per_server, address
                )));
            }
            admission = wait_timeout(&self.slot_released, admission, deadline - now);
        }

        admission.active += 1;
        *admission.per_server.entry(address).or_insert(0) += 1;
        Ok(())
    }

    fn release_slot(&self, address: &SocketAddr) {
        {
            let mut admission = lock(&self.admission);
            admission.active = admission.active.saturating_sub(1);
            if let Some(count) = admission.per_server.get_mut(address) {
                *count -= 1;
                if *count == 0 {
                    admission.per_server.remove(address);
                }
            }
        }
        self.slot_released.notify_one();
    }

    /// Most recently returned valid idle entry for `key`. Invalid entries
    /// met on the way are destroyed.
    fn take_idle(&self, key: &PoolKey) -> Option<PooledEntry> {
        loop {
            let entry = {
                let mut idle = lock(&self.idle);
                let index = idle.iter().rposition(|entry| entry.key == *key)?;
                idle.remove(index)
            };

            match entry.expiry(self.config.idle_timeout, self.config.life_timeout, Instant::now()) {
                Some(expiry) => self.evict(entry, expiry),
                None if entry.is_healthy() && entry.connection.reset() => return Some(entry),
                None => self.destroy_entry(entry),
            }
        }
    }

    /// Opens a new physical connection, retrying within `connect_timeout`.
    fn open_entry(
        &self,
        key: PoolKey,
        handler: Option<Box<dyn Handler>>,
        connect_timeout: Duration,
    ) -> Result<PooledEntry> {
        let options = self.options_for(key.secure)?;
        let stream = match self.connect_with_retry(key.address, connect_timeout) {
            Ok(stream) => stream,
            Err(err) => {
                self.counters.creation_errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        let connection = match self.context.register(stream, false, &options, handler) {
            Ok(connection) => connection,
            Err(err) => {
                self.counters.creation_errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(connection = connection.id(), peer = %key.address, secure = key.secure, "Pooled connection created");
        Ok(PooledEntry::new(connection, key))
    }

    fn options_for(&self, secure: bool) -> Result<ConnectionOptions> {
        let mut options = self.config.connection.clone();
        if !secure {
            options.secure = None;
        } else if options.secure.is_none() {
            return Err(Error::IllegalState("no secure context configured"));
        }
        Ok(options)
    }

    /// Up to `connect_trials` attempts with doubling back-off, all within
    /// `timeout`.
    fn connect_with_retry(&self, address: SocketAddr, timeout: Duration) -> Result<TcpStream> {
        let deadline = Instant::now() + timeout;
        let mut backoff = self.config.retry_backoff;
        let mut last_error = None;

        for attempt in 1..=self.config.connect_trials.max(1) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(&address, remaining) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(peer = %address, attempt = attempt, error = %err, "Connect attempt failed");
                    last_error = Some(err);
                }
            }

            let pause = backoff.min(deadline.saturating_duration_since(Instant::now()));
            if pause.is_zero() {
                break;
            }
            thread::sleep(pause);
            backoff = backoff.saturating_mul(2);
        }

        Err(match last_error {
            Some(err) if err.kind() != io::ErrorKind::TimedOut => Error::Io(err),
            Some(err) => Error::ConnectTimeout {
                address,
                reason: err.to_string(),
            },
            None => Error::ConnectTimeout {
                address,
                reason: format!("no attempt completed within {timeout:?}"),
            },
        })
    }

    /// Takes back a checked-out entry.
    ///
    /// The admission slot is released only once the entry is back in the
    /// idle set or destroyed, so a caller waiting for the slot finds the
    /// returned connection instead of opening a new one.
    pub(crate) fn release(&self, entry: PooledEntry) {
        let address = entry.key.address;
        entry.connection.set_handler(None);
        self.settle(entry);
        self.release_slot(&address);
    }

    /// Keeps a returned entry for reuse, or destroys it.
    fn settle(&self, mut entry: PooledEntry) {
        if !self.is_open() || !entry.is_healthy() {
            self.destroy_entry(entry);
            return;
        }
        let now = Instant::now();
        if let Some(expiry) = entry.expiry(None, self.config.life_timeout, now) {
            self.evict(entry, expiry);
            return;
        }
        if !entry.connection.reset() {
            self.destroy_entry(entry);
            return;
        }

        entry.last_used_at = now;
        let mut idle = lock(&self.idle);
        if idle.len() >= self.config.max_idle {
            drop(idle);
            self.destroy_entry(entry);
            return;
        }
        trace!(connection = entry.connection.id(), "Connection returned to pool");
        idle.push(entry);
    }

    /// Destroys a checked-out entry.
    pub(crate) fn destroy(&self, entry: PooledEntry) {
        let address = entry.key.address;
        entry.connection.set_handler(None);
        self.destroy_entry(entry);
        self.release_slot(&address);
    }

    fn destroy_entry(&self, entry: PooledEntry) {
        entry.connection.close_now();
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(connection = entry.connection.id(), "Pooled connection destroyed");
    }

    fn evict(&self, entry: PooledEntry, expiry: Expiry) {
        let counter = match expiry {
            Expiry::Idle => &self.counters.idle_evictions,
            Expiry::Lifetime => &self.counters.lifetime_evictions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(connection = entry.connection.id(), reason = ?expiry, "Evicting pooled connection");
        self.destroy_entry(entry);
    }

    /// Removes idle entries that expired or lost their socket.
    fn sweep(&self, now: Instant) -> usize {
        let (expired, dead) = {
            let mut idle = lock(&self.idle);
            let mut expired = Vec::new();
            let mut dead = Vec::new();
            let mut index = 0;
            while index < idle.len() {
                let entry = &idle[index];
                if let Some(expiry) =
                    entry.expiry(self.config.idle_timeout, self.config.life_timeout, now)
                {
                    expired.push((idle.swap_remove(index), expiry));
                } else if !entry.is_healthy() {
                    dead.push(idle.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            (expired, dead)
        };

        let removed = expired.len() + dead.len();
        for (entry, expiry) in expired {
            self.evict(entry, expiry);
        }
        for entry in dead {
            self.destroy_entry(entry);
        }
        removed
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(shutdown_tx) = lock(&self.watchdog).take() {
            let _ = shutdown_tx.send(true);
        }
        // Wake callers waiting for admission so they see the closed pool.
        self.slot_released.notify_all();

        let idle: Vec<PooledEntry> = lock(&self.idle).drain(..).collect();
        for entry in idle {
            self.destroy_entry(entry);
        }
        info!("Connection pool closed");
    }
}

/// Periodically evicts expired idle entries until the pool goes away.
async fn watchdog_loop(
    pool: Weak<PoolInner>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Pool watchdog received shutdown signal");
                    return;
                }
            }
        }

        let Some(pool) = pool.upgrade() else {
            return;
        };
        let removed = pool.sweep(Instant::now());
        if removed > 0 {
            debug!(removed = removed, "Pool watchdog evicted idle connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IoConfig, ServerConfig};
    use crate::connection::Connection;
    use crate::server::Server;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    impl Handler for Echo {
        fn on_data(&mut self, connection: &Connection) -> Result<()> {
            let line = connection.read_string_by_delimiter("\n", 1024)?;
            connection.write(format!("{line}\n"))?;
            Ok(())
        }
    }

    fn echo_server() -> Server {
        let config = ServerConfig::new("127.0.0.1", 0)
            .with_io(IoConfig::default().with_dispatchers(1).with_workers(1, 8));
        let server = Server::bind(config, || Echo).unwrap();
        server.start().unwrap();
        server
    }

    fn pool_config() -> PoolConfig {
        PoolConfig::default().with_io(IoConfig::default().with_dispatchers(1).with_workers(1, 8))
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn round_trip(connection: &Connection, text: &str) -> String {
        connection.write(format!("{text}\n")).unwrap();
        connection
            .blocking(Duration::from_secs(5))
            .read_string_by_delimiter("\n", 1024)
            .unwrap()
    }

    #[test]
    fn test_returned_connection_is_reused() {
        let server = echo_server();
        let pool = ConnectionPool::new(pool_config()).unwrap();

        let first = pool.get(server.local_addr(), None).unwrap();
        assert_eq!(round_trip(&first, "one"), "one");
        let id = first.id();
        first.close();
        assert_eq!(pool.stats().idle, 1);

        let second = pool.get(server.local_addr(), None).unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.usage_count(), 2);
        assert_eq!(round_trip(&second, "two"), "two");
        drop(second);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(server.stats().connections_opened.load(Ordering::Relaxed), 1);
        pool.close();
    }

    #[test]
    fn test_max_active_fails_fast() {
        let server = echo_server();
        let pool = ConnectionPool::new(pool_config().with_max_active(2)).unwrap();

        let first = pool.get(server.local_addr(), None).unwrap();
        let _second = pool.get(server.local_addr(), None).unwrap();
        let start = Instant::now();
        let err = pool.get(server.local_addr(), None).unwrap_err();
        assert!(matches!(err, Error::MaxConnectionsExceeded(_)));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(pool.stats().rejected, 1);

        first.close();
        let third = pool.get(server.local_addr(), None).unwrap();
        assert_eq!(pool.stats().active, 2);
        drop(third);
        pool.close();
    }

    #[test]
    fn test_max_active_per_server() {
        let server = echo_server();
        let other = echo_server();
        let pool = ConnectionPool::new(pool_config().with_max_active_per_server(1)).unwrap();

        let _first = pool.get(server.local_addr(), None).unwrap();
        assert!(matches!(
            pool.get(server.local_addr(), None),
            Err(Error::MaxConnectionsExceeded(_))
        ));
        let _elsewhere = pool.get(other.local_addr(), None).unwrap();
        pool.close();
    }

    /// Stops the pool watchdog so only checkout validation evicts.
    fn stop_watchdog(pool: &ConnectionPool) {
        if let Some(shutdown_tx) = lock(&pool.inner.watchdog).take() {
            shutdown_tx.send(true).unwrap();
        }
    }

    #[test]
    fn test_waiting_caller_gets_released_connection() {
        let server = echo_server();
        let pool = ConnectionPool::new(
            pool_config()
                .with_max_active(1)
                .with_max_wait(Duration::from_secs(5)),
        )
        .unwrap();

        for _ in 0..50 {
            let held = pool.get(server.local_addr(), None).unwrap();
            let id = held.id();
            let releaser = thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                drop(held);
            });

            let next = pool.get(server.local_addr(), None).unwrap();
            assert_eq!(next.id(), id);
            releaser.join().unwrap();
            drop(next);
        }

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(server.stats().connections_opened.load(Ordering::Relaxed), 1);
        pool.close();
    }

    #[test]
    fn test_expired_idle_entry_is_never_handed_out() {
        let server = echo_server();
        let pool =
            ConnectionPool::new(pool_config().with_idle_timeout(Duration::from_millis(50))).unwrap();
        stop_watchdog(&pool);

        let first = pool.get(server.local_addr(), None).unwrap();
        let id = first.id();
        first.close();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.stats().idle, 1);

        let second = pool.get(server.local_addr(), None).unwrap();
        assert_ne!(second.id(), id);
        let stats = pool.stats();
        assert_eq!(stats.idle_evictions, 1);
        assert_eq!(stats.created, 2);
        drop(second);
        pool.close();
    }

    #[test]
    fn test_watchdog_period_follows_pool_timeouts() {
        let server = echo_server();
        // The 30s fallback period would never see this timeout in time.
        let pool =
            ConnectionPool::new(pool_config().with_idle_timeout(Duration::from_millis(100))).unwrap();

        pool.get(server.local_addr(), None).unwrap().close();
        assert_eq!(pool.stats().idle, 1);
        assert!(wait_until(Duration::from_secs(1), || pool.stats().idle == 0));
        assert_eq!(pool.stats().idle_evictions, 1);
        pool.close();
    }

    #[test]
    fn test_watchdog_evicts_idle_entries() {
        let server = echo_server();
        let pool =
            ConnectionPool::new(pool_config().with_idle_timeout(Duration::from_millis(50))).unwrap();

        let connection = pool.get(server.local_addr(), None).unwrap();
        let physical = Connection::clone(&connection);
        connection.close();
        assert_eq!(pool.stats().idle, 1);

        assert!(wait_until(Duration::from_secs(2), || pool.stats().idle == 0));
        assert_eq!(pool.stats().idle_evictions, 1);
        assert!(!physical.is_open());
        pool.close();
    }

    #[test]
    fn test_lifetime_eviction_on_return() {
        let server = echo_server();
        let pool =
            ConnectionPool::new(pool_config().with_life_timeout(Duration::from_millis(50))).unwrap();

        let connection = pool.get(server.local_addr(), None).unwrap();
        thread::sleep(Duration::from_millis(80));
        connection.close();

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.lifetime_evictions, 1);
        pool.close();
    }

    #[test]
    fn test_destroy_and_non_reusable() {
        let server = echo_server();
        let pool = ConnectionPool::new(pool_config()).unwrap();

        let first = pool.get(server.local_addr(), None).unwrap();
        let physical = Connection::clone(&first);
        first.destroy();
        assert!(!physical.is_open());

        let mut second = pool.get(server.local_addr(), None).unwrap();
        second.set_reusable(false);
        assert!(!second.is_reusable());
        drop(second);

        let stats = pool.stats();
        assert_eq!(stats.destroyed, 2);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.active, 0);
        pool.close();
    }

    #[test]
    fn test_max_idle_bounds_idle_set() {
        let server = echo_server();
        let pool = ConnectionPool::new(pool_config().with_max_idle(1)).unwrap();

        let first = pool.get(server.local_addr(), None).unwrap();
        let second = pool.get(server.local_addr(), None).unwrap();
        first.close();
        second.close();

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.destroyed, 1);
        pool.close();
    }

    #[test]
    fn test_secure_and_plain_are_pooled_apart() {
        let server = echo_server();
        let pool = ConnectionPool::new(pool_config()).unwrap();
        pool.get(server.local_addr(), None).unwrap().close();

        let err = pool
            .get_with(
                server.local_addr(),
                true,
                None,
                Duration::from_millis(500),
                Duration::ZERO,
            )
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().active, 0);
        pool.close();
    }

    #[test]
    fn test_connect_failure_releases_slot() {
        let address = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let pool = ConnectionPool::new(
            pool_config()
                .with_max_active(1)
                .with_connect_timeout(Duration::from_millis(200)),
        )
        .unwrap();

        assert!(pool.get(address, None).is_err());
        let stats = pool.stats();
        assert_eq!(stats.creation_errors, 1);
        assert_eq!(stats.active, 0);
        pool.close();
    }

    #[test]
    fn test_register_failure_counts_as_creation_error() {
        let server = echo_server();
        let pool = ConnectionPool::new(pool_config().with_max_active(1)).unwrap();
        pool.context().close();

        let err = pool.get(server.local_addr(), None).unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        let stats = pool.stats();
        assert_eq!(stats.creation_errors, 1);
        assert_eq!(stats.created, 0);
        assert_eq!(stats.active, 0);
        pool.close();
    }

    #[test]
    fn test_checkout_delivers_connect_callback() {
        struct Connects(Arc<AtomicUsize>);

        impl Handler for Connects {
            fn on_connect(&mut self, _connection: &Connection) -> Result<()> {
                self.0.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }

        let server = echo_server();
        let pool = ConnectionPool::new(pool_config()).unwrap();
        let connects = Arc::new(AtomicUsize::new(0));

        let first = pool
            .get(server.local_addr(), Some(Box::new(Connects(Arc::clone(&connects)))))
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || connects.load(Ordering::Acquire) == 1));
        first.close();

        let second = pool
            .get(server.local_addr(), Some(Box::new(Connects(Arc::clone(&connects)))))
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || connects.load(Ordering::Acquire) == 2));
        drop(second);
        pool.close();
    }

    #[test]
    fn test_closed_pool() {
        let server = echo_server();
        let pool = ConnectionPool::new(pool_config()).unwrap();
        let outstanding = pool.get(server.local_addr(), None).unwrap();
        pool.get(server.local_addr(), None).unwrap().close();

        pool.close();
        pool.close();
        assert!(!pool.is_open());
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(
            pool.get(server.local_addr(), None),
            Err(Error::PoolClosed)
        ));

        let physical = Connection::clone(&outstanding);
        drop(outstanding);
        assert!(!physical.is_open());
    }
}
