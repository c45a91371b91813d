//! I/O Context
//!
//! The explicit bundle of shared machinery behind servers, pools and client
//! connections: dispatcher threads, the segment pool, the callback worker
//! runtime, connection statistics and the timeout watchdog.
//!
//! ```text
//! ┌──────────────────────────── IoContext ────────────────────────────┐
//! │  DispatcherPool   MemoryManager   WorkerPool   ConnectionStats    │
//! │        ▲                              │                           │
//! │        └──── TimeoutWatchdog (task on the worker runtime)         │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Clones share one context. It is closed by [`IoContext::close`] or when
//! the last clone is dropped.

use crate::config::{ConnectionOptions, IoConfig};
use crate::connection::core::Endpoint;
use crate::connection::{Connection, ConnectionStats, Handler};
use crate::error::{Error, Result};
use crate::memory::MemoryManager;
use crate::reactor::{DispatcherPool, Executor, WorkerPool};
use crate::server::watchdog::{CheckPeriod, TimeoutWatchdog};
use crate::sync::lock;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct IoContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: IoConfig,
    memory: MemoryManager,
    workers: WorkerPool,
    dispatchers: Arc<DispatcherPool>,
    stats: Arc<ConnectionStats>,
    watchdog: Mutex<Option<TimeoutWatchdog>>,
    check_period: Arc<CheckPeriod>,
    closed: AtomicBool,
}

impl IoContext {
    /// Starts the dispatchers, the worker runtime and the watchdog.
    pub fn new(config: IoConfig) -> Result<Self> {
        let memory = MemoryManager::new(config.memory.clone());
        let workers = WorkerPool::new(&config)?;
        let dispatchers = Arc::new(DispatcherPool::new(
            config.dispatchers,
            &memory,
            config.reads_per_event,
        )?);
        let watchdog = TimeoutWatchdog::start(
            workers.handle(),
            Arc::clone(&dispatchers),
            config.watchdog_period,
        );
        let check_period = Arc::clone(watchdog.period());

        info!(
            dispatchers = dispatchers.len(),
            callback_mode = ?config.callback_mode,
            "I/O context started"
        );
        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                memory,
                workers,
                dispatchers,
                stats: Arc::new(ConnectionStats::new()),
                watchdog: Mutex::new(Some(watchdog)),
                check_period,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &IoConfig {
        &self.inner.config
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.inner.memory
    }

    pub fn dispatchers(&self) -> &DispatcherPool {
        &self.inner.dispatchers
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.inner.stats
    }

    /// The executor new connections deliver their callbacks on.
    pub fn executor(&self) -> Executor {
        self.inner.workers.executor(self.inner.config.callback_mode)
    }

    /// Wraps a connected socket and hands it to the next dispatcher.
    pub(crate) fn register(
        &self,
        stream: TcpStream,
        server_side: bool,
        options: &ConnectionOptions,
        handler: Option<Box<dyn Handler>>,
    ) -> Result<Connection> {
        if self.is_closed() {
            return Err(Error::IllegalState("I/O context is closed"));
        }

        let endpoint = Endpoint {
            local: stream.local_addr()?,
            peer: stream.peer_addr()?,
            server_side,
        };
        let connection = Connection::create(
            endpoint,
            options,
            handler,
            self.executor(),
            Arc::clone(&self.inner.stats),
            Some(Arc::clone(&self.inner.check_period)),
        )?;
        self.inner
            .dispatchers
            .next_dispatcher()
            .register(stream, connection.clone())?;
        Ok(connection)
    }

    /// Opens a client connection to `address`.
    pub fn connect(
        &self,
        address: SocketAddr,
        timeout: Duration,
        options: &ConnectionOptions,
        handler: Option<Box<dyn Handler>>,
    ) -> Result<Connection> {
        let stream = TcpStream::connect_timeout(&address, timeout).map_err(|err| {
            match err.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::ConnectTimeout {
                    address,
                    reason: err.to_string(),
                },
                _ => Error::Io(err),
            }
        })?;
        stream.set_nodelay(true)?;

        let connection = self.register(stream, false, options, handler)?;
        debug!(connection = connection.id(), peer = %address, "Connected");
        Ok(connection)
    }

    /// Snapshot of every open connection.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.dispatchers.connections()
    }

    /// Stops the watchdog and destroys every connection. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl ContextInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(watchdog) = lock(&self.watchdog).take() {
            watchdog.stop();
        }
        self.dispatchers.close();
        info!("I/O context closed");
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("dispatchers", &self.inner.dispatchers.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
