//! Configuration
//!
//! Plain structs with defaults and chainable `with_*` setters.
//!
//! ```text
//!   ServerConfig ─┬─ host, port
//!                 ├─ IoConfig ───────── dispatchers, workers, callback mode, memory
//!                 └─ ConnectionOptions ─ timeouts, autoflush, encoding, rate, secure
//!
//!   PoolConfig ───┬─ IoConfig
//!                 ├─ ConnectionOptions
//!                 └─ admission limits, pool timeouts, connect retry policy
//! ```

use crate::error::{Error, Result};
use crate::memory::MemoryConfig;
use crate::transport::SecureContext;
use bytes::Bytes;
use std::time::Duration;

/// Where application callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackMode {
    /// On the dispatcher thread that observed the event
    Inline,
    /// On the bounded worker pool (default)
    #[default]
    WorkerPool,
}

/// Text encoding used by the string read/write helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

impl Encoding {
    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::Encoding(e.to_string())),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    pub fn encode(&self, text: &str) -> Result<Bytes> {
        match self {
            Encoding::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c))
                        .map_err(|_| Error::Encoding(format!("{:?} is not representable in Latin-1", c)))
                })
                .collect::<Result<Vec<u8>>>()
                .map(Bytes::from),
        }
    }
}

/// Threading and memory settings shared by everything built on one
/// [`IoContext`](crate::IoContext).
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Number of dispatcher threads (default: available parallelism)
    pub dispatchers: usize,

    /// Core worker threads for callbacks (default: 2)
    pub worker_threads: usize,

    /// Upper bound of concurrently running callbacks (default: 64)
    pub max_worker_threads: usize,

    pub callback_mode: CallbackMode,

    /// Consecutive socket reads per readiness event (default: 16)
    pub reads_per_event: usize,

    /// Period of the connection timeout watchdog when no timeout gives a
    /// shorter one (default: 1s)
    pub watchdog_period: Duration,

    pub memory: MemoryConfig,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            dispatchers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            worker_threads: 2,
            max_worker_threads: 64,
            callback_mode: CallbackMode::default(),
            reads_per_event: 16,
            watchdog_period: Duration::from_secs(1),
            memory: MemoryConfig::default(),
        }
    }
}

impl IoConfig {
    pub fn with_dispatchers(mut self, dispatchers: usize) -> Self {
        self.dispatchers = dispatchers.max(1);
        self
    }

    pub fn with_workers(mut self, core: usize, max: usize) -> Self {
        self.worker_threads = core.max(1);
        self.max_worker_threads = max.max(self.worker_threads);
        self
    }

    pub fn with_callback_mode(mut self, mode: CallbackMode) -> Self {
        self.callback_mode = mode;
        self
    }

    /// Capacity of a freshly allocated read segment.
    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.memory.segment_size = size.max(1);
        self
    }

    pub fn with_watchdog_period(mut self, period: Duration) -> Self {
        self.watchdog_period = period;
        self
    }
}

/// Per-connection defaults applied when a connection is created.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Close after this long without traffic (default: never)
    pub idle_timeout: Option<Duration>,

    /// Close this long after creation (default: never)
    pub connection_timeout: Option<Duration>,

    /// Flush after every write (default: true)
    pub autoflush: bool,

    pub encoding: Encoding,

    /// Write rate limit in bytes per second (default: unlimited)
    pub write_rate: Option<u32>,

    /// Secure transport for the connection (default: plain TCP)
    pub secure: Option<SecureContext>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            connection_timeout: None,
            autoflush: true,
            encoding: Encoding::default(),
            write_rate: None,
            secure: None,
        }
    }
}

impl ConnectionOptions {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn with_autoflush(mut self, autoflush: bool) -> Self {
        self.autoflush = autoflush;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_write_rate(mut self, bytes_per_sec: u32) -> Self {
        self.write_rate = Some(bytes_per_sec);
        self
    }

    pub fn with_secure(mut self, context: SecureContext) -> Self {
        self.secure = Some(context);
        self
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    pub io: IoConfig,
    pub connection: ConnectionOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            io: IoConfig::default(),
            connection: ConnectionOptions::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_io(mut self, io: IoConfig) -> Self {
        self.io = io;
        self
    }

    pub fn with_connection(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }

    /// Shortest period at which the timeout watchdog has to run.
    pub fn watchdog_period(&self) -> Duration {
        crate::server::watchdog::period_for(
            self.connection.idle_timeout,
            self.connection.connection_timeout,
            self.io.watchdog_period,
        )
    }
}

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub io: IoConfig,

    /// Options for every physical connection the pool opens
    pub connection: ConnectionOptions,

    /// Maximum checked-out connections (default: unlimited)
    pub max_active: usize,

    /// Maximum checked-out connections per address (default: unlimited)
    pub max_active_per_server: usize,

    /// Maximum idle connections kept for reuse (default: unlimited)
    pub max_idle: usize,

    /// How long a rejected `get` may wait for a free slot (default: zero,
    /// fail fast)
    pub max_wait: Duration,

    /// Evict idle connections unused for this long (default: never)
    pub idle_timeout: Option<Duration>,

    /// Evict connections this old (default: never)
    pub life_timeout: Option<Duration>,

    /// Overall bound for opening a new connection (default: 500ms)
    pub connect_timeout: Duration,

    /// Connect attempts before giving up (default: 3)
    pub connect_trials: u32,

    /// Wait before the first retry; doubled for each further retry
    /// (default: 10ms)
    pub retry_backoff: Duration,

    /// How often the pool watchdog evicts expired idle connections when
    /// neither pool timeout is set (default: 30s). With a timeout set, the
    /// watchdog runs at a fifth of the shorter one.
    pub watchdog_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            io: IoConfig::default(),
            connection: ConnectionOptions::default(),
            max_active: usize::MAX,
            max_active_per_server: usize::MAX,
            max_idle: usize::MAX,
            max_wait: Duration::ZERO,
            idle_timeout: None,
            life_timeout: None,
            connect_timeout: Duration::from_millis(500),
            connect_trials: 3,
            retry_backoff: Duration::from_millis(10),
            watchdog_period: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_io(mut self, io: IoConfig) -> Self {
        self.io = io;
        self
    }

    pub fn with_connection(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }

    pub fn with_max_active(mut self, max: usize) -> Self {
        self.max_active = max;
        self
    }

    pub fn with_max_active_per_server(mut self, max: usize) -> Self {
        self.max_active_per_server = max;
        self
    }

    pub fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle = max;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_life_timeout(mut self, timeout: Duration) -> Self {
        self.life_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_watchdog_period(mut self, period: Duration) -> Self {
        self.watchdog_period = period;
        self
    }
}
