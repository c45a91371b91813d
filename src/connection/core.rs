//! The application-facing connection.
//!
//! ## Data Flow
//!
//! ```text
//!            write*/flush                         dispatcher task
//!   app ──> WriteQueue ──> TransportChain ──> wire ByteQueue ──> socket
//!   app <── ReadQueue  <── TransportChain <────────────────────── socket
//!            read*                receive()
//! ```
//!
//! All per-connection state lives behind one mutex that application threads,
//! callback workers and the dispatcher task share. Reads wait on a condvar
//! in blocking mode; the dispatcher task is woken through a `Notify` when
//! new wire bytes are queued or the connection is closed.
//!
//! ## Lifecycle
//!
//! ```text
//!   Open ──close()──> Closing ──wire drained──> Closed
//!     │                                           ▲
//!     └──────────── close_now() / I/O error ──────┘
//! ```

use super::events::{self, Event, EventQueue};
use super::handler::Handler;
use super::stats::ConnectionStats;
use crate::buffer::{queue::coalesce, BufferError, ByteQueue, ReadQueue, WriteQueue};
use crate::config::{ConnectionOptions, Encoding};
use crate::error::{Error, Result};
use crate::reactor::Executor;
use crate::server::watchdog::CheckPeriod;
use crate::sync::{lock, wait_timeout};
use crate::transport::{SecureStage, Stage, StageKind, ThrottledWrite, TransportChain};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Maximum length for delimiter reads that should not be bounded.
pub const UNLIMITED: usize = usize::MAX;

/// Longest single wait of a blocking read before it re-checks its state.
const BLOCKING_POLL: Duration = Duration::from_millis(50);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    /// Close requested, remaining output still draining
    Closing,
    Closed,
}

/// How reads behave when not enough data is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Fail with `BufferUnderflow`
    NonBlocking,
    /// Wait up to the given timeout, then fail with `Timeout`
    Blocking(Duration),
}

/// Socket addresses of a connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Endpoint {
    pub local: SocketAddr,
    pub peer: SocketAddr,
    pub server_side: bool,
}

/// What the dispatcher task needs to decide its next wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoPlan {
    pub phase: Phase,
    pub want_write: bool,
    pub next_release: Option<Instant>,
}

pub(crate) struct State {
    incoming: ReadQueue,
    outgoing: WriteQueue,
    wire: ByteQueue,
    chain: TransportChain,
    phase: Phase,
    end_of_stream: bool,
    autoflush: bool,
    encoding: Encoding,
    idle_timeout: Option<Duration>,
    connection_timeout: Option<Duration>,
    connect_notified: bool,
    idle_fired_at: Option<u64>,
    lifetime_fired: bool,
    finished: bool,
}

impl State {
    /// Moves staged output through the chain onto the wire queue.
    fn flush(&mut self) -> Result<()> {
        let staged: Vec<Bytes> = self.outgoing.take_all().into();
        let wire = self.chain.write(staged, Instant::now())?;
        self.wire.append_all(wire);
        Ok(())
    }

    /// Flushes staged output, closes the chain and enters `Closing`.
    fn begin_close(&mut self) -> Result<()> {
        self.phase = Phase::Closing;
        self.flush()?;
        let wire = self.chain.close(Instant::now())?;
        self.wire.append_all(wire);
        Ok(())
    }

    fn abort(&mut self) {
        self.phase = Phase::Closed;
        self.outgoing.clear();
        self.wire.clear();
    }

    /// Returns true exactly once, when the connect callback is due.
    fn take_connect(&mut self) -> bool {
        if self.connect_notified || !self.chain.is_established() {
            return false;
        }
        self.connect_notified = true;
        true
    }
}

pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    endpoint: Endpoint,
    created_at: Instant,
    state: Mutex<State>,
    readable: Condvar,
    pub(crate) wakeup: Notify,
    /// Milliseconds since `created_at` of the last byte sent or received
    last_activity: AtomicU64,
    pub(crate) events: Mutex<EventQueue>,
    pub(crate) executor: Executor,
    stats: Arc<ConnectionStats>,
    defaults: ConnectionOptions,
    /// Watchdog period lowered to fit this connection's timeouts
    check_period: Option<Arc<CheckPeriod>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn touch(&self) {
        let millis = self.created_at.elapsed().as_millis() as u64;
        self.last_activity.store(millis, Ordering::Relaxed);
    }

    fn last_activity(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_activity.load(Ordering::Relaxed))
    }

    /// Runs once the dispatcher task owns the socket.
    pub(crate) fn on_attached(self: &Arc<Self>) -> Result<()> {
        let connected = {
            let mut state = self.lock_state();
            let wire = state.chain.pump(Instant::now())?;
            state.wire.append_all(wire);
            state.take_connect()
        };
        debug!(
            connection = self.id,
            peer = %self.endpoint.peer,
            server_side = self.endpoint.server_side,
            "Connection attached"
        );
        if connected {
            events::dispatch(self, Event::Connect);
        }
        Ok(())
    }

    pub(crate) fn io_plan(&self) -> IoPlan {
        let state = self.lock_state();
        IoPlan {
            phase: state.phase,
            want_write: !state.wire.is_empty(),
            next_release: state.chain.next_release(),
        }
    }

    /// Accepts bytes read from the socket.
    pub(crate) fn receive(self: &Arc<Self>, data: Vec<Bytes>) -> Result<()> {
        let bytes: usize = data.iter().map(Bytes::len).sum();
        self.stats.bytes_read(bytes);
        self.touch();

        let (delivered, connected) = {
            let mut state = self.lock_state();
            let plaintext = state.chain.receive(data)?;
            let wire = state.chain.pump(Instant::now())?;
            state.wire.append_all(wire);
            let delivered = !plaintext.is_empty();
            state.incoming.append_all(plaintext);
            (delivered, state.take_connect())
        };

        trace!(connection = self.id, bytes = bytes, "Read data");
        if delivered {
            self.readable.notify_all();
        }
        if connected {
            events::dispatch(self, Event::Connect);
        }
        if delivered {
            events::dispatch(self, Event::Data);
        }
        Ok(())
    }

    /// The peer closed its side of the stream.
    pub(crate) fn on_end_of_stream(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            state.end_of_stream = true;
            if state.phase == Phase::Open && state.begin_close().is_err() {
                state.abort();
            }
        }
        debug!(connection = self.id, "Peer closed the stream");
        self.readable.notify_all();
        events::dispatch(self, Event::Data);
    }

    /// Lets the chain release paced bytes.
    pub(crate) fn pump(&self) -> Result<()> {
        let mut state = self.lock_state();
        let wire = state.chain.pump(Instant::now())?;
        state.wire.append_all(wire);
        Ok(())
    }

    /// Takes up to `max_bytes` of wire bytes for the socket.
    pub(crate) fn take_wire(&self, max_bytes: usize) -> Vec<Bytes> {
        let mut state = self.lock_state();
        let len = state.wire.len().min(max_bytes);
        state.wire.read_segments(len).unwrap_or_default()
    }

    /// Puts back wire bytes the socket did not accept.
    pub(crate) fn restore_wire(&self, segments: VecDeque<Bytes>) {
        let mut state = self.lock_state();
        if state.phase != Phase::Closed {
            state.wire.add_first(segments);
        }
    }

    pub(crate) fn wrote(&self, bytes: usize) {
        if bytes > 0 {
            self.stats.bytes_written(bytes);
            self.touch();
            trace!(connection = self.id, bytes = bytes, "Wrote data");
        }
    }

    /// Final step of the dispatcher task: marks the connection closed and
    /// delivers the disconnect callback once.
    pub(crate) fn finish(self: &Arc<Self>, outcome: Result<()>) {
        let first = {
            let mut state = self.lock_state();
            state.abort();
            !std::mem::replace(&mut state.finished, true)
        };
        self.readable.notify_all();
        if !first {
            return;
        }

        match outcome {
            Ok(()) => debug!(connection = self.id, "Connection closed"),
            Err(Error::Io(ref err)) if err.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(connection = self.id, "Connection reset by peer")
            }
            Err(err) => debug!(connection = self.id, error = %err, "Connection closed with error"),
        }
        self.stats.connection_closed();
        events::dispatch(self, Event::Disconnect);
    }
}

/// A handle to one connection.
///
/// Cloning is cheap and all clones refer to the same connection. The read
/// mode belongs to the handle: [`Connection::blocking`] returns a handle on
/// the same connection whose reads wait for data.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    mode: ReadMode,
}

impl Connection {
    pub(crate) fn create(
        endpoint: Endpoint,
        options: &ConnectionOptions,
        handler: Option<Box<dyn Handler>>,
        executor: Executor,
        stats: Arc<ConnectionStats>,
        check_period: Option<Arc<CheckPeriod>>,
    ) -> Result<Self> {
        let now = Instant::now();
        let mut chain = TransportChain::new();
        if let Some(rate) = options.write_rate {
            chain.insert(Stage::Throttle(ThrottledWrite::new(rate, now)), now)?;
        }
        if let Some(secure) = &options.secure {
            chain.insert(Stage::Secure(secure.create_stage()?), now)?;
        }

        let state = State {
            incoming: ReadQueue::new(),
            outgoing: WriteQueue::new(),
            wire: ByteQueue::new(),
            chain,
            phase: Phase::Open,
            end_of_stream: false,
            autoflush: options.autoflush,
            encoding: options.encoding,
            idle_timeout: options.idle_timeout,
            connection_timeout: options.connection_timeout,
            connect_notified: false,
            idle_fired_at: None,
            lifetime_fired: false,
            finished: false,
        };

        if let Some(period) = &check_period {
            period.fit(options.idle_timeout, options.connection_timeout);
        }

        stats.connection_opened();
        let shared = Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            created_at: now,
            state: Mutex::new(state),
            readable: Condvar::new(),
            wakeup: Notify::new(),
            last_activity: AtomicU64::new(0),
            events: Mutex::new(EventQueue::new(handler)),
            executor,
            stats,
            defaults: options.clone(),
            check_period,
        };
        Ok(Self::from_shared(Arc::new(shared)))
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            mode: ReadMode::NonBlocking,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// A connection that is not attached to any socket.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::detached_with(&ConnectionOptions::default())
    }

    #[cfg(test)]
    pub(crate) fn detached_with(options: &ConnectionOptions) -> Self {
        let address = SocketAddr::from(([127, 0, 0, 1], 0));
        let endpoint = Endpoint {
            local: address,
            peer: address,
            server_side: false,
        };
        Self::create(
            endpoint,
            options,
            None,
            Executor::Inline,
            Arc::new(ConnectionStats::new()),
            None,
        )
        .unwrap()
    }

    /// Bytes currently queued on the wire side, for tests.
    #[cfg(test)]
    pub(crate) fn wire_bytes(&self) -> Vec<u8> {
        self.shared.lock_state().wire.to_vec()
    }

    // ---- identity -------------------------------------------------------

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.endpoint.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.endpoint.peer
    }

    pub fn is_server_side(&self) -> bool {
        self.shared.endpoint.server_side
    }

    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    /// Time since the last byte was sent or received.
    pub fn idle_time(&self) -> Duration {
        self.shared.last_activity().elapsed()
    }

    pub fn read_mode(&self) -> ReadMode {
        self.mode
    }

    /// A handle on this connection whose reads block up to `timeout`.
    pub fn blocking(&self, timeout: Duration) -> Connection {
        Connection {
            shared: Arc::clone(&self.shared),
            mode: ReadMode::Blocking(timeout),
        }
    }

    /// A handle on this connection whose reads never block.
    pub fn non_blocking(&self) -> Connection {
        Connection {
            shared: Arc::clone(&self.shared),
            mode: ReadMode::NonBlocking,
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock_state().phase
    }

    pub fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    /// True once the peer has closed and every queued byte was consumed.
    pub fn is_end_of_stream(&self) -> bool {
        let state = self.shared.lock_state();
        state.end_of_stream && state.incoming.is_empty()
    }

    // ---- reads ----------------------------------------------------------

    /// Runs `op` against the incoming queue until it succeeds, applying
    /// the read mode when not enough data is queued.
    fn read_with<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut ReadQueue) -> std::result::Result<T, BufferError>,
    {
        let deadline = match self.mode {
            ReadMode::Blocking(timeout) => Some((Instant::now() + timeout, timeout)),
            ReadMode::NonBlocking => None,
        };

        let mut state = self.shared.lock_state();
        loop {
            match op(&mut state.incoming) {
                Ok(value) => return Ok(value),
                Err(BufferError::Underflow { .. }) => {}
                Err(err) => return Err(err.into()),
            }

            if state.end_of_stream {
                return Err(Error::EndOfStream);
            }
            if state.phase != Phase::Open {
                return Err(Error::ClosedConnection);
            }
            let Some((deadline, timeout)) = deadline else {
                return Err(Error::BufferUnderflow);
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            state = wait_timeout(
                &self.shared.readable,
                state,
                (deadline - now).min(BLOCKING_POLL),
            );
        }
    }

    /// Number of bytes that can be read without waiting.
    pub fn available(&self) -> usize {
        self.shared.lock_state().incoming.len()
    }

    /// Position of `delimiter` in the queued bytes, without consuming.
    pub fn index_of(&self, delimiter: impl AsRef<[u8]>, max_length: usize) -> Result<usize> {
        let delimiter = delimiter.as_ref();
        self.read_with(|queue| {
            queue
                .index_of(delimiter, max_length)?
                .ok_or(BufferError::Underflow {
                    requested: delimiter.len(),
                    available: 0,
                })
        })
    }

    pub fn read_bytes_by_length(&self, length: usize) -> Result<Bytes> {
        self.read_with(|queue| queue.read(length))
    }

    pub fn read_segments_by_length(&self, length: usize) -> Result<Vec<Bytes>> {
        self.read_with(|queue| queue.read_segments(length))
    }

    /// Reads up to `delimiter`, which is consumed but not returned.
    ///
    /// Fails with `MaxSizeExceeded` if more than `max_length` bytes precede
    /// the delimiter; the queued bytes are left in place.
    pub fn read_segments_by_delimiter(
        &self,
        delimiter: impl AsRef<[u8]>,
        max_length: usize,
    ) -> Result<Vec<Bytes>> {
        let delimiter = delimiter.as_ref();
        self.read_with(|queue| {
            queue
                .read_by_delimiter(delimiter, max_length)?
                .ok_or(BufferError::Underflow {
                    requested: delimiter.len(),
                    available: 0,
                })
        })
    }

    pub fn read_bytes_by_delimiter(
        &self,
        delimiter: impl AsRef<[u8]>,
        max_length: usize,
    ) -> Result<Bytes> {
        self.read_segments_by_delimiter(delimiter, max_length)
            .map(coalesce)
    }

    pub fn read_string_by_delimiter(
        &self,
        delimiter: impl AsRef<[u8]>,
        max_length: usize,
    ) -> Result<String> {
        let bytes = self.read_bytes_by_delimiter(delimiter, max_length)?;
        self.encoding().decode(&bytes)
    }

    pub fn read_string_by_length(&self, length: usize) -> Result<String> {
        let bytes = self.read_bytes_by_length(length)?;
        self.encoding().decode(&bytes)
    }

    /// Removes every queued byte. Never waits and never underflows.
    pub fn read_available(&self) -> Result<Vec<Bytes>> {
        let mut state = self.shared.lock_state();
        if state.incoming.is_empty() {
            if state.end_of_stream {
                return Err(Error::EndOfStream);
            }
            if state.phase != Phase::Open {
                return Err(Error::ClosedConnection);
            }
        }
        Ok(state.incoming.read_all())
    }

    pub(crate) fn read_progress(&self) -> (usize, u64) {
        let state = self.shared.lock_state();
        (state.incoming.len(), state.incoming.insert_version())
    }

    // ---- read marks -----------------------------------------------------

    /// Starts recording consumed bytes so they can be restored.
    pub fn mark_read(&self) {
        self.shared.lock_state().incoming.mark();
    }

    /// Restores every byte consumed since [`mark_read`](Self::mark_read).
    pub fn reset_to_read_mark(&self) -> bool {
        self.shared.lock_state().incoming.reset_to_mark()
    }

    pub fn remove_read_mark(&self) {
        self.shared.lock_state().incoming.remove_mark();
    }

    // ---- writes ---------------------------------------------------------

    /// Stages a segment, flushing it if autoflush is on and no write mark
    /// is held.
    pub fn write_bytes(&self, data: Bytes) -> Result<usize> {
        let len = data.len();
        let flushed = {
            let mut state = self.shared.lock_state();
            if state.phase != Phase::Open {
                return Err(Error::ClosedConnection);
            }
            state.outgoing.append(data);
            if state.autoflush && !state.outgoing.is_marked() {
                if let Err(err) = state.flush() {
                    state.abort();
                    drop(state);
                    self.wake();
                    return Err(err);
                }
                true
            } else {
                false
            }
        };
        if flushed {
            self.shared.wakeup.notify_one();
        }
        Ok(len)
    }

    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<usize> {
        self.write_bytes(Bytes::copy_from_slice(data.as_ref()))
    }

    /// Writes `text` in the connection's encoding.
    pub fn write_str(&self, text: &str) -> Result<usize> {
        let bytes = self.encoding().encode(text)?;
        self.write_bytes(bytes)
    }

    /// Hands all staged output to the transport. Removes a write mark.
    pub fn flush(&self) -> Result<()> {
        {
            let mut state = self.shared.lock_state();
            if state.phase != Phase::Open {
                if state.outgoing.is_empty() {
                    return Ok(());
                }
                return Err(Error::ClosedConnection);
            }
            if let Err(err) = state.flush() {
                state.abort();
                drop(state);
                self.wake();
                return Err(err);
            }
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    pub fn set_autoflush(&self, autoflush: bool) {
        self.shared.lock_state().autoflush = autoflush;
    }

    pub fn is_autoflush(&self) -> bool {
        self.shared.lock_state().autoflush
    }

    /// Bytes written by the application that have not reached the socket.
    pub fn pending_write_bytes(&self) -> usize {
        let state = self.shared.lock_state();
        state.outgoing.len() + state.chain.pending_outgoing() + state.wire.len()
    }

    // ---- write marks ----------------------------------------------------

    /// Marks the current end of staged output. Autoflush is suspended
    /// until the mark is reset, removed or flushed.
    pub fn mark_write(&self) {
        self.shared.lock_state().outgoing.mark();
    }

    /// Discards output staged since [`mark_write`](Self::mark_write).
    pub fn reset_to_write_mark(&self) -> bool {
        self.shared.lock_state().outgoing.reset_to_mark()
    }

    /// Removes the write mark, flushing if autoflush is on.
    pub fn remove_write_mark(&self) -> Result<()> {
        let autoflush = {
            let mut state = self.shared.lock_state();
            state.outgoing.remove_mark();
            state.autoflush
        };
        if autoflush {
            self.flush()?;
        }
        Ok(())
    }

    // ---- settings -------------------------------------------------------

    pub fn encoding(&self) -> Encoding {
        self.shared.lock_state().encoding
    }

    pub fn set_encoding(&self, encoding: Encoding) {
        self.shared.lock_state().encoding = encoding;
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.shared.lock_state().idle_timeout
    }

    /// Changes the idle timeout. The watchdog is sped up if it would
    /// check this timeout too rarely.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        {
            let mut state = self.shared.lock_state();
            state.idle_timeout = timeout;
            state.idle_fired_at = None;
        }
        self.fit_check_period(timeout, None);
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.shared.lock_state().connection_timeout
    }

    pub fn set_connection_timeout(&self, timeout: Option<Duration>) {
        {
            let mut state = self.shared.lock_state();
            state.connection_timeout = timeout;
            state.lifetime_fired = false;
        }
        self.fit_check_period(None, timeout);
    }

    fn fit_check_period(&self, idle: Option<Duration>, lifetime: Option<Duration>) {
        if let Some(period) = &self.shared.check_period {
            period.fit(idle, lifetime);
        }
    }

    /// Limits the write rate, or removes the limit with `None`.
    ///
    /// Bytes buffered by a previous limit are carried over, never dropped.
    pub fn set_write_rate(&self, bytes_per_sec: Option<u32>) -> Result<()> {
        {
            let mut state = self.shared.lock_state();
            if state.phase == Phase::Closed {
                return Err(Error::ClosedConnection);
            }
            let now = Instant::now();
            match bytes_per_sec {
                Some(rate) => match state.chain.throttle_mut() {
                    Some(throttle) => throttle.set_rate(rate),
                    None => state
                        .chain
                        .insert(Stage::Throttle(ThrottledWrite::new(rate, now)), now)?,
                },
                None => {
                    let wire = state.chain.remove(StageKind::Throttle, now)?;
                    state.wire.append_all(wire);
                }
            }
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    pub fn write_rate(&self) -> Option<u32> {
        self.shared
            .lock_state()
            .chain
            .throttle_mut()
            .map(|throttle| throttle.rate())
    }

    /// Starts the deferred handshake of the secure stage.
    pub fn activate_secure_mode(&self) -> Result<()> {
        {
            let mut state = self.shared.lock_state();
            if state.phase != Phase::Open {
                return Err(Error::ClosedConnection);
            }
            let secure: &mut SecureStage = state
                .chain
                .secure_mut()
                .ok_or(Error::IllegalState("no secure transport configured"))?;
            secure.activate()?;
            let wire = state.chain.pump(Instant::now())?;
            state.wire.append_all(wire);
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.shared
            .lock_state()
            .chain
            .secure_mut()
            .is_some_and(|secure| secure.is_active())
    }

    /// Replaces the handler. Queued data is delivered to the new one.
    pub fn set_handler(&self, handler: Option<Box<dyn Handler>>) {
        let installed = handler.is_some();
        lock(&self.shared.events).set_handler(handler);
        if installed && self.available() > 0 {
            events::dispatch(&self.shared, Event::Data);
        }
    }

    // ---- lifecycle ------------------------------------------------------

    fn wake(&self) {
        self.shared.readable.notify_all();
        self.shared.wakeup.notify_one();
    }

    /// Closes gracefully: staged output is flushed and drained to the
    /// socket before it is closed. Further writes fail.
    pub fn close(&self) -> Result<()> {
        let result = {
            let mut state = self.shared.lock_state();
            if state.phase != Phase::Open {
                return Ok(());
            }
            let result = state.begin_close();
            if result.is_err() {
                state.abort();
            }
            result
        };
        debug!(connection = self.id(), "Close requested");
        self.wake();
        result
    }

    /// Closes immediately, discarding pending output.
    pub fn close_now(&self) {
        {
            let mut state = self.shared.lock_state();
            if state.phase == Phase::Closed {
                return;
            }
            state.abort();
        }
        debug!(connection = self.id(), "Connection destroyed");
        self.wake();
    }

    /// Prepares a connection for reuse by another user.
    ///
    /// Returns false if it cannot be reused: closed, peer gone, or unread
    /// input still queued.
    pub(crate) fn reset(&self) -> bool {
        let mut state = self.shared.lock_state();
        if state.phase != Phase::Open || state.end_of_stream {
            return false;
        }
        state.incoming.remove_mark();
        state.outgoing.remove_mark();
        if state.flush().is_err() {
            state.abort();
            return false;
        }
        if !state.incoming.is_empty() {
            return false;
        }

        let defaults = &self.shared.defaults;
        state.autoflush = defaults.autoflush;
        state.encoding = defaults.encoding;
        state.idle_timeout = defaults.idle_timeout;
        state.connection_timeout = defaults.connection_timeout;
        state.idle_fired_at = None;
        true
    }

    /// Delivers a connect callback to the current handler.
    pub(crate) fn notify_connect(&self) {
        events::dispatch(&self.shared, Event::Connect);
    }

    /// Fires idle and lifetime timeouts that have expired at `now`.
    ///
    /// Each timeout fires once. The idle timeout fires again only after new
    /// activity.
    pub(crate) fn check_timeouts(&self, now: Instant) {
        let event = {
            let mut state = self.shared.lock_state();
            if state.phase != Phase::Open {
                return;
            }

            let lifetime_expired = state.connection_timeout.is_some_and(|timeout| {
                now.saturating_duration_since(self.shared.created_at) >= timeout
            });
            let activity = self.shared.last_activity.load(Ordering::Relaxed);
            let idle_expired = state.idle_timeout.is_some_and(|timeout| {
                now.saturating_duration_since(self.shared.last_activity()) >= timeout
            });

            if lifetime_expired && !state.lifetime_fired {
                state.lifetime_fired = true;
                Some(Event::ConnectionTimeout)
            } else if idle_expired && state.idle_fired_at != Some(activity) {
                state.idle_fired_at = Some(activity);
                Some(Event::IdleTimeout)
            } else {
                None
            }
        };

        let Some(event) = event else {
            return;
        };
        if event == Event::ConnectionTimeout {
            debug!(connection = self.id(), "Connection timeout");
            self.shared.stats.connection_timeout();
        } else {
            debug!(connection = self.id(), "Idle timeout");
            self.shared.stats.idle_timeout();
        }
        events::dispatch(&self.shared, event);
    }
}

macro_rules! typed_io {
    ($($read:ident, $write:ident, $ty:ty, $get:ident, $put:ident;)*) => {
        /// Big-endian primitive reads and writes.
        impl Connection {
            $(
                pub fn $read(&self) -> Result<$ty> {
                    let mut bytes = self.read_bytes_by_length(std::mem::size_of::<$ty>())?;
                    Ok(bytes.$get())
                }

                pub fn $write(&self, value: $ty) -> Result<usize> {
                    let mut buf = BytesMut::with_capacity(std::mem::size_of::<$ty>());
                    buf.$put(value);
                    self.write_bytes(buf.freeze())
                }
            )*
        }
    };
}

typed_io! {
    read_u8, write_u8, u8, get_u8, put_u8;
    read_i8, write_i8, i8, get_i8, put_i8;
    read_u16, write_u16, u16, get_u16, put_u16;
    read_i16, write_i16, i16, get_i16, put_i16;
    read_u32, write_u32, u32, get_u32, put_u32;
    read_i32, write_i32, i32, get_i32, put_i32;
    read_u64, write_u64, u64, get_u64, put_u64;
    read_i64, write_i64, i64, get_i64, put_i64;
    read_f32, write_f32, f32, get_f32, put_f32;
    read_f64, write_f64, f64, get_f64, put_f64;
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.endpoint.peer)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
