//! Dispatchers
//!
//! A dispatcher owns one OS thread running a single-threaded tokio runtime.
//! Every connection registered with it gets one task on that runtime which
//! waits for socket readiness, moves bytes between the socket and the
//! connection, and finishes the connection when the socket is done.
//!
//! ```text
//!   register(stream) ──> [registry] ──spawn──> drive task
//!                                                │
//!          ┌─────────────── select ──────────────┤
//!          │ socket ready   wakeup notify   release timer
//!          ▼
//!   read: try_read_buf ──> Shared::receive ──> callbacks on the executor
//!   write: take_wire ──> try_write ──> restore_wire on WouldBlock
//! ```
//!
//! The task never blocks: callbacks run on the connection's executor and
//! all socket I/O uses `try_*` calls after a readiness notification.

use crate::connection::core::{Phase, Shared};
use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};
use crate::memory::MemoryManager;
use crate::sync::lock;
use bytes::{Buf, Bytes};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Handle};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Largest number of wire bytes taken for one write burst.
const WRITE_BATCH: usize = 256 * 1024;

/// How long a closing dispatcher waits for its connections to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type Registry = Arc<Mutex<HashMap<ConnectionId, Connection>>>;

pub struct Dispatcher {
    id: usize,
    handle: Handle,
    registry: Registry,
    shutdown_tx: watch::Sender<bool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    closed: AtomicBool,
    memory: MemoryManager,
    reads_per_event: usize,
}

impl Dispatcher {
    /// Starts the dispatcher thread.
    pub fn start(id: usize, memory: MemoryManager, reads_per_event: usize) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let remaining = Arc::clone(&registry);
        let thread = thread::Builder::new()
            .name(format!("flashio-dispatcher-{id}"))
            .spawn(move || {
                runtime.block_on(async move {
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }

                    // Let closed connections run their final steps.
                    let deadline = Instant::now() + SHUTDOWN_GRACE;
                    while !lock(&remaining).is_empty() && Instant::now() < deadline {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                });
                debug!(dispatcher = id, "Dispatcher thread exiting");
            })?;

        debug!(dispatcher = id, "Dispatcher started");
        Ok(Self {
            id,
            handle,
            registry,
            shutdown_tx,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
            memory,
            reads_per_event: reads_per_event.max(1),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Hands a connected socket to this dispatcher.
    pub(crate) fn register(&self, stream: std::net::TcpStream, connection: Connection) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            connection.shared().finish(Ok(()));
            return Err(Error::IllegalState("dispatcher is closed"));
        }

        stream.set_nonblocking(true)?;
        let stream = {
            let _guard = self.handle.enter();
            TcpStream::from_std(stream)?
        };

        lock(&self.registry).insert(connection.id(), connection.clone());
        trace!(
            dispatcher = self.id,
            connection = connection.id(),
            "Connection registered"
        );

        let registry = Arc::clone(&self.registry);
        let memory = self.memory.clone();
        let reads_per_event = self.reads_per_event;
        self.handle.spawn(async move {
            let shared = Arc::clone(connection.shared());
            let outcome = drive(&stream, &shared, &memory, reads_per_event).await;
            drop(stream);
            lock(&registry).remove(&connection.id());
            shared.finish(outcome);
        });
        Ok(())
    }

    /// Snapshot of the connections currently registered.
    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.registry).values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Destroys every connection and stops the thread. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for connection in self.connections() {
            connection.close_now();
        }
        let _ = self.shutdown_tx.send(true);

        // A callback running on this thread cannot wait for it.
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                warn!(dispatcher = self.id, "Dispatcher thread panicked");
            }
        }
        debug!(dispatcher = self.id, "Dispatcher closed");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serves one connection until it is closed.
async fn drive(
    stream: &TcpStream,
    shared: &Arc<Shared>,
    memory: &MemoryManager,
    reads_per_event: usize,
) -> Result<()> {
    shared.on_attached()?;

    loop {
        if shared.io_plan().want_write {
            write_socket(stream, shared)?;
        }

        let plan = shared.io_plan();
        match plan.phase {
            Phase::Closed => return Ok(()),
            Phase::Closing if !plan.want_write => return Ok(()),
            _ => {}
        }

        // A closing connection only drains its output.
        let mut interest = if plan.phase == Phase::Open {
            Interest::READABLE
        } else {
            Interest::WRITABLE
        };
        if plan.want_write {
            interest = interest.add(Interest::WRITABLE);
        }
        let release = plan.next_release.map(tokio::time::Instant::from_std);

        tokio::select! {
            ready = stream.ready(interest) => {
                let ready = ready?;
                if ready.is_readable() && plan.phase == Phase::Open {
                    let end_of_stream = read_socket(stream, shared, memory, reads_per_event)?;
                    if end_of_stream {
                        shared.on_end_of_stream();
                    }
                }
            }
            _ = shared.wakeup.notified() => {}
            _ = sleep_until(release), if release.is_some() => {
                shared.pump()?;
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Reads until the socket would block, at most `reads` times.
///
/// Returns true when the peer closed its side.
fn read_socket(
    stream: &TcpStream,
    shared: &Arc<Shared>,
    memory: &MemoryManager,
    reads: usize,
) -> Result<bool> {
    for _ in 0..reads {
        let mut segment = memory.acquire(memory.config().min_reusable);
        match stream.try_read_buf(&mut segment) {
            Ok(0) => {
                memory.recycle(segment);
                return Ok(true);
            }
            Ok(n) => {
                let data = segment.split_to(n).freeze();
                memory.recycle(segment);
                shared.receive(vec![data])?;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                memory.recycle(segment);
                return Ok(false);
            }
            Err(err) => {
                memory.recycle(segment);
                return Err(err.into());
            }
        }
    }
    Ok(false)
}

/// Writes queued wire bytes until the socket would block.
fn write_socket(stream: &TcpStream, shared: &Shared) -> Result<()> {
    loop {
        let batch = shared.take_wire(WRITE_BATCH);
        if batch.is_empty() {
            return Ok(());
        }

        let mut pending: VecDeque<Bytes> = batch.into();
        while let Some(front) = pending.front_mut() {
            match stream.try_write(front) {
                Ok(0) => {
                    shared.restore_wire(pending);
                    return Ok(());
                }
                Ok(n) => {
                    shared.wrote(n);
                    front.advance(n);
                    if front.is_empty() {
                        pending.pop_front();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    shared.restore_wire(pending);
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// The dispatchers of one context, assigned round-robin.
pub struct DispatcherPool {
    dispatchers: Vec<Dispatcher>,
    next: AtomicUsize,
}

impl DispatcherPool {
    pub fn new(count: usize, memory: &MemoryManager, reads_per_event: usize) -> Result<Self> {
        let dispatchers = (0..count.max(1))
            .map(|id| Dispatcher::start(id, memory.clone(), reads_per_event))
            .collect::<Result<Vec<_>>>()?;
        info!(dispatchers = dispatchers.len(), "Dispatchers started");
        Ok(Self {
            dispatchers,
            next: AtomicUsize::new(0),
        })
    }

    /// The dispatcher the next connection goes to.
    pub fn next_dispatcher(&self) -> &Dispatcher {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.dispatchers.len();
        &self.dispatchers[index]
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.dispatchers
            .iter()
            .flat_map(Dispatcher::connections)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.dispatchers.iter().map(Dispatcher::connection_count).sum()
    }

    pub fn close(&self) {
        for dispatcher in &self.dispatchers {
            dispatcher.close();
        }
    }
}
