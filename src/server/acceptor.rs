//! The accepting side of the engine.
//!
//! ```text
//!   TcpListener ──accept()──> factory.create() ──> IoContext::register
//!   (acceptor thread)                                   │
//!                                                       ▼
//!                                         next dispatcher (round-robin)
//! ```
//!
//! Accepting is a plain blocking loop on its own thread. Shutdown flips the
//! open flag and connects to the listener once so a blocked `accept`
//! returns and sees it.

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionStats, HandlerFactory};
use crate::context::IoContext;
use crate::error::{Error, Result};
use crate::sync::lock;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Back-off after a failed accept, so persistent errors do not spin.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(10);

/// A TCP server that hands every accepted socket to a dispatcher.
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    context: IoContext,
    factory: Box<dyn HandlerFactory>,
    open: AtomicBool,
    started: AtomicBool,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Binds the listener and starts the I/O context. Connections are only
    /// accepted after [`start`](Self::start) or [`run`](Self::run).
    pub fn bind<F: HandlerFactory>(config: ServerConfig, factory: F) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_address())?;
        let local_addr = listener.local_addr()?;

        let mut io = config.io.clone();
        io.watchdog_period = config.watchdog_period();
        let context = IoContext::new(io)?;

        info!(address = %local_addr, "Server bound");
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                listener,
                local_addr,
                context,
                factory: Box::new(factory),
                open: AtomicBool::new(true),
                started: AtomicBool::new(false),
                acceptor: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &IoContext {
        &self.inner.context
    }

    /// Accepts connections on a background thread.
    pub fn start(&self) -> Result<()> {
        self.claim_start()?;
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("flashio-acceptor".to_string())
            .spawn(move || inner.accept_loop())?;
        *lock(&self.inner.acceptor) = Some(handle);
        Ok(())
    }

    /// Accepts connections on the calling thread until shutdown.
    pub fn run(&self) -> Result<()> {
        self.claim_start()?;
        self.inner.accept_loop();
        Ok(())
    }

    fn claim_start(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::IllegalState("server is shut down"));
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::IllegalState("server already started"));
        }
        Ok(())
    }

    /// Stops accepting, cancels the watchdog and closes every connection.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(address = %self.inner.local_addr, "Shutting down server");

        // Unblock a pending accept.
        let _ = TcpStream::connect_timeout(&wake_address(self.inner.local_addr), Duration::from_millis(200));

        let acceptor = lock(&self.inner.acceptor).take();
        if let Some(acceptor) = acceptor {
            if acceptor.thread().id() != thread::current().id() && acceptor.join().is_err() {
                warn!("Acceptor thread panicked");
            }
        }

        self.inner.context.close();
        info!("Server shutdown complete");
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        self.inner.context.stats()
    }

    /// Snapshot of the connections currently served.
    pub fn open_connections(&self) -> Vec<Connection> {
        self.inner.context.connections()
    }
}

impl ServerInner {
    fn accept_loop(&self) {
        info!(address = %self.local_addr, "Accepting connections");
        while self.open.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if !self.open.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = self.accept(stream, peer) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                    }
                }
                Err(e) => {
                    if !self.open.load(Ordering::Acquire) {
                        break;
                    }
                    error!("Failed to accept connection: {}", e);
                    thread::sleep(ACCEPT_ERROR_PAUSE);
                }
            }
        }
        debug!("Accept loop stopped");
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let handler = self.factory.create();
        let connection = self
            .context
            .register(stream, true, &self.config.connection, Some(handler))?;
        debug!(connection = connection.id(), peer = %peer, "Accepted connection");
        Ok(())
    }
}

/// Address a local client can reach the listener on.
fn wake_address(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionOptions, IoConfig};
    use crate::connection::Handler;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn test_config() -> ServerConfig {
        ServerConfig::new("127.0.0.1", 0).with_io(
            IoConfig::default()
                .with_dispatchers(2)
                .with_workers(2, 8),
        )
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

    struct Pong;

    impl Handler for Pong {
        fn on_data(&mut self, connection: &Connection) -> Result<()> {
            let line = connection.read_string_by_delimiter("\r\n", 1024)?;
            if line == "PING" {
                connection.write("PONG\r\n")?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_ping_pong() {
        let server = Server::bind(test_config(), || Pong).unwrap();
        server.start().unwrap();

        let client = IoContext::new(IoConfig::default().with_dispatchers(1)).unwrap();
        let connection = client
            .connect(
                server.local_addr(),
                Duration::from_secs(1),
                &ConnectionOptions::default(),
                None,
            )
            .unwrap()
            .blocking(Duration::from_secs(5));

        connection.write("PING\r\n").unwrap();
        assert_eq!(
            connection.read_string_by_delimiter("\r\n", 1024).unwrap(),
            "PONG"
        );

        // Pipelined requests arriving in one segment.
        connection.write("PING\r\nPING\r\n").unwrap();
        assert_eq!(connection.read_string_by_delimiter("\r\n", 1024).unwrap(), "PONG");
        assert_eq!(connection.read_string_by_delimiter("\r\n", 1024).unwrap(), "PONG");

        client.close();
        server.shutdown();
    }

    /// Byte `i` of the bulk payload.
    fn pattern(i: usize) -> u8 {
        (i % 251) as u8
    }

    struct Verifier {
        received: Arc<AtomicUsize>,
        corrupt: Arc<AtomicBool>,
    }

    impl Handler for Verifier {
        fn on_data(&mut self, connection: &Connection) -> Result<()> {
            let offset = self.received.load(Ordering::Acquire);
            let mut count = 0;
            for segment in connection.read_available()? {
                for (i, byte) in segment.iter().enumerate() {
                    if *byte != pattern(offset + count + i) {
                        self.corrupt.store(true, Ordering::Release);
                    }
                }
                count += segment.len();
            }
            self.received.fetch_add(count, Ordering::AcqRel);
            Ok(())
        }
    }

    #[test]
    fn test_bulk_transfer_arrives_intact() {
        const CHUNK: usize = 10 * 1024;
        const CHUNKS: usize = 1000;

        let received = Arc::new(AtomicUsize::new(0));
        let corrupt = Arc::new(AtomicBool::new(false));
        let factory = {
            let received = Arc::clone(&received);
            let corrupt = Arc::clone(&corrupt);
            move || Verifier {
                received: Arc::clone(&received),
                corrupt: Arc::clone(&corrupt),
            }
        };
        let server = Server::bind(test_config(), factory).unwrap();
        server.start().unwrap();

        let client = IoContext::new(IoConfig::default().with_dispatchers(1)).unwrap();
        let connection = client
            .connect(
                server.local_addr(),
                Duration::from_secs(1),
                &ConnectionOptions::default(),
                None,
            )
            .unwrap();

        for chunk in 0..CHUNKS {
            let data: Vec<u8> = (0..CHUNK).map(|i| pattern(chunk * CHUNK + i)).collect();
            connection.write(data).unwrap();
        }

        assert!(wait_until(Duration::from_secs(30), || {
            received.load(Ordering::Acquire) == CHUNK * CHUNKS
        }));
        assert!(!corrupt.load(Ordering::Acquire));
        assert_eq!(server.stats().bytes_read.load(Ordering::Relaxed), (CHUNK * CHUNKS) as u64);

        client.close();
        server.shutdown();
    }

    struct Counter {
        lines: usize,
    }

    impl Handler for Counter {
        fn on_data(&mut self, connection: &Connection) -> Result<()> {
            connection.read_bytes_by_delimiter("\n", 64)?;
            self.lines += 1;
            connection.write(format!("{}\n", self.lines))?;
            Ok(())
        }
    }

    fn send_line(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>) -> String {
        stream.write_all(b"x\n").unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line.trim_end().to_string()
    }

    #[test]
    fn test_each_connection_gets_fresh_handler() {
        let server = Server::bind(test_config(), || Counter { lines: 0 }).unwrap();
        server.start().unwrap();

        let mut first = TcpStream::connect(server.local_addr()).unwrap();
        let mut first_reader = BufReader::new(first.try_clone().unwrap());
        let mut second = TcpStream::connect(server.local_addr()).unwrap();
        let mut second_reader = BufReader::new(second.try_clone().unwrap());

        assert_eq!(send_line(&mut first, &mut first_reader), "1");
        assert_eq!(send_line(&mut first, &mut first_reader), "2");
        assert_eq!(send_line(&mut second, &mut second_reader), "1");
        assert_eq!(send_line(&mut first, &mut first_reader), "3");

        assert_eq!(server.open_connections().len(), 2);
        server.shutdown();
    }

    struct Sticky;

    impl Handler for Sticky {
        fn on_data(&mut self, connection: &Connection) -> Result<()> {
            let line = connection.read_string_by_delimiter("\n", 64)?;
            connection.write(format!("{line}\n"))?;
            Ok(())
        }

        fn on_idle_timeout(&mut self, _connection: &Connection) -> bool {
            true
        }
    }

    #[test]
    fn test_idle_timeout_closes_connection() {
        let config = test_config()
            .with_connection(ConnectionOptions::default().with_idle_timeout(Duration::from_millis(100)));
        let server = Server::bind(config, || Pong).unwrap();
        server.start().unwrap();

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(server.stats().idle_timeouts.load(Ordering::Relaxed), 1);
        server.shutdown();
    }

    #[test]
    fn test_idle_timeout_vetoed_by_handler() {
        let config = test_config()
            .with_connection(ConnectionOptions::default().with_idle_timeout(Duration::from_millis(50)));
        let server = Server::bind(config, || Sticky).unwrap();
        server.start().unwrap();

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        assert!(wait_until(Duration::from_secs(2), || {
            server.stats().idle_timeouts.load(Ordering::Relaxed) >= 1
        }));

        client.write_all(b"still here\n").unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "still here\n");
        server.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let server = Server::bind(test_config(), || Pong).unwrap();
        server.start().unwrap();
        assert!(matches!(server.start(), Err(Error::IllegalState(_))));

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            server.open_connections().len() == 1
        }));

        server.shutdown();
        server.shutdown();
        assert!(!server.is_open());
        assert!(server.open_connections().is_empty());

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_run_blocks_until_shutdown() {
        let server = Arc::new(Server::bind(test_config(), || Pong).unwrap());
        let runner = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run())
        };
        assert!(wait_until(Duration::from_secs(2), || server.inner.started.load(Ordering::Acquire)));
        server.shutdown();
        runner.join().unwrap().unwrap();
    }
}
