//! Serialized callback delivery.
//!
//! Every connection owns one event queue. The first event queued while no
//! batch is running starts a batch on the connection's executor; events
//! queued meanwhile are picked up by the running batch, so callbacks of one
//! connection run one at a time and in order. A `Data` event is dropped if
//! one is already waiting, since the handler will see all queued bytes
//! anyway.
//!
//! ```text
//!   dispatcher ──Data──┐
//!   watchdog ──Idle────┼──> [queue] ──> one runner ──> Handler
//!   dispatcher ──Data──┘     (Data coalesced)
//! ```

use super::core::{Connection, Shared};
use super::handler::Handler;
use crate::error::Error;
use crate::sync::lock;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Connect,
    Data,
    Disconnect,
    IdleTimeout,
    ConnectionTimeout,
}

#[derive(Default)]
pub(crate) struct EventQueue {
    queue: VecDeque<Event>,
    running: bool,
    handler: Option<Box<dyn Handler>>,
    generation: u64,
}

impl EventQueue {
    pub(crate) fn new(handler: Option<Box<dyn Handler>>) -> Self {
        Self {
            handler,
            ..Default::default()
        }
    }

    /// Installs a handler. A callback that is running keeps its handler,
    /// which is dropped instead of being put back once it returns.
    pub(crate) fn set_handler(&mut self, handler: Option<Box<dyn Handler>>) {
        self.handler = handler;
        self.generation += 1;
    }
}

/// Queues an event and starts a runner if none is active.
///
/// Must not be called while holding the connection's state lock.
pub(crate) fn dispatch(shared: &Arc<Shared>, event: Event) {
    let start = {
        let mut events = lock(&shared.events);
        if !(event == Event::Data && events.queue.contains(&Event::Data)) {
            events.queue.push_back(event);
        }
        !std::mem::replace(&mut events.running, true)
    };

    if start {
        let runner = Arc::clone(shared);
        shared.executor.execute(move || run(&runner));
    }
}

fn run(shared: &Arc<Shared>) {
    let connection = Connection::from_shared(Arc::clone(shared));
    loop {
        let (event, handler, generation) = {
            let mut events = lock(&shared.events);
            let Some(event) = events.queue.pop_front() else {
                events.running = false;
                return;
            };
            (event, events.handler.take(), events.generation)
        };

        let Some(mut handler) = handler else {
            if matches!(event, Event::IdleTimeout | Event::ConnectionTimeout) {
                connection.close_now();
            }
            continue;
        };

        trace!(connection = shared.id, event = ?event, "Delivering event");
        let progress = connection.read_progress();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            invoke(handler.as_mut(), &connection, event)
        }));

        {
            let mut events = lock(&shared.events);
            if events.generation == generation && events.handler.is_none() {
                events.handler = Some(handler);
            }
        }

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_underflow() => {}
            Ok(Err(Error::EndOfStream | Error::ClosedConnection)) => {
                trace!(connection = shared.id, "Handler reached the end of the stream");
            }
            Ok(Err(Error::MaxSizeExceeded { max })) => {
                warn!(
                    connection = shared.id,
                    max = max,
                    "Frame exceeded its size bound, closing connection"
                );
                connection.close_now();
            }
            Ok(Err(err)) => {
                warn!(connection = shared.id, error = %err, "Handler error");
                recover(shared, &connection, event, progress);
            }
            Err(_) => {
                error!(connection = shared.id, event = ?event, "Handler panicked");
                recover(shared, &connection, event, progress);
            }
        }
    }
}

/// Flush and continue after a failed callback.
///
/// A data callback that consumed input before failing is delivered again
/// while bytes remain queued, so input that already arrived is not left
/// waiting for the peer to send more.
fn recover(shared: &Shared, connection: &Connection, event: Event, before: (usize, u64)) {
    match connection.flush() {
        Ok(()) => {}
        Err(Error::ClosedConnection) => return,
        Err(err) => {
            warn!(connection = shared.id, error = %err, "Flush after handler failure failed");
            connection.close_now();
            return;
        }
    }

    let after = connection.read_progress();
    if event == Event::Data && after.0 > 0 && after != before {
        let mut events = lock(&shared.events);
        if !events.queue.contains(&Event::Data) {
            events.queue.push_back(Event::Data);
        }
    }
}

fn invoke(handler: &mut dyn Handler, connection: &Connection, event: Event) -> crate::Result<()> {
    match event {
        Event::Connect => handler.on_connect(connection),
        Event::Disconnect => handler.on_disconnect(connection),
        Event::Data => {
            // Keep delivering while the handler consumes and bytes remain.
            loop {
                let before = connection.read_progress();
                handler.on_data(connection)?;
                let after = connection.read_progress();
                if after.0 == 0 || after == before {
                    return Ok(());
                }
            }
        }
        Event::IdleTimeout => {
            if !handler.on_idle_timeout(connection) {
                connection.close_now();
            }
            Ok(())
        }
        Event::ConnectionTimeout => {
            if !handler.on_connection_timeout(connection) {
                connection.close_now();
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CallbackMode, ConnectionOptions, IoConfig, ServerConfig};
    use crate::connection::core::Endpoint;
    use crate::connection::ConnectionStats;
    use crate::reactor::WorkerPool;
    use crate::server::Server;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pooled_server_config() -> ServerConfig {
        ServerConfig::new("127.0.0.1", 0).with_io(
            IoConfig::default()
                .with_dispatchers(1)
                .with_workers(2, 8)
                .with_callback_mode(CallbackMode::WorkerPool),
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

    /// Echoes lines, except `boom` panics and `fail` returns an error.
    struct Fragile;

    impl Handler for Fragile {
        fn on_data(&mut self, connection: &Connection) -> crate::Result<()> {
            let line = connection.read_string_by_delimiter("\n", 1024)?;
            match line.as_str() {
                "boom" => panic!("handler blew up"),
                "fail" => Err(Error::IllegalState("handler refused the line")),
                _ => {
                    connection.write(format!("{line}\n"))?;
                    Ok(())
                }
            }
        }
    }

    #[test]
    fn test_failed_callback_keeps_queued_input_flowing() {
        let server = Server::bind(pooled_server_config(), || Fragile).unwrap();
        server.start().unwrap();

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"boom\nfail\nafter\n").unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "after\n");

        // The connection survives both failures.
        client.write_all(b"again\n").unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "again\n");
        assert_eq!(server.stats().active(), 1);

        server.shutdown();
    }

    struct Overlap {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        received: Arc<AtomicUsize>,
    }

    impl Handler for Overlap {
        fn on_data(&mut self, connection: &Connection) -> crate::Result<()> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            let bytes: usize = connection.read_available()?.iter().map(|b| b.len()).sum();
            self.received.fetch_add(bytes, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_pool_callbacks_of_one_connection_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(AtomicUsize::new(0));
        let factory = {
            let (in_flight, max_in_flight, received) =
                (in_flight.clone(), max_in_flight.clone(), received.clone());
            move || Overlap {
                in_flight: in_flight.clone(),
                max_in_flight: max_in_flight.clone(),
                received: received.clone(),
            }
        };
        let server = Server::bind(pooled_server_config(), factory).unwrap();
        server.start().unwrap();

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.set_nodelay(true).unwrap();
        for _ in 0..50 {
            client.write_all(&[7u8; 100]).unwrap();
            thread::sleep(Duration::from_millis(1));
        }

        assert!(wait_until(Duration::from_secs(5), || {
            received.load(Ordering::SeqCst) == 5000
        }));
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);

        server.shutdown();
    }

    struct Gated {
        calls: Arc<AtomicUsize>,
        gate: Option<mpsc::Receiver<()>>,
    }

    impl Handler for Gated {
        fn on_data(&mut self, _connection: &Connection) -> crate::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv();
            }
            Ok(())
        }
    }

    #[test]
    fn test_data_events_coalesce_while_callback_runs() {
        let workers = WorkerPool::new(&IoConfig::default()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = mpsc::channel();
        let handler = Gated {
            calls: calls.clone(),
            gate: Some(gate),
        };
        let address = SocketAddr::from(([127, 0, 0, 1], 0));
        let endpoint = Endpoint {
            local: address,
            peer: address,
            server_side: true,
        };
        let connection = Connection::create(
            endpoint,
            &ConnectionOptions::default(),
            Some(Box::new(handler)),
            workers.executor(CallbackMode::WorkerPool),
            Arc::new(ConnectionStats::new()),
            None,
        )
        .unwrap();

        dispatch(connection.shared(), Event::Data);
        assert!(wait_until(Duration::from_secs(2), || {
            calls.load(Ordering::SeqCst) == 1
        }));
        for _ in 0..10 {
            dispatch(connection.shared(), Event::Data);
        }
        assert_eq!(lock(&connection.shared().events).queue.len(), 1);

        release.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            calls.load(Ordering::SeqCst) == 2
        }));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!lock(&connection.shared().events).running);
    }
}
