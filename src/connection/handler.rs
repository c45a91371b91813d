//! Application callbacks.
//!
//! A [`Handler`] implements any subset of the callbacks; the defaults do
//! nothing (data stays queued, timeouts close the connection). Callbacks of
//! one connection never run concurrently, so a handler can keep parsing
//! state in `&mut self` without locking.

use super::core::Connection;
use crate::error::Result;

pub trait Handler: Send + 'static {
    /// The connection is attached and, if secure, the handshake is done.
    fn on_connect(&mut self, _connection: &Connection) -> Result<()> {
        Ok(())
    }

    /// New bytes are queued, or the peer closed the stream.
    ///
    /// Returning `Err(BufferUnderflow)` means "wait for more data".
    fn on_data(&mut self, _connection: &Connection) -> Result<()> {
        Ok(())
    }

    /// The connection has been closed and deregistered.
    fn on_disconnect(&mut self, _connection: &Connection) -> Result<()> {
        Ok(())
    }

    /// No traffic for the idle timeout. Return true to keep the connection.
    fn on_idle_timeout(&mut self, _connection: &Connection) -> bool {
        false
    }

    /// The connection outlived its lifetime. Return true to keep it.
    fn on_connection_timeout(&mut self, _connection: &Connection) -> bool {
        false
    }
}

/// Produces fresh handler state for every accepted connection.
pub trait HandlerFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn Handler>;
}

impl<F, H> HandlerFactory for F
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Handler,
{
    fn create(&self) -> Box<dyn Handler> {
        Box::new(self())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        count: usize,
    }

    impl Handler for Counter {
        fn on_data(&mut self, _connection: &Connection) -> Result<()> {
            self.count += 1;
            Ok(())
        }
    }

    #[test]
    fn test_factory_creates_independent_state() {
        let factory = Counter::default;
        let conn = Connection::detached();
        let mut first = factory.create();
        let mut second = factory.create();
        first.on_data(&conn).unwrap();
        first.on_data(&conn).unwrap();
        second.on_data(&conn).unwrap();
        assert!(!first.on_idle_timeout(&conn));
        assert!(!second.on_connection_timeout(&conn));
    }
}
