//! Secure transport stage.
//!
//! The record protocol itself lives behind [`SecureEngine`], an opaque
//! encrypt/decrypt engine supplied by the application (the optional `tls`
//! feature provides one backed by rustls). The stage feeds it ciphertext
//! from the wire, hands plaintext to the application side and holds
//! application writes back until the handshake has finished.
//!
//! A stage can start active (handshake on attach) or deferred, in which
//! case bytes pass through untouched until [`SecureStage::activate`] is
//! called.

use super::chain::{StageKind, Transform};
use crate::buffer::ByteQueue;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

/// Encrypt/decrypt engine driven by the secure stage.
pub trait SecureEngine: Send {
    /// Feeds ciphertext received from the peer.
    fn read_tls(&mut self, ciphertext: &[u8]) -> io::Result<()>;

    /// Appends any decrypted plaintext to `out`.
    fn read_plaintext(&mut self, out: &mut Vec<u8>) -> io::Result<()>;

    /// Encrypts application bytes. Only called once the handshake is done.
    fn write_plaintext(&mut self, plaintext: &[u8]) -> io::Result<()>;

    /// Appends ciphertext ready for the wire to `out`.
    fn write_tls(&mut self, out: &mut Vec<u8>) -> io::Result<()>;

    fn is_handshaking(&self) -> bool;

    /// Queues a close alert for the peer.
    fn send_close_notify(&mut self);
}

type EngineFactory = dyn Fn() -> io::Result<Box<dyn SecureEngine>> + Send + Sync;

/// Creates a fresh engine for every connection that uses secure transport.
#[derive(Clone)]
pub struct SecureContext {
    factory: Arc<EngineFactory>,
    start_immediately: bool,
}

impl SecureContext {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> io::Result<Box<dyn SecureEngine>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            start_immediately: true,
        }
    }

    /// Defers the handshake until the connection activates secure mode.
    pub fn deferred(mut self) -> Self {
        self.start_immediately = false;
        self
    }

    pub fn starts_immediately(&self) -> bool {
        self.start_immediately
    }

    /// Builds the stage for a new connection.
    pub fn create_stage(&self) -> Result<SecureStage> {
        let engine = (self.factory)().map_err(|e| Error::Secure(e.to_string()))?;
        Ok(SecureStage::new(engine, self.start_immediately))
    }
}

impl fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContext")
            .field("start_immediately", &self.start_immediately)
            .finish_non_exhaustive()
    }
}

pub struct SecureStage {
    engine: Box<dyn SecureEngine>,
    active: bool,
    held: ByteQueue,
    incoming: Vec<Bytes>,
    outgoing: Vec<Bytes>,
    open: bool,
}

impl SecureStage {
    pub fn new(engine: Box<dyn SecureEngine>, active: bool) -> Self {
        Self {
            engine,
            active,
            held: ByteQueue::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            open: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Starts the handshake of a deferred stage. No-op if already active.
    pub fn activate(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::ClosedConnection);
        }
        self.active = true;
        self.collect_ciphertext()
    }

    fn collect_ciphertext(&mut self) -> Result<()> {
        let mut out = Vec::new();
        self.engine.write_tls(&mut out).map_err(secure_error)?;
        if !out.is_empty() {
            self.outgoing.push(Bytes::from(out));
        }
        Ok(())
    }

    fn encrypt_held(&mut self) -> Result<()> {
        for segment in self.held.drain() {
            self.engine.write_plaintext(&segment).map_err(secure_error)?;
        }
        Ok(())
    }
}

fn secure_error(err: io::Error) -> Error {
    Error::Secure(err.to_string())
}

impl fmt::Debug for SecureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStage")
            .field("active", &self.active)
            .field("handshaking", &self.engine.is_handshaking())
            .field("held", &self.held.len())
            .finish_non_exhaustive()
    }
}

impl Transform for SecureStage {
    fn kind(&self) -> StageKind {
        StageKind::Secure
    }

    fn write_outgoing(&mut self, data: Vec<Bytes>, _now: Instant) -> Result<()> {
        if !self.active {
            self.outgoing.extend(data);
            return Ok(());
        }

        self.held.append_all(data);
        if !self.engine.is_handshaking() {
            self.encrypt_held()?;
        }
        self.collect_ciphertext()
    }

    fn take_outgoing(&mut self, _now: Instant) -> Vec<Bytes> {
        std::mem::take(&mut self.outgoing)
    }

    fn flush_outgoing(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outgoing)
    }

    fn receive_incoming(&mut self, data: Vec<Bytes>) -> Result<()> {
        if !self.active {
            self.incoming.extend(data);
            return Ok(());
        }

        for segment in data {
            self.engine.read_tls(&segment).map_err(secure_error)?;
        }
        let mut plaintext = Vec::new();
        self.engine
            .read_plaintext(&mut plaintext)
            .map_err(secure_error)?;
        if !plaintext.is_empty() {
            self.incoming.push(Bytes::from(plaintext));
        }
        // Handshake replies go out on the next pump.
        self.collect_ciphertext()
    }

    fn drain_incoming(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.incoming)
    }

    fn pending_outgoing(&self) -> usize {
        self.held.len() + self.outgoing.iter().map(Bytes::len).sum::<usize>()
    }

    fn is_established(&self) -> bool {
        !self.active || !self.engine.is_handshaking()
    }

    fn close(&mut self) -> Result<()> {
        if self.open && self.active {
            self.engine.send_close_notify();
            self.collect_ciphertext()?;
        }
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// A toy engine used by tests: a one-byte handshake followed by XOR.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    const CLIENT_HELLO: u8 = 0x01;
    const SERVER_HELLO: u8 = 0x02;
    const KEY: u8 = 0x5a;

    pub(crate) struct XorEngine {
        server: bool,
        handshaking: bool,
        out: Vec<u8>,
        plaintext: Vec<u8>,
        pub(crate) closed: bool,
    }

    impl XorEngine {
        pub(crate) fn client() -> Self {
            Self {
                server: false,
                handshaking: true,
                out: vec![CLIENT_HELLO],
                plaintext: Vec::new(),
                closed: false,
            }
        }

        pub(crate) fn server() -> Self {
            Self {
                server: true,
                handshaking: true,
                out: Vec::new(),
                plaintext: Vec::new(),
                closed: false,
            }
        }
    }

    pub(crate) fn xor(data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ KEY).collect()
    }

    impl SecureEngine for XorEngine {
        fn read_tls(&mut self, ciphertext: &[u8]) -> io::Result<()> {
            for &byte in ciphertext {
                if !self.handshaking {
                    self.plaintext.push(byte ^ KEY);
                    continue;
                }
                match (self.server, byte) {
                    (true, CLIENT_HELLO) => self.out.push(SERVER_HELLO),
                    (false, SERVER_HELLO) => {}
                    _ => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "unexpected handshake byte",
                        ))
                    }
                }
                self.handshaking = false;
            }
            Ok(())
        }

        fn read_plaintext(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
            out.append(&mut self.plaintext);
            Ok(())
        }

        fn write_plaintext(&mut self, plaintext: &[u8]) -> io::Result<()> {
            self.out.extend(xor(plaintext));
            Ok(())
        }

        fn write_tls(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
            out.append(&mut self.out);
            Ok(())
        }

        fn is_handshaking(&self) -> bool {
            self.handshaking
        }

        fn send_close_notify(&mut self) {
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{xor, XorEngine};
    use super::*;

    fn flatten(segments: Vec<Bytes>) -> Vec<u8> {
        segments.iter().flat_map(|b| b.iter().copied()).collect()
    }

    #[test]
    fn test_handshake_then_encrypt() {
        let now = Instant::now();
        let mut client = SecureStage::new(Box::new(XorEngine::client()), true);
        let mut server = SecureStage::new(Box::new(XorEngine::server()), true);

        client
            .write_outgoing(vec![Bytes::from_static(b"early")], now)
            .unwrap();
        assert!(!client.is_established());
        let hello = client.take_outgoing(now);
        assert_eq!(flatten(hello.clone()), vec![0x01]);
        assert_eq!(client.pending_outgoing(), 5);

        server.receive_incoming(hello).unwrap();
        assert!(server.is_established());
        let reply = server.take_outgoing(now);

        client.receive_incoming(reply).unwrap();
        assert!(client.is_established());

        // Held plaintext is released on the next pump.
        client.write_outgoing(Vec::new(), now).unwrap();
        let record = client.take_outgoing(now);
        assert_eq!(flatten(record.clone()), xor(b"early"));

        server.receive_incoming(record).unwrap();
        assert_eq!(flatten(server.drain_incoming()), b"early");
    }

    #[test]
    fn test_handshake_failure_is_error() {
        let mut server = SecureStage::new(Box::new(XorEngine::server()), true);
        let result = server.receive_incoming(vec![Bytes::from_static(b"GET / HTTP/1.1")]);
        assert!(matches!(result, Err(Error::Secure(_))));
    }

    #[test]
    fn test_deferred_stage_passes_through() {
        let now = Instant::now();
        let mut stage = SecureStage::new(Box::new(XorEngine::client()), false);
        assert!(stage.is_established());

        stage
            .write_outgoing(vec![Bytes::from_static(b"plain")], now)
            .unwrap();
        assert_eq!(flatten(stage.take_outgoing(now)), b"plain");

        stage.activate().unwrap();
        assert!(stage.is_active());
        assert!(!stage.is_established());
        assert_eq!(flatten(stage.take_outgoing(now)), vec![0x01]);
    }

    #[test]
    fn test_context_creates_stage() {
        let context = SecureContext::new(|| Ok(Box::new(XorEngine::client()) as Box<dyn SecureEngine>))
            .deferred();
        assert!(!context.starts_immediately());
        let stage = context.create_stage().unwrap();
        assert!(!stage.is_active());

        let failing = SecureContext::new(|| Err(io::Error::other("no certificate")));
        assert!(matches!(failing.create_stage(), Err(Error::Secure(_))));
    }
}
