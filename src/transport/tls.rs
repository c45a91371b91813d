//! rustls-backed [`SecureEngine`].
//!
//! Both rustls connection types implement the engine, so a
//! [`SecureContext`](super::SecureContext) factory only needs to build a
//! `ClientConnection` or `ServerConnection` from a shared config:
//!
//! ```ignore
//! let config = Arc::new(client_config);
//! let name = ServerName::try_from("example.com")?.to_owned();
//! let context = SecureContext::new(move || {
//!     let conn = rustls::ClientConnection::new(Arc::clone(&config), name.clone())
//!         .map_err(std::io::Error::other)?;
//!     Ok(Box::new(conn) as Box<dyn SecureEngine>)
//! });
//! ```

use super::secure::SecureEngine;
use std::io::{self, Read, Write};

macro_rules! impl_rustls_engine {
    ($connection:ty) => {
        impl SecureEngine for $connection {
            fn read_tls(&mut self, ciphertext: &[u8]) -> io::Result<()> {
                let mut input = ciphertext;
                while !input.is_empty() {
                    if (**self).read_tls(&mut input)? == 0 {
                        break;
                    }
                    (**self)
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Ok(())
            }

            fn read_plaintext(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
                match (**self).reader().read_to_end(out) {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                    Err(e) => Err(e),
                }
            }

            fn write_plaintext(&mut self, plaintext: &[u8]) -> io::Result<()> {
                (**self).writer().write_all(plaintext)
            }

            fn write_tls(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
                while (**self).wants_write() {
                    (**self).write_tls(out)?;
                }
                Ok(())
            }

            fn is_handshaking(&self) -> bool {
                (**self).is_handshaking()
            }

            fn send_close_notify(&mut self) {
                (**self).send_close_notify();
            }
        }
    };
}

impl_rustls_engine!(rustls::ClientConnection);
impl_rustls_engine!(rustls::ServerConnection);

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
    use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
    use std::sync::Arc;

    fn engines() -> (Box<dyn SecureEngine>, Box<dyn SecureEngine>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert: CertificateDer<'static> = certified.cert.der().clone();
        let key: PrivateKeyDer<'static> =
            PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()).into();
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server_config = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();
        let client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let name = ServerName::try_from("localhost").unwrap();
        let client = ClientConnection::new(Arc::new(client_config), name).unwrap();
        let server = ServerConnection::new(Arc::new(server_config)).unwrap();
        (Box::new(client), Box::new(server))
    }

    /// Moves pending ciphertext from one engine to the other.
    fn pump(from: &mut dyn SecureEngine, to: &mut dyn SecureEngine) -> usize {
        let mut wire = Vec::new();
        from.write_tls(&mut wire).unwrap();
        if !wire.is_empty() {
            to.read_tls(&wire).unwrap();
        }
        wire.len()
    }

    #[test]
    fn test_handshake_then_plaintext_round_trip() {
        let (mut client, mut server) = engines();
        assert!(client.is_handshaking());
        assert!(server.is_handshaking());

        let mut rounds = 0;
        while client.is_handshaking() || server.is_handshaking() {
            pump(client.as_mut(), server.as_mut());
            pump(server.as_mut(), client.as_mut());
            rounds += 1;
            assert!(rounds < 10, "handshake did not finish");
        }

        client.write_plaintext(b"hello").unwrap();
        assert!(pump(client.as_mut(), server.as_mut()) > 0);
        let mut plaintext = Vec::new();
        server.read_plaintext(&mut plaintext).unwrap();
        assert_eq!(plaintext, b"hello");

        server.write_plaintext(b"world").unwrap();
        pump(server.as_mut(), client.as_mut());
        let mut reply = Vec::new();
        client.read_plaintext(&mut reply).unwrap();
        assert_eq!(reply, b"world");
    }

    #[test]
    fn test_close_notify_ends_the_peer_stream() {
        let (mut client, mut server) = engines();
        for _ in 0..10 {
            pump(client.as_mut(), server.as_mut());
            pump(server.as_mut(), client.as_mut());
        }
        assert!(!client.is_handshaking());

        client.send_close_notify();
        assert!(pump(client.as_mut(), server.as_mut()) > 0);
        let mut plaintext = Vec::new();
        server.read_plaintext(&mut plaintext).unwrap();
        assert!(plaintext.is_empty());
    }
}
