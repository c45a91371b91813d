//! Transport Module
//!
//! Byte transforms that sit between a connection's queues and its socket.
//!
//! - [`chain`]: the ordered stage list and the [`Transform`] contract
//! - [`secure`]: handshake and record encryption through a [`SecureEngine`]
//! - [`throttle`]: write-rate limiting
//! - `tls` (feature `tls`): a rustls-backed [`SecureEngine`]

pub mod chain;
pub mod secure;
pub mod throttle;

#[cfg(feature = "tls")]
pub mod tls;

pub use chain::{Stage, StageKind, Transform, TransportChain};
pub use secure::{SecureContext, SecureEngine, SecureStage};
pub use throttle::{ThrottledWrite, RELEASE_INTERVAL};
