//! Shared socket plumbing for the backhaul relay and agent
//!
//! Both processes move raw bytes between sockets that may be plain TCP or
//! TLS. This crate holds the pieces they share: the [`ByteStream`] wrapper,
//! TCP keep-alive configuration, the pending-byte buffer that survives across
//! pairing, and the bidirectional [`pump`].

pub mod keepalive;
pub mod pending;
pub mod pump;
pub mod stream;

pub use keepalive::{configure_keepalive, KEEPALIVE_INTERVAL};
pub use pending::{PendingBuffer, StripOutcome};
pub use pump::{pump, read_with_idle};
pub use stream::ByteStream;
