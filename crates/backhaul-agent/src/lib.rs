//! Backhaul agent: the hidden half of the system
//!
//! Runs next to the target service behind the NAT. Maintains a warm pool of
//! outbound connections to the relay; each pool member idles until the relay
//! forwards the first byte of a public client's stream, then dials the target
//! service, replays what was buffered, and pumps bytes until either side
//! ends. Consumed and failed members are replaced so the pool stays at size.

use thiserror::Error;

pub mod config;
pub mod pool;

pub use config::{AgentConfig, ClientTlsConfig};
pub use pool::{AgentPool, REPLACEMENT_BACKOFF};

/// Agent startup and per-pipe failures.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    TlsMaterial(#[from] backhaul_cert::TlsMaterialError),

    #[error("cannot reach {endpoint} at {addr}: {source}")]
    PeerUnreachable {
        endpoint: &'static str,
        addr: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
