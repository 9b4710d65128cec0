//! Backhaul relay: the publicly reachable half of the system
//!
//! The relay runs two listeners. Agents behind the NAT dial the relay
//! listener and park as a warm pool; public clients arrive on the public
//! listener. The matcher pairs one socket from each side, oldest first within
//! a tunnel key, and a pump copies bytes between them until either side ends.

use thiserror::Error;

pub mod auth;
pub mod config;
pub mod listener;
pub mod matcher;
pub mod server;

pub use config::{ListenerConfig, ListenerTlsConfig, RelayConfig};
pub use matcher::{Matcher, Offer, Pipe, Side, TunnelKey};
pub use server::{Relay, ShutdownHandle};

/// Relay startup and runtime failures.
///
/// Bind and TLS-material problems are fatal to the process; everything that
/// happens on an individual connection is contained at the pipe level and
/// never surfaces here.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to bind {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("TLS material for the {listener} listener: {source}")]
    TlsMaterial {
        listener: &'static str,
        source: backhaul_cert::TlsMaterialError,
    },

    #[error("invalid listener configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
