//! TLS material and peer identity for the backhaul relay and agent
//!
//! Loads PEM certificates, keys, combined bundles, and trust anchors; builds
//! the rustls server and client configurations both processes share; and
//! synthesizes self-signed material when nothing is configured. Also owns the
//! tunnel-key capability: the pluggable function that maps a verified peer
//! certificate subject to the string that partitions pairing queues.

use std::path::PathBuf;
use thiserror::Error;

pub mod identity;
pub mod material;
pub mod self_signed;

pub use identity::{identity_tunnel_key, peer_common_name, TunnelKeyFn};
pub use material::{
    client_tls_config, ensure_crypto_provider, load_bundle, load_cert_chain, load_private_key,
    load_trust_anchors, server_tls_config, TlsMaterial,
};
pub use self_signed::{generate_self_signed, SelfSignedCertificate};

/// Failures loading or synthesizing TLS material. All of these are fatal at
/// process startup; none occur per-connection.
#[derive(Error, Debug)]
pub enum TlsMaterialError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("no private key found in {path}")]
    NoPrivateKey { path: PathBuf },

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("invalid certificate/key material: {0}")]
    InvalidMaterial(#[from] rustls::Error),

    #[error("client certificate verifier: {0}")]
    Verifier(String),
}
