//! Peer identity and tunnel-key derivation
//!
//! When a listener verifies client certificates, the peer's common name is
//! mapped through a caller-supplied function to the tunnel key that
//! partitions the pairing queues. The default mapping is identity, which
//! collapses to per-CN partitions; callers may substitute any pure function.

use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use x509_parser::prelude::*;

/// Maps a verified peer certificate common name to a tunnel key.
///
/// Must be pure: it is called once per accepted connection and must not
/// mutate process state.
pub type TunnelKeyFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The default tunnel-key mapping: the common name itself.
pub fn identity_tunnel_key() -> TunnelKeyFn {
    Arc::new(|cn: &str| cn.to_string())
}

/// Extract the subject common name from a DER-encoded certificate.
pub fn peer_common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    cn
}
