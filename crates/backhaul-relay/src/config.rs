//! Relay configuration
//!
//! The relay consumes resolved configuration structures; flag parsing, file
//! paths, and environment plumbing live in the binary.

use backhaul_cert::{identity_tunnel_key, TunnelKeyFn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// TLS settings for one listener.
#[derive(Debug, Clone)]
pub struct ListenerTlsConfig {
    /// Combined PEM bundle: certificate chain and private key in one file.
    /// Takes precedence over `cert`/`key`.
    pub bundle: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Common name used only when material is autogenerated.
    pub cert_common_name: String,
    /// Trust anchors for peer certificate verification. Falls back to the
    /// bundled webpki roots when unset.
    pub ca_cert: Option<PathBuf>,
    /// Require and verify a client certificate on this listener.
    pub request_cert: bool,
}

impl Default for ListenerTlsConfig {
    fn default() -> Self {
        Self {
            bundle: None,
            cert: None,
            key: None,
            cert_common_name: "localhost".to_string(),
            ca_cert: None,
            request_cert: false,
        }
    }
}

/// One listener's bind address, transport, and idle policy.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// `None` accepts plain TCP.
    pub tls: Option<ListenerTlsConfig>,
    /// Tear down a connection after this long with no bytes. `None` disables.
    pub idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    pub fn plain(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            tls: None,
            idle_timeout: None,
        }
    }

    pub fn tls(bind_addr: SocketAddr, tls: ListenerTlsConfig) -> Self {
        Self {
            bind_addr,
            tls: Some(tls),
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Full relay configuration: both listeners, the shared secret agents must
/// present, and the tunnel-key derivation capability.
pub struct RelayConfig {
    /// Listener for end users of the exposed service.
    pub public: ListenerConfig,
    /// Listener for agent-initiated warm connections.
    pub relay: ListenerConfig,
    /// Shared secret required as the first bytes of every agent connection.
    /// `None` (or empty) authorizes agents immediately.
    pub secret: Option<String>,
    /// Maps a verified peer certificate common name to a tunnel key.
    pub tunnel_key_fn: TunnelKeyFn,
}

impl RelayConfig {
    pub fn new(public: ListenerConfig, relay: ListenerConfig) -> Self {
        Self {
            public,
            relay,
            secret: None,
            tunnel_key_fn: identity_tunnel_key(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_tunnel_key_fn(mut self, key_fn: TunnelKeyFn) -> Self {
        self.tunnel_key_fn = key_fn;
        self
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("public", &self.public)
            .field("relay", &self.relay)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn plain_listener_defaults() {
        let cfg = ListenerConfig::plain("127.0.0.1:10081".parse().unwrap());
        assert!(cfg.tls.is_none());
        assert!(cfg.idle_timeout.is_none());
    }

    #[test]
    fn tls_defaults_autogenerate_for_localhost() {
        let tls = ListenerTlsConfig::default();
        assert!(tls.bundle.is_none() && tls.cert.is_none() && tls.key.is_none());
        assert_eq!(tls.cert_common_name, "localhost");
        assert!(!tls.request_cert);
    }

    #[test]
    fn relay_config_defaults_to_identity_key_fn() {
        let cfg = RelayConfig::new(
            ListenerConfig::plain("127.0.0.1:0".parse().unwrap()),
            ListenerConfig::plain("127.0.0.1:0".parse().unwrap()),
        );
        assert!(cfg.secret.is_none());
        assert_eq!((cfg.tunnel_key_fn)("tenant"), "tenant");
    }

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let cfg = RelayConfig::new(
            ListenerConfig::plain("127.0.0.1:0".parse().unwrap()),
            ListenerConfig::plain("127.0.0.1:0".parse().unwrap()),
        )
        .with_secret("s3cret")
        .with_tunnel_key_fn(Arc::new(|cn: &str| cn.to_string()));

        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("s3cret"));
    }
}
