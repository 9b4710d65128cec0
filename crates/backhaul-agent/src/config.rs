//! Agent configuration

use std::path::PathBuf;
use std::time::Duration;

/// TLS policy for one outbound endpoint (relay or target).
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    /// Verify the server certificate. Disabling accepts any certificate.
    pub verify: bool,
    /// Trust anchors for verification; the bundled webpki roots when unset.
    pub ca_cert: Option<PathBuf>,
    /// Client certificate presented to the server, if any. Certificate and
    /// key must be configured together.
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl Default for ClientTlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            ca_cert: None,
            client_cert: None,
            client_key: None,
        }
    }
}

/// Full agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay endpoint the warm pool dials.
    pub relay_host: String,
    pub relay_port: u16,

    /// Hidden target service each consumed pool member dials.
    pub target_host: String,
    pub target_port: u16,

    /// Warm pool size N.
    pub pool_size: usize,

    /// Shared secret written as the first bytes of every relay connection.
    pub secret: Option<String>,

    /// TLS toward the relay; `None` dials plain TCP.
    pub relay_tls: Option<ClientTlsConfig>,
    /// TLS toward the target; `None` dials plain TCP.
    pub target_tls: Option<ClientTlsConfig>,

    /// Idle timeouts applied while a tunnel is pumping. The relay timeout
    /// additionally bounds the first-byte wait, but only when a secret is
    /// configured, so idle warm members are not cycled.
    pub relay_timeout: Option<Duration>,
    pub target_timeout: Option<Duration>,
}

impl AgentConfig {
    pub fn new(
        relay_host: impl Into<String>,
        relay_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            relay_host: relay_host.into(),
            relay_port,
            target_host: target_host.into(),
            target_port,
            pool_size: 8,
            secret: None,
            relay_tls: None,
            target_tls: None,
            relay_timeout: None,
            target_timeout: None,
        }
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = AgentConfig::new("relay.example", 10080, "127.0.0.1", 9000);
        assert_eq!(cfg.pool_size, 8);
        assert!(cfg.secret.is_none());
        assert!(cfg.relay_tls.is_none());
        assert_eq!(cfg.relay_addr(), "relay.example:10080");
        assert_eq!(cfg.target_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn tls_policy_verifies_by_default() {
        let tls = ClientTlsConfig::default();
        assert!(tls.verify);
        assert!(tls.ca_cert.is_none());
    }
}
