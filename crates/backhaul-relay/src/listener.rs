//! Listener adapter: plain or TLS accept with tunnel-key derivation
//!
//! Binds one side of the relay and turns every accepted connection into a
//! keep-alive-configured [`ByteStream`] plus its tunnel key. TLS material is
//! resolved once at bind time (bundle, key/cert pair, or an autogenerated
//! self-signed certificate) and shared across all accepts. Handshake
//! failures are logged and dropped; they never take the listener down.

use crate::config::{ListenerConfig, ListenerTlsConfig};
use crate::matcher::TunnelKey;
use crate::RelayError;
use backhaul_cert::{
    generate_self_signed, load_bundle, load_cert_chain, load_private_key, load_trust_anchors,
    peer_common_name, server_tls_config, TlsMaterial, TunnelKeyFn,
};
use backhaul_net::{configure_keepalive, ByteStream};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tracing::{debug, info, warn};

pub struct RelayListener {
    label: &'static str,
    tcp: TcpListener,
    tls: Option<TlsContext>,
    key_fn: TunnelKeyFn,
}

struct TlsContext {
    acceptor: TlsAcceptor,
    request_cert: bool,
}

impl RelayListener {
    /// Bind the listener and resolve its TLS material.
    ///
    /// Fails with [`RelayError::Bind`] when the address cannot be bound and
    /// [`RelayError::TlsMaterial`] when configured material cannot be loaded.
    /// Both are fatal to this listener.
    pub async fn bind(
        label: &'static str,
        cfg: &ListenerConfig,
        key_fn: TunnelKeyFn,
    ) -> Result<Self, RelayError> {
        let tls = match &cfg.tls {
            Some(tls_cfg) => Some(TlsContext {
                acceptor: build_acceptor(label, tls_cfg)?,
                request_cert: tls_cfg.request_cert,
            }),
            None => None,
        };

        let tcp = TcpListener::bind(cfg.bind_addr)
            .await
            .map_err(|e| RelayError::Bind {
                address: cfg.bind_addr.ip().to_string(),
                port: cfg.bind_addr.port(),
                reason: e.to_string(),
            })?;

        let local_addr = tcp.local_addr()?;
        info!(
            listener = label,
            addr = %local_addr,
            tls = tls.is_some(),
            "listener bound"
        );

        Ok(Self {
            label,
            tcp,
            tls,
            key_fn,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Accept the next connection, configure keep-alive, complete the TLS
    /// handshake if configured, and derive the tunnel key from the verified
    /// peer certificate when client certificates are required.
    pub async fn accept(&self) -> io::Result<(ByteStream, SocketAddr, TunnelKey)> {
        loop {
            let (tcp_stream, peer_addr) = self.tcp.accept().await?;

            if let Err(e) = configure_keepalive(&tcp_stream) {
                warn!(listener = self.label, %peer_addr, error = %e, "failed to configure keep-alive");
            }

            let Some(tls) = &self.tls else {
                return Ok((ByteStream::Plain(tcp_stream), peer_addr, None));
            };

            let tls_stream = match tls.acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(listener = self.label, %peer_addr, error = %e, "TLS handshake failed");
                    continue;
                }
            };
            debug!(listener = self.label, %peer_addr, "TLS handshake complete");

            let stream = ByteStream::Tls(Box::new(TlsStream::Server(tls_stream)));
            let key = if tls.request_cert {
                self.derive_tunnel_key(&stream, peer_addr)
            } else {
                None
            };
            return Ok((stream, peer_addr, key));
        }
    }

    fn derive_tunnel_key(&self, stream: &ByteStream, peer_addr: SocketAddr) -> TunnelKey {
        let cn = stream
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(peer_common_name);
        match cn {
            Some(cn) => {
                let key = (self.key_fn)(&cn);
                debug!(listener = self.label, %peer_addr, %cn, %key, "derived tunnel key");
                Some(key)
            }
            None => {
                debug!(listener = self.label, %peer_addr, "peer certificate carries no common name");
                None
            }
        }
    }
}

fn resolve_material(
    label: &'static str,
    cfg: &ListenerTlsConfig,
) -> Result<TlsMaterial, RelayError> {
    let wrap = |source| RelayError::TlsMaterial {
        listener: label,
        source,
    };

    if let Some(bundle) = &cfg.bundle {
        return load_bundle(bundle).map_err(wrap);
    }
    match (&cfg.cert, &cfg.key) {
        (Some(cert), Some(key)) => Ok(TlsMaterial {
            certs: load_cert_chain(cert).map_err(wrap)?,
            key: load_private_key(key).map_err(wrap)?,
        }),
        (Some(_), None) | (None, Some(_)) => Err(RelayError::Config(format!(
            "{label} listener: certificate and key must be configured together"
        ))),
        (None, None) => {
            info!(
                listener = label,
                common_name = %cfg.cert_common_name,
                "no TLS material configured, generating a self-signed certificate (valid 7 days)"
            );
            Ok(generate_self_signed(&cfg.cert_common_name)
                .map_err(wrap)?
                .into_material())
        }
    }
}

fn build_acceptor(label: &'static str, cfg: &ListenerTlsConfig) -> Result<TlsAcceptor, RelayError> {
    let material = resolve_material(label, cfg)?;

    let client_roots = if cfg.request_cert {
        Some(
            load_trust_anchors(cfg.ca_cert.as_deref()).map_err(|source| RelayError::TlsMaterial {
                listener: label,
                source,
            })?,
        )
    } else {
        None
    };

    let server_config =
        server_tls_config(material, client_roots).map_err(|source| RelayError::TlsMaterial {
            listener: label,
            source,
        })?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
