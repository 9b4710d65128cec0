//! Warm pool manager
//!
//! Keeps `pool_size` idle connections open to the relay. A member that
//! receives its first byte has been consumed by a public client: it signals
//! for an immediate replacement, dials the target, replays whatever the relay
//! sent while the dial was in flight, and pumps. A member that fails or is
//! closed while still warm is replaced after a fixed backoff. Termination
//! suppresses scheduled replacements and destroys every member.

use crate::config::{AgentConfig, ClientTlsConfig};
use crate::AgentError;
use backhaul_cert::{client_tls_config, ensure_crypto_provider, load_trust_anchors};
use backhaul_net::{configure_keepalive, pump, read_with_idle, ByteStream, PendingBuffer};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_rustls::{TlsConnector, TlsStream};
use tracing::{debug, info, warn};

/// Delay before replacing a pool member that failed or closed while warm.
pub const REPLACEMENT_BACKOFF: Duration = Duration::from_secs(5);

enum Refill {
    /// A member received its first byte and left the pool.
    Consumed,
    /// A member failed or closed while still warm.
    Failed,
}

struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsContext {
    fn build(host: &str, cfg: &ClientTlsConfig) -> Result<Self, AgentError> {
        let roots = load_trust_anchors(cfg.ca_cert.as_deref())?;

        let identity = match (&cfg.client_cert, &cfg.client_key) {
            (Some(cert), Some(key)) => Some(backhaul_cert::TlsMaterial {
                certs: backhaul_cert::load_cert_chain(cert)?,
                key: backhaul_cert::load_private_key(key)?,
            }),
            (None, None) => None,
            _ => {
                return Err(AgentError::InvalidConfig(
                    "client certificate and key must be configured together".to_string(),
                ))
            }
        };

        let config = client_tls_config(cfg.verify, roots, identity)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| AgentError::InvalidConfig(format!("invalid server name {host:?}: {e}")))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    async fn handshake(&self, tcp: TcpStream) -> std::io::Result<ByteStream> {
        let stream = self.connector.connect(self.server_name.clone(), tcp).await?;
        Ok(ByteStream::Tls(Box::new(TlsStream::Client(stream))))
    }
}

/// Everything a member task needs, built once and shared read-only.
struct PoolShared {
    cfg: AgentConfig,
    secret: Vec<u8>,
    relay_tls: Option<TlsContext>,
    target_tls: Option<TlsContext>,
    terminating: AtomicBool,
}

pub struct AgentPool {
    shared: Arc<PoolShared>,
    stop: Notify,
}

impl AgentPool {
    /// Validate the configuration and build the shared TLS contexts.
    pub fn new(cfg: AgentConfig) -> Result<Self, AgentError> {
        ensure_crypto_provider();

        let relay_tls = cfg
            .relay_tls
            .as_ref()
            .map(|tls| TlsContext::build(&cfg.relay_host, tls))
            .transpose()?;
        let target_tls = cfg
            .target_tls
            .as_ref()
            .map(|tls| TlsContext::build(&cfg.target_host, tls))
            .transpose()?;

        let secret = cfg.secret.clone().unwrap_or_default().into_bytes();

        Ok(Self {
            shared: Arc::new(PoolShared {
                cfg,
                secret,
                relay_tls,
                target_tls,
                terminating: AtomicBool::new(false),
            }),
            stop: Notify::new(),
        })
    }

    /// Open the initial pool and keep it replenished until [`terminate`] is
    /// called.
    ///
    /// [`terminate`]: AgentPool::terminate
    pub async fn run(&self) -> Result<(), AgentError> {
        let (refill_tx, mut refill_rx) = mpsc::unbounded_channel();
        let mut members = JoinSet::new();

        info!(
            relay = %self.shared.cfg.relay_addr(),
            target = %self.shared.cfg.target_addr(),
            pool_size = self.shared.cfg.pool_size,
            "agent pool starting"
        );

        for _ in 0..self.shared.cfg.pool_size {
            spawn_member(&mut members, self.shared.clone(), refill_tx.clone(), None);
        }

        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                Some(reason) = refill_rx.recv() => {
                    if self.shared.terminating.load(Ordering::SeqCst) {
                        continue;
                    }
                    let delay = match reason {
                        Refill::Consumed => None,
                        Refill::Failed => Some(REPLACEMENT_BACKOFF),
                    };
                    spawn_member(&mut members, self.shared.clone(), refill_tx.clone(), delay);
                }
            }
        }

        // Destroy every remaining pipe; scheduled replacements die with the
        // set and the terminating flag stops any that already woke up.
        self.shared.terminating.store(true, Ordering::SeqCst);
        members.abort_all();
        while members.join_next().await.is_some() {}
        info!("agent pool terminated");
        Ok(())
    }

    /// Stop the pool: suppress replacements and destroy all members.
    pub fn terminate(&self) {
        self.shared.terminating.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }
}

fn spawn_member(
    members: &mut JoinSet<()>,
    shared: Arc<PoolShared>,
    refill: mpsc::UnboundedSender<Refill>,
    delay: Option<Duration>,
) {
    members.spawn(async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            if shared.terminating.load(Ordering::SeqCst) {
                return;
            }
        }
        run_member(shared, refill).await;
    });
}

/// One pool member, from dial to teardown.
async fn run_member(shared: Arc<PoolShared>, refill: mpsc::UnboundedSender<Refill>) {
    let relay_addr = shared.cfg.relay_addr();

    let mut relay_stream = match open_stream("relay", &relay_addr, shared.relay_tls.as_ref()).await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "relay connection failed");
            let _ = refill.send(Refill::Failed);
            return;
        }
    };

    if !shared.secret.is_empty() {
        if let Err(e) = relay_stream.write_all(&shared.secret).await {
            warn!(error = %e, "failed to present secret");
            let _ = refill.send(Refill::Failed);
            return;
        }
    }
    debug!(relay = %relay_addr, "warm connection established");

    // Idle until the relay forwards the first byte of a public client. The
    // wait is bounded only when a secret is configured.
    let first_byte_window = if shared.secret.is_empty() {
        None
    } else {
        shared.cfg.relay_timeout
    };
    let mut buf = [0u8; 8192];
    let mut pending = PendingBuffer::new();
    match read_with_idle(&mut relay_stream, &mut buf, first_byte_window).await {
        Ok(0) => {
            debug!("relay closed warm connection");
            let _ = refill.send(Refill::Failed);
            return;
        }
        Ok(n) => pending.push(Bytes::copy_from_slice(&buf[..n])),
        Err(e) => {
            debug!(error = %e, "warm connection lost");
            let _ = refill.send(Refill::Failed);
            return;
        }
    }

    // Consumed: the pool opens a replacement immediately.
    let _ = refill.send(Refill::Consumed);

    let target_addr = shared.cfg.target_addr();
    debug!(target = %target_addr, buffered = pending.len(), "pool member consumed, dialing target");

    // Bytes the relay sends while the target dial is in flight keep landing
    // in the pending buffer so nothing is lost or reordered.
    let dial = open_stream("target", &target_addr, shared.target_tls.as_ref());
    tokio::pin!(dial);
    let target_stream = loop {
        tokio::select! {
            dialed = &mut dial => {
                match dialed {
                    Ok(stream) => break stream,
                    Err(e) => {
                        warn!(error = %e, "target dial failed, dropping tunnel");
                        return;
                    }
                }
            }
            read = relay_stream.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("relay closed during target dial");
                        return;
                    }
                    Ok(n) => pending.push(Bytes::copy_from_slice(&buf[..n])),
                    Err(e) => {
                        debug!(error = %e, "relay connection lost during target dial");
                        return;
                    }
                }
            }
        }
    };

    match pump(
        relay_stream,
        pending,
        shared.cfg.relay_timeout,
        target_stream,
        PendingBuffer::new(),
        shared.cfg.target_timeout,
    )
    .await
    {
        Ok((to_target, to_relay)) => {
            debug!(to_target, to_relay, "tunnel closed");
        }
        Err(e) => {
            debug!(error = %e, "tunnel closed with error");
        }
    }
}

async fn open_stream(
    endpoint: &'static str,
    addr: &str,
    tls: Option<&TlsContext>,
) -> Result<ByteStream, AgentError> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| AgentError::PeerUnreachable {
            endpoint,
            addr: addr.to_string(),
            source: e,
        })?;

    if let Err(e) = configure_keepalive(&tcp) {
        warn!(endpoint, error = %e, "failed to configure keep-alive");
    }

    match tls {
        None => Ok(ByteStream::Plain(tcp)),
        Some(ctx) => Ok(ctx.handshake(tcp).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_cert_without_key_is_rejected() {
        let mut cfg = AgentConfig::new("127.0.0.1", 10080, "127.0.0.1", 9000);
        cfg.relay_tls = Some(ClientTlsConfig {
            client_cert: Some("/tmp/cert.pem".into()),
            ..Default::default()
        });

        let err = match AgentPool::new(cfg) {
            Ok(_) => panic!("client certificate without key must be rejected"),
            Err(e) => e,
        };
        assert!(matches!(err, AgentError::InvalidConfig(_)));
    }

    #[test]
    fn plain_config_builds() {
        let cfg = AgentConfig::new("127.0.0.1", 10080, "127.0.0.1", 9000).with_pool_size(3);
        AgentPool::new(cfg).unwrap();
    }

    #[test]
    fn insecure_tls_config_builds() {
        let mut cfg = AgentConfig::new("127.0.0.1", 10080, "127.0.0.1", 9000);
        cfg.relay_tls = Some(ClientTlsConfig {
            verify: false,
            ..Default::default()
        });
        AgentPool::new(cfg).unwrap();
    }
}
