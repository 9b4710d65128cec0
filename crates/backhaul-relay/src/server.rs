//! Relay orchestrator
//!
//! Owns both listeners and the matcher, runs one task per accepted
//! connection, and tears everything down on shutdown: listeners are closed,
//! parked pipes are disconnected from the queues, and every pipe task
//! (waiting or pumping) observes the shutdown flag and destroys its sockets.

use crate::auth::authorize;
use crate::config::RelayConfig;
use crate::listener::RelayListener;
use crate::matcher::{Matcher, Offer, Pipe, Side, TunnelKey};
use crate::RelayError;
use backhaul_net::{pump, read_with_idle, ByteStream, PendingBuffer};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Triggers relay shutdown from another task or a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// State shared by every pipe task.
struct PipeContext {
    matcher: Matcher,
    secret: Vec<u8>,
    public_idle: Option<Duration>,
    relay_idle: Option<Duration>,
}

impl PipeContext {
    fn idle_for(&self, side: Side) -> Option<Duration> {
        match side {
            Side::Agent => self.relay_idle,
            Side::Public => self.public_idle,
        }
    }
}

/// A bound relay: both listeners are live, no connections accepted yet.
pub struct Relay {
    public: RelayListener,
    relay: RelayListener,
    ctx: Arc<PipeContext>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Relay {
    /// Bind both listeners. TLS material problems and unbindable addresses
    /// surface here and are fatal.
    pub async fn bind(cfg: RelayConfig) -> Result<Self, RelayError> {
        let public =
            RelayListener::bind("public", &cfg.public, cfg.tunnel_key_fn.clone()).await?;
        let relay = RelayListener::bind("relay", &cfg.relay, cfg.tunnel_key_fn.clone()).await?;

        let ctx = Arc::new(PipeContext {
            matcher: Matcher::new(),
            secret: cfg.secret.unwrap_or_default().into_bytes(),
            public_idle: cfg.public.idle_timeout,
            relay_idle: cfg.relay.idle_timeout,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            public,
            relay,
            ctx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    /// Address of the public listener (useful with ephemeral ports).
    pub fn public_addr(&self) -> io::Result<SocketAddr> {
        self.public.local_addr()
    }

    /// Address of the agent-facing listener.
    pub fn relay_addr(&self) -> io::Result<SocketAddr> {
        self.relay.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Accept and pair connections until shutdown is triggered.
    pub async fn run(self) -> Result<(), RelayError> {
        let Relay {
            public,
            relay,
            ctx,
            shutdown_tx: _shutdown_tx,
            mut shutdown_rx,
        } = self;

        let public_addr = public.local_addr()?;
        let relay_addr = relay.local_addr()?;
        info!(
            public = %public_addr,
            relay = %relay_addr,
            secret = !ctx.secret.is_empty(),
            "relay running"
        );

        // One accept loop per listener so a slow TLS handshake on one side
        // never stalls or cancels accepts on the other.
        let public_loop = tokio::spawn(accept_loop(
            Side::Public,
            public,
            ctx.clone(),
            shutdown_rx.clone(),
        ));
        let relay_loop = tokio::spawn(accept_loop(
            Side::Agent,
            relay,
            ctx.clone(),
            shutdown_rx.clone(),
        ));

        let _ = shutdown_rx.changed().await;

        info!("relay shutting down");
        // Closing the loops drops both listeners; clearing the queues
        // disconnects every parked pipe so its task destroys itself, and
        // pumping tasks observe the shutdown flag.
        public_loop.abort();
        relay_loop.abort();
        let _ = public_loop.await;
        let _ = relay_loop.await;
        ctx.matcher.clear();
        Ok(())
    }
}

async fn accept_loop(
    side: Side,
    listener: RelayListener,
    ctx: Arc<PipeContext>,
    shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr, key)) => {
                let ctx = ctx.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(run_pipe(side, stream, peer_addr, key, ctx, shutdown_rx));
            }
            Err(e) => {
                error!(side = %side, error = %e, "accept failed");
            }
        }
    }
}

/// Drive one accepted connection from authorization to teardown. The
/// enclosing select makes operator shutdown destroy the pipe at any stage.
async fn run_pipe(
    side: Side,
    stream: ByteStream,
    peer_addr: SocketAddr,
    key: TunnelKey,
    ctx: Arc<PipeContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = shutdown_rx.changed() => {
            debug!(side = %side, %peer_addr, "pipe destroyed on shutdown");
        }
        _ = pipe_lifecycle(side, stream, peer_addr, key, &ctx) => {}
    }
}

async fn pipe_lifecycle(
    side: Side,
    mut stream: ByteStream,
    peer_addr: SocketAddr,
    key: TunnelKey,
    ctx: &PipeContext,
) {
    let id = ctx.matcher.next_pipe_id();
    let idle = ctx.idle_for(side);
    let mut pending = PendingBuffer::new();

    // Only agent pipes are gated; the timeout window is armed only when a
    // secret is actually configured.
    if side == Side::Agent {
        match authorize(&mut stream, &mut pending, &ctx.secret, idle).await {
            Ok(()) => debug!(id, %peer_addr, "agent pipe authorized"),
            Err(e) => {
                warn!(id, %peer_addr, error = %e, "agent pipe rejected");
                return;
            }
        }
    }

    let pipe = Pipe {
        id,
        stream,
        pending,
        idle_timeout: idle,
    };

    match ctx.matcher.offer(side, &key, pipe) {
        Offer::Handed => {
            debug!(id, side = %side, %peer_addr, "pipe handed to waiting counterpart");
        }
        Offer::Parked { mut pipe, rx } => {
            debug!(id, side = %side, %peer_addr, "pipe parked awaiting counterpart");
            let Some(counterpart) = await_counterpart(side, &key, &mut pipe, rx, ctx).await
            else {
                return;
            };
            run_tunnel(pipe, counterpart, ctx).await;
        }
    }
}

/// Wait in the pending queue. Bytes that arrive meanwhile are buffered (a
/// public client may talk before any agent exists); EOF, an error, or the
/// idle timeout abandons the queue slot and destroys the pipe.
async fn await_counterpart(
    side: Side,
    key: &TunnelKey,
    pipe: &mut Pipe,
    mut rx: tokio::sync::oneshot::Receiver<Pipe>,
    ctx: &PipeContext,
) -> Option<Pipe> {
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            biased;
            delivered = &mut rx => {
                return match delivered {
                    Ok(counterpart) => Some(counterpart),
                    // Queues were cleared on shutdown.
                    Err(_) => None,
                };
            }
            read = read_with_idle(&mut pipe.stream, &mut buf, pipe.idle_timeout) => {
                match read {
                    Ok(0) => {
                        ctx.matcher.abandon(side, key, pipe.id);
                        debug!(id = pipe.id, side = %side, "pipe closed while pending");
                        return None;
                    }
                    Ok(n) => pipe.pending.push(Bytes::copy_from_slice(&buf[..n])),
                    Err(e) => {
                        ctx.matcher.abandon(side, key, pipe.id);
                        debug!(id = pipe.id, side = %side, error = %e, "pipe failed while pending");
                        return None;
                    }
                }
            }
        }
    }
}

async fn run_tunnel(mine: Pipe, theirs: Pipe, ctx: &PipeContext) {
    let active = ctx.matcher.tunnel_started();
    info!(
        pipe = mine.id,
        counterpart = theirs.id,
        active,
        "tunnel established"
    );

    let result = pump(
        mine.stream,
        mine.pending,
        mine.idle_timeout,
        theirs.stream,
        theirs.pending,
        theirs.idle_timeout,
    )
    .await;

    let active = ctx.matcher.tunnel_closed();
    match result {
        Ok((sent, received)) => {
            debug!(pipe = mine.id, sent, received, active, "tunnel closed");
        }
        Err(e) => {
            debug!(pipe = mine.id, error = %e, active, "tunnel closed with error");
        }
    }
}
