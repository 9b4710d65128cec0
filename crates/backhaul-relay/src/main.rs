//! Relay binary
//!
//! Parses the relay's configuration surface, binds both listeners, and runs
//! until SIGINT/SIGTERM.

use anyhow::Result;
use backhaul_relay::{ListenerConfig, ListenerTlsConfig, Relay, RelayConfig};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Publicly reachable relay that pairs warm agent connections with public
/// clients and pumps bytes between them.
#[derive(Parser, Debug)]
#[command(name = "backhaul-relay")]
#[command(about = "Run the backhaul relay", long_about = None)]
#[command(version)]
struct Args {
    /// Bind address for the public listener
    #[arg(long, default_value = "0.0.0.0")]
    public_host: IpAddr,

    /// Bind port for the public listener
    #[arg(long, default_value_t = 10081)]
    public_port: u16,

    /// Bind address for the agent-facing relay listener
    #[arg(long, default_value = "0.0.0.0")]
    relay_host: IpAddr,

    /// Bind port for the agent-facing relay listener
    #[arg(long, default_value_t = 10080)]
    relay_port: u16,

    /// Idle timeout for public connections in milliseconds (0 disables)
    #[arg(long, default_value_t = 0)]
    public_timeout_ms: u64,

    /// Idle timeout for agent connections in milliseconds (0 disables)
    #[arg(long, default_value_t = 0)]
    relay_timeout_ms: u64,

    /// Terminate TLS on the public listener
    #[arg(long)]
    public_tls: bool,

    /// Terminate TLS on the relay listener
    #[arg(long)]
    relay_tls: bool,

    /// Combined PEM bundle (cert chain + key) for the public listener
    #[arg(long)]
    public_bundle: Option<PathBuf>,

    /// PEM certificate chain for the public listener
    #[arg(long)]
    public_cert: Option<PathBuf>,

    /// PEM private key for the public listener
    #[arg(long)]
    public_key: Option<PathBuf>,

    /// Common name used when autogenerating public listener material
    #[arg(long, default_value = "localhost")]
    public_cert_cn: String,

    /// Trust anchors for verifying public-side client certificates
    #[arg(long)]
    public_ca_cert: Option<PathBuf>,

    /// Require and verify client certificates on the public listener
    #[arg(long)]
    public_request_cert: bool,

    /// Combined PEM bundle (cert chain + key) for the relay listener
    #[arg(long)]
    relay_bundle: Option<PathBuf>,

    /// PEM certificate chain for the relay listener
    #[arg(long)]
    relay_cert: Option<PathBuf>,

    /// PEM private key for the relay listener
    #[arg(long)]
    relay_key: Option<PathBuf>,

    /// Common name used when autogenerating relay listener material
    #[arg(long, default_value = "localhost")]
    relay_cert_cn: String,

    /// Trust anchors for verifying agent client certificates
    #[arg(long)]
    relay_ca_cert: Option<PathBuf>,

    /// Require and verify client certificates on the relay listener
    #[arg(long)]
    relay_request_cert: bool,

    /// Shared secret agents must send as the first bytes of each connection
    #[arg(long, env = "BACKHAUL_SECRET")]
    secret: Option<String>,

    /// Suppress informational logs
    #[arg(long)]
    silent: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn timeout_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn listener_tls(
    enabled: bool,
    bundle: Option<PathBuf>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    cert_cn: String,
    ca_cert: Option<PathBuf>,
    request_cert: bool,
) -> Option<ListenerTlsConfig> {
    enabled.then_some(ListenerTlsConfig {
        bundle,
        cert,
        key,
        cert_common_name: cert_cn,
        ca_cert,
        request_cert,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(if args.silent { "warn" } else { &args.log_level })?;

    backhaul_cert::ensure_crypto_provider();

    let public = ListenerConfig {
        bind_addr: SocketAddr::new(args.public_host, args.public_port),
        tls: listener_tls(
            args.public_tls,
            args.public_bundle,
            args.public_cert,
            args.public_key,
            args.public_cert_cn,
            args.public_ca_cert,
            args.public_request_cert,
        ),
        idle_timeout: timeout_ms(args.public_timeout_ms),
    };
    let relay = ListenerConfig {
        bind_addr: SocketAddr::new(args.relay_host, args.relay_port),
        tls: listener_tls(
            args.relay_tls,
            args.relay_bundle,
            args.relay_cert,
            args.relay_key,
            args.relay_cert_cn,
            args.relay_ca_cert,
            args.relay_request_cert,
        ),
        idle_timeout: timeout_ms(args.relay_timeout_ms),
    };

    let mut config = RelayConfig::new(public, relay);
    if let Some(secret) = args.secret {
        config = config.with_secret(secret);
    }

    let relay = Relay::bind(config).await?;
    let shutdown = relay.shutdown_handle();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.shutdown();
    });

    relay.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
