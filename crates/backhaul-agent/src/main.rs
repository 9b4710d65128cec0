//! Agent binary
//!
//! Parses the agent's configuration surface, starts the warm pool, and runs
//! until SIGINT/SIGTERM.

use anyhow::Result;
use backhaul_agent::{AgentConfig, AgentPool, ClientTlsConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Agent that exposes a hidden target service through a backhaul relay.
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Run the backhaul agent next to the hidden target service", long_about = None)]
#[command(version)]
struct Args {
    /// Relay host the warm pool dials
    #[arg(long)]
    relay_host: String,

    /// Relay port
    #[arg(long, default_value_t = 10080)]
    relay_port: u16,

    /// Target service host
    #[arg(long, default_value = "127.0.0.1")]
    target_host: String,

    /// Target service port
    #[arg(long)]
    target_port: u16,

    /// Warm pool size
    #[arg(long, default_value_t = 8)]
    pool_size: usize,

    /// Shared secret written as the first bytes of every relay connection
    #[arg(long, env = "BACKHAUL_SECRET")]
    secret: Option<String>,

    /// Dial the relay over TLS
    #[arg(long)]
    relay_tls: bool,

    /// Skip relay certificate verification (accepts any certificate)
    #[arg(long)]
    relay_insecure: bool,

    /// Trust anchors for relay certificate verification
    #[arg(long)]
    relay_ca_cert: Option<PathBuf>,

    /// Client certificate presented to the relay
    #[arg(long)]
    relay_client_cert: Option<PathBuf>,

    /// Private key for the relay client certificate
    #[arg(long)]
    relay_client_key: Option<PathBuf>,

    /// Dial the target over TLS
    #[arg(long)]
    target_tls: bool,

    /// Skip target certificate verification (accepts any certificate)
    #[arg(long)]
    target_insecure: bool,

    /// Trust anchors for target certificate verification
    #[arg(long)]
    target_ca_cert: Option<PathBuf>,

    /// Idle timeout for the relay side in milliseconds (0 disables)
    #[arg(long, default_value_t = 0)]
    relay_timeout_ms: u64,

    /// Idle timeout for the target side in milliseconds (0 disables)
    #[arg(long, default_value_t = 0)]
    target_timeout_ms: u64,

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

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(if args.silent { "warn" } else { &args.log_level })?;

    backhaul_cert::ensure_crypto_provider();

    let mut config = AgentConfig::new(
        args.relay_host,
        args.relay_port,
        args.target_host,
        args.target_port,
    )
    .with_pool_size(args.pool_size);

    if let Some(secret) = args.secret {
        config = config.with_secret(secret);
    }
    if args.relay_tls {
        config.relay_tls = Some(ClientTlsConfig {
            verify: !args.relay_insecure,
            ca_cert: args.relay_ca_cert,
            client_cert: args.relay_client_cert,
            client_key: args.relay_client_key,
        });
    }
    if args.target_tls {
        config.target_tls = Some(ClientTlsConfig {
            verify: !args.target_insecure,
            ca_cert: args.target_ca_cert,
            client_cert: None,
            client_key: None,
        });
    }
    config.relay_timeout = timeout_ms(args.relay_timeout_ms);
    config.target_timeout = timeout_ms(args.target_timeout_ms);

    let pool = std::sync::Arc::new(AgentPool::new(config)?);

    let signal_pool = pool.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_pool.terminate();
    });

    pool.run().await?;
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
