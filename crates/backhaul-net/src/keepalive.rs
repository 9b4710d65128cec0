//! TCP keep-alive configuration
//!
//! Every socket that participates in a tunnel gets periodic keep-alive probes
//! so silent peer death is detected even when the tunnel is idle.

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// Interval between keep-alive probes on tunnel sockets.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Enable keep-alive probes on an established TCP stream.
///
/// For TLS streams this must run on the underlying TCP socket before the
/// stream is wrapped.
pub fn configure_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_INTERVAL)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
