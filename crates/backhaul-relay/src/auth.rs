//! Shared-secret gate for agent-side pipes
//!
//! An agent proves itself by making the first bytes of its stream equal the
//! configured secret. Bytes accumulate in the pipe's pending buffer as they
//! arrive; the prefix check spans chunk boundaries, and on a match exactly
//! the secret's length is stripped from the head of the logical stream, so
//! any overshoot stays buffered as legitimate tunnel payload.

use backhaul_net::{ByteStream, PendingBuffer, StripOutcome};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Per-pipe authorization failures. These never propagate above the pipe.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("shared secret mismatch")]
    Mismatch,

    #[error("not authorized within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before authorization")]
    Closed,

    #[error("I/O error during authorization: {0}")]
    Io(#[from] std::io::Error),
}

/// Gate `stream` on the shared secret.
///
/// An empty secret authorizes immediately, synchronously, without consuming
/// any data. Otherwise bytes are read into `pending` until the secret is
/// matched and stripped, a divergence is found, or `window` elapses. `window`
/// is only armed by callers when a secret is configured, so idle warm pool
/// members are never torn down here.
pub async fn authorize(
    stream: &mut ByteStream,
    pending: &mut PendingBuffer,
    secret: &[u8],
    window: Option<Duration>,
) -> Result<(), AuthError> {
    if secret.is_empty() {
        return Ok(());
    }

    match window {
        Some(window) => tokio::time::timeout(window, read_until_authorized(stream, pending, secret))
            .await
            .map_err(|_| AuthError::Timeout(window))?,
        None => read_until_authorized(stream, pending, secret).await,
    }
}

async fn read_until_authorized(
    stream: &mut ByteStream,
    pending: &mut PendingBuffer,
    secret: &[u8],
) -> Result<(), AuthError> {
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(AuthError::Closed);
        }
        pending.push(Bytes::copy_from_slice(&buf[..n]));

        match pending.strip_prefix(secret) {
            StripOutcome::Matched => return Ok(()),
            StripOutcome::Mismatch => return Err(AuthError::Mismatch),
            StripOutcome::Incomplete => {}
        }
    }
}
