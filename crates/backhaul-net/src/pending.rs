//! Ordered buffer for bytes received before a tunnel is ready
//!
//! A connection can receive bytes before its counterpart exists (a public
//! client talking before an agent is paired) or before it is authorized (an
//! agent stream whose head still carries the shared secret). Those bytes are
//! held here, in arrival order, and drained to the counterpart exactly once
//! when the tunnel starts. Chunks are kept as received and never coalesced.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Result of matching a configured prefix against the buffered head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripOutcome {
    /// The buffered head carried the full prefix; it has been removed.
    Matched,
    /// The buffered bytes diverge from the prefix. The connection is bad.
    Mismatch,
    /// Everything buffered so far agrees with the prefix but more bytes are
    /// needed to finish the comparison.
    Incomplete,
}

/// FIFO of owned byte chunks with O(1) append and sequential drain.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Compare the buffered head against `prefix` and remove it on a match.
    ///
    /// The comparison spans chunk boundaries; exactly `prefix.len()` bytes are
    /// removed from the logical head on [`StripOutcome::Matched`], leaving any
    /// overshoot in place as payload. A divergence at any already-buffered
    /// byte reports [`StripOutcome::Mismatch`] immediately.
    pub fn strip_prefix(&mut self, prefix: &[u8]) -> StripOutcome {
        let mut offset = 0;
        for chunk in &self.chunks {
            let take = chunk.len().min(prefix.len() - offset);
            if chunk[..take] != prefix[offset..offset + take] {
                return StripOutcome::Mismatch;
            }
            offset += take;
            if offset == prefix.len() {
                break;
            }
        }
        if offset < prefix.len() {
            return StripOutcome::Incomplete;
        }

        let mut remaining = prefix.len();
        while remaining > 0 {
            let front = self
                .chunks
                .front_mut()
                .expect("buffered length covers the matched prefix");
            if front.len() <= remaining {
                remaining -= front.len();
                self.len -= front.len();
                self.chunks.pop_front();
            } else {
                front.advance(remaining);
                self.len -= remaining;
                remaining = 0;
            }
        }
        StripOutcome::Matched
    }

    /// Write every buffered chunk, in order, to `writer` and leave the buffer
    /// empty. Returns the number of bytes written.
    pub async fn drain_to<W>(&mut self, writer: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.chunks.pop_front() {
            self.len -= chunk.len();
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_exact_match_empties_buffer() {
        let mut buf = PendingBuffer::new();
        buf.push(Bytes::from_static(b"s3cret"));
        assert_eq!(buf.strip_prefix(b"s3cret"), StripOutcome::Matched);
        assert!(buf.is_empty());
    }

    #[test]
    fn strip_keeps_overshoot_as_payload() {
        let mut buf = PendingBuffer::new();
        buf.push(Bytes::from_static(b"s3crethello"));
        assert_eq!(buf.strip_prefix(b"s3cret"), StripOutcome::Matched);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.chunks.front().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn strip_spans_chunk_boundaries() {
        let mut buf = PendingBuffer::new();
        buf.push(Bytes::from_static(b"s3"));
        assert_eq!(buf.strip_prefix(b"s3cret"), StripOutcome::Incomplete);
        buf.push(Bytes::from_static(b"cr"));
        assert_eq!(buf.strip_prefix(b"s3cret"), StripOutcome::Incomplete);
        buf.push(Bytes::from_static(b"etX"));
        assert_eq!(buf.strip_prefix(b"s3cret"), StripOutcome::Matched);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn strip_detects_early_divergence() {
        let mut buf = PendingBuffer::new();
        buf.push(Bytes::from_static(b"W"));
        assert_eq!(buf.strip_prefix(b"s3cret"), StripOutcome::Mismatch);
    }

    #[test]
    fn strip_detects_full_length_mismatch() {
        let mut buf = PendingBuffer::new();
        buf.push(Bytes::from_static(b"WRONG!"));
        assert_eq!(buf.strip_prefix(b"s3cret"), StripOutcome::Mismatch);
    }

    #[tokio::test]
    async fn drain_preserves_order_and_empties() {
        let mut buf = PendingBuffer::new();
        buf.push(Bytes::from_static(b"abc"));
        buf.push(Bytes::from_static(b"def"));

        let mut out = Vec::new();
        let written = buf.drain_to(&mut out).await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(out, b"abcdef");
        assert!(buf.is_empty());

        // A second drain writes nothing: the buffer stays empty after pairing.
        let written = buf.drain_to(&mut out).await.unwrap();
        assert_eq!(written, 0);
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut buf = PendingBuffer::new();
        buf.push(Bytes::new());
        assert!(buf.is_empty());
    }
}
