//! Bidirectional byte pump for a paired tunnel
//!
//! A pump owns both endpoints of a tunnel from pairing until either side
//! ends. Each direction first replays the counterpart's pending bytes, so
//! anything received before pairing is delivered ahead of later traffic, then
//! copies until EOF, an I/O error, or an idle timeout. The first failure on
//! either side collapses the whole tunnel; there is no half-close.

use crate::pending::PendingBuffer;
use crate::stream::ByteStream;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUF_SIZE: usize = 8192;

/// Read from `reader`, failing with `ErrorKind::TimedOut` if `idle` elapses
/// with no bytes. `None` disables the timeout.
pub async fn read_with_idle<R>(
    reader: &mut R,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match idle {
        Some(window) => tokio::time::timeout(window, reader.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout"))?,
        None => reader.read(buf).await,
    }
}

/// Copy bytes between `a` and `b` until either side ends.
///
/// `a_pending` is written to `b` before anything subsequently read from `a`,
/// and vice versa. `a_idle`/`b_idle` bound how long a read from that side may
/// sit with no data. Returns the byte counts `(a_to_b, b_to_a)` on a clean
/// close; an error tears the tunnel down just the same, the counts are only
/// lost from the return value.
pub async fn pump(
    a: ByteStream,
    mut a_pending: PendingBuffer,
    a_idle: Option<Duration>,
    b: ByteStream,
    mut b_pending: PendingBuffer,
    b_idle: Option<Duration>,
) -> io::Result<(u64, u64)> {
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let (mut read_a, mut write_a) = tokio::io::split(a);
    let (mut read_b, mut write_b) = tokio::io::split(b);

    let forward = copy_direction(
        &mut read_a,
        &mut write_b,
        &mut a_pending,
        a_idle,
        &a_to_b,
    );
    let reverse = copy_direction(
        &mut read_b,
        &mut write_a,
        &mut b_pending,
        b_idle,
        &b_to_a,
    );

    // Whichever direction finishes first wins the select; dropping the other
    // future and both halves closes both sockets.
    let result = tokio::select! {
        res = forward => res,
        res = reverse => res,
    };

    result.map(|_| (a_to_b.load(Ordering::Relaxed), b_to_a.load(Ordering::Relaxed)))
}

fn copy_direction<'a, R, W>(
    reader: &'a mut R,
    writer: &'a mut W,
    pending: &'a mut PendingBuffer,
    idle: Option<Duration>,
    counter: &'a AtomicU64,
) -> impl Future<Output = io::Result<()>> + 'a
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async move {
        let replayed = pending.drain_to(writer).await?;
        counter.fetch_add(replayed, Ordering::Relaxed);

        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = read_with_idle(reader, &mut buf, idle).await?;
            if n == 0 {
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pump_copies_both_directions() {
        let (a_far, a_near) = socket_pair().await;
        let (b_far, b_near) = socket_pair().await;

        let pump_task = tokio::spawn(pump(
            ByteStream::Plain(a_near),
            PendingBuffer::new(),
            None,
            ByteStream::Plain(b_near),
            PendingBuffer::new(),
            None,
        ));

        let (mut a_far, mut b_far) = (a_far, b_far);
        a_far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b_far.write_all(b"world").await.unwrap();
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // Closing one far end collapses the tunnel.
        drop(a_far);
        let (a_to_b, b_to_a) = timeout(Duration::from_secs(5), pump_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(a_to_b, 5);
        assert_eq!(b_to_a, 5);

        let n = b_far.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_bytes_arrive_before_later_traffic() {
        let (a_far, a_near) = socket_pair().await;
        let (b_far, b_near) = socket_pair().await;

        let mut pending = PendingBuffer::new();
        pending.push(Bytes::from_static(b"abc"));

        let _pump_task = tokio::spawn(pump(
            ByteStream::Plain(a_near),
            pending,
            None,
            ByteStream::Plain(b_near),
            PendingBuffer::new(),
            None,
        ));

        let (mut a_far, mut b_far) = (a_far, b_far);
        a_far.write_all(b"def").await.unwrap();

        let mut buf = [0u8; 6];
        timeout(Duration::from_secs(5), b_far.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_timeout_tears_tunnel_down() {
        let (a_far, a_near) = socket_pair().await;
        let (b_far, b_near) = socket_pair().await;

        let pump_task = tokio::spawn(pump(
            ByteStream::Plain(a_near),
            PendingBuffer::new(),
            Some(Duration::from_millis(100)),
            ByteStream::Plain(b_near),
            PendingBuffer::new(),
            None,
        ));

        let err = timeout(Duration::from_secs(5), pump_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        // The quiet side observes the teardown as a close.
        let mut b_far = b_far;
        let n = b_far.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);
        drop(a_far);
    }
}
