//! Bidirectional relay with linked shutdown

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const BUFFER_SIZE: usize = 16 * 1024;

/// Outcome of a finished pipe
#[derive(Debug, Default)]
pub struct PipeStats {
    /// Bytes copied from the first endpoint to the second
    pub a_to_b: u64,
    /// Bytes copied from the second endpoint to the first
    pub b_to_a: u64,
    /// First copy error, if the pipe ended on one
    pub error: Option<io::Error>,
}

impl PipeStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Copy bytes between `a` and `b` until either direction finishes
///
/// The direction that reaches EOF first half-closes its destination. The
/// other direction is then abandoned and both endpoints are dropped, which
/// unblocks whatever the peers were waiting on. Errors are reported in the
/// returned stats and are never fatal to the caller.
pub async fn pipe<A, B>(a: A, b: B) -> PipeStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut stats = PipeStats::default();
    let result = {
        let forward = copy_half(&mut a_read, &mut b_write, &mut stats.a_to_b);
        let backward = copy_half(&mut b_read, &mut a_write, &mut stats.b_to_a);

        tokio::select! {
            res = forward => res,
            res = backward => res,
        }
    };
    stats.error = result.err();

    trace!(
        a_to_b = stats.a_to_b,
        b_to_a = stats.b_to_a,
        "Pipe finished"
    );

    // Dropping every half closes both endpoints
    drop((a_read, a_write, b_read, b_write));
    stats
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, ReadBuf};
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_pipe_relays_both_directions() {
        let (mut a_outer, a_inner) = duplex(1024);
        let (b_inner, mut b_outer) = duplex(1024);

        let handle = tokio::spawn(pipe(a_inner, b_inner));

        a_outer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b_outer.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        a_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(a_outer);

        let mut rest = Vec::new();
        b_outer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pipe did not finish")
            .unwrap();
        assert_eq!(stats.a_to_b, 5);
        assert_eq!(stats.b_to_a, 6);
        assert_eq!(stats.total(), 11);
        assert!(stats.error.is_none());
    }

    #[tokio::test]
    async fn test_pipe_large_transfer_propagates_eof() {
        let (mut a_outer, a_inner) = duplex(4096);
        let (b_inner, mut b_outer) = duplex(4096);

        let handle = tokio::spawn(pipe(a_inner, b_inner));

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            a_outer.write_all(&payload).await.unwrap();
            a_outer.shutdown().await.unwrap();
            a_outer
        });

        let mut received = Vec::new();
        b_outer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let _a_outer = writer.await.unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.a_to_b, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_closing_one_peer_unblocks_the_other() {
        let (a_peer, a_inner) = tcp_pair().await;
        let (b_inner, mut b_peer) = tcp_pair().await;

        let handle = tokio::spawn(pipe(a_inner, b_inner));

        // b_peer is blocked reading; closing a_peer must release it
        drop(a_peer);

        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), b_peer.read_to_end(&mut buf))
            .await
            .expect("peer was left half-open");
        assert!(buf.is_empty());

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pipe did not finish")
            .unwrap();
    }

    struct ResetOnRead;

    impl AsyncRead for ResetOnRead {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    impl AsyncWrite for ResetOnRead {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_copy_error_is_reported_not_raised() {
        let (b_inner, mut b_outer) = duplex(1024);

        let stats = pipe(ResetOnRead, b_inner).await;
        let err = stats.error.expect("error should be reported");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        let mut rest = Vec::new();
        b_outer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
