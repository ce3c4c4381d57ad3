//! HTTP/2 stream implementation
//!
//! One virtual stream is one request/response pair. The request body carries
//! bytes from the opening side, the response body carries bytes back.

use bytes::{Buf, Bytes};
use h2::{Reason, RecvStream, SendStream};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// HTTP/2 stream wrapper exposing tokio I/O
///
/// Dropping the stream before shutting it down resets it.
pub struct H2Stream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    buf: Bytes,
    stream_id: u32,
    _guard: ActiveGuard,
}

impl std::fmt::Debug for H2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Stream")
            .field("stream_id", &self.stream_id)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

impl H2Stream {
    pub(crate) fn new(
        send: SendStream<Bytes>,
        recv: RecvStream,
        active: Arc<AtomicUsize>,
    ) -> Self {
        let stream_id = send.stream_id().as_u32();
        Self {
            send,
            recv,
            buf: Bytes::new(),
            stream_id,
            _guard: ActiveGuard::new(active),
        }
    }

    /// HTTP/2 stream identifier, unique within the session
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        read_buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.buf.is_empty() {
            this.buf = loop {
                match ready!(this.recv.poll_data(cx)) {
                    None => return Poll::Ready(Ok(())),
                    Some(Ok(data)) if data.is_empty() && !this.recv.is_end_stream() => continue,
                    Some(Ok(data)) => {
                        let _ = this.recv.flow_control().release_capacity(data.len());
                        break data;
                    }
                    Some(Err(e)) => {
                        return Poll::Ready(match e.reason() {
                            Some(Reason::NO_ERROR) | Some(Reason::CANCEL) => Ok(()),
                            Some(Reason::STREAM_CLOSED) => {
                                Err(io::Error::new(io::ErrorKind::BrokenPipe, e))
                            }
                            _ => Err(h2_to_io_error(e)),
                        });
                    }
                }
            };
        }

        let n = std::cmp::min(this.buf.len(), read_buf.remaining());
        read_buf.put_slice(&this.buf[..n]);
        this.buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.send.reserve_capacity(buf.len());
        let written = match ready!(this.send.poll_capacity(cx)) {
            None => Some(0),
            Some(Ok(cap)) => {
                let n = cap.min(buf.len());
                this.send
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .ok()
                    .map(|()| n)
            }
            Some(Err(_)) => None,
        };

        if let Some(n) = written {
            return Poll::Ready(Ok(n));
        }

        Poll::Ready(Err(reset_to_io_error(ready!(this.send.poll_reset(cx)))))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Empty DATA frame with END_STREAM
        if this.send.send_data(Bytes::new(), true).is_ok() {
            return Poll::Ready(Ok(()));
        }

        match ready!(this.send.poll_reset(cx)) {
            Ok(Reason::NO_ERROR) | Ok(Reason::CANCEL) | Ok(Reason::STREAM_CLOSED) => {
                Poll::Ready(Ok(()))
            }
            other => Poll::Ready(Err(reset_to_io_error(other))),
        }
    }
}

fn reset_to_io_error(reset: Result<Reason, h2::Error>) -> io::Error {
    match reset {
        Ok(Reason::NO_ERROR) | Ok(Reason::CANCEL) | Ok(Reason::STREAM_CLOSED) => {
            io::ErrorKind::BrokenPipe.into()
        }
        Ok(reason) => h2_to_io_error(reason.into()),
        Err(e) => h2_to_io_error(e),
    }
}

fn h2_to_io_error(e: h2::Error) -> io::Error {
    if e.is_io() {
        e.into_io()
            .unwrap_or_else(|| io::Error::from(io::ErrorKind::Other))
    } else {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

/// Keeps the session's open-stream count in step with live streams
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
