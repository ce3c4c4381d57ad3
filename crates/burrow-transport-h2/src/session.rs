//! HTTP/2 session implementation
//!
//! The server agent opens streams toward the client agent, so it plays the
//! h2 client role on the physical connection and the client agent plays the
//! h2 server role.

use async_trait::async_trait;
use burrow_transport::{Session, TransportError, TransportResult};
use bytes::Bytes;
use h2::client::SendRequest;
use h2::server::SendResponse;
use h2::{Ping, PingPong, RecvStream};
use http::{Method, Request, Response, Uri};
use std::future::poll_fn;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::H2Config;
use crate::stream::H2Stream;

const STREAM_URI: &str = "http://burrow/stream";

type Incoming = (RecvStream, SendResponse<Bytes>);

enum Role {
    /// h2 client: opens streams
    Opener { send_request: Mutex<SendRequest<Bytes>> },
    /// h2 server: accepts streams
    Acceptor { incoming: Mutex<mpsc::Receiver<Incoming>> },
}

/// One multiplexed session over one physical connection
///
/// The physical connection is owned by a driver task. Cancelling the
/// session's token, or losing the connection, ends that task and drops the
/// connection.
pub struct H2Session {
    session_id: String,
    role: Role,
    cancel: CancellationToken,
    active_streams: Arc<AtomicUsize>,
}

impl std::fmt::Debug for H2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Session")
            .field("session_id", &self.session_id)
            .field("closed", &self.cancel.is_cancelled())
            .field("active_streams", &self.active_streams.load(Ordering::Relaxed))
            .finish()
    }
}

impl H2Session {
    /// Start the stream-opening side (h2 client) on `io`
    pub async fn opener<T>(io: T, config: &H2Config) -> TransportResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let session_id = format!("h2-opener-{}", uuid::Uuid::new_v4());

        let handshake = config.client_builder().handshake::<_, Bytes>(io);
        let (send_request, mut h2_conn) =
            tokio::time::timeout(config.handshake_timeout, handshake)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| {
                    TransportError::ConnectionError(format!("H2 handshake failed: {}", e))
                })?;

        let cancel = CancellationToken::new();
        if let Some(ping_pong) = h2_conn.ping_pong() {
            spawn_keep_alive(ping_pong, config, cancel.clone(), session_id.clone());
        }

        // Spawn connection driver
        let token = cancel.clone();
        let id = session_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = h2_conn => match res {
                    Ok(()) => debug!("[{}] H2 connection closed", id),
                    Err(e) if e.is_go_away() || e.is_io() => {
                        debug!("[{}] H2 connection closed: {}", id, e)
                    }
                    Err(e) => error!("[{}] H2 connection error: {}", id, e),
                },
                _ = token.cancelled() => debug!("[{}] Closing H2 connection", id),
            }
            token.cancel();
        });

        Ok(Self {
            session_id,
            role: Role::Opener {
                send_request: Mutex::new(send_request),
            },
            cancel,
            active_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Start the stream-accepting side (h2 server) on `io`
    pub async fn acceptor<T>(io: T, config: &H2Config) -> TransportResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let session_id = format!("h2-acceptor-{}", uuid::Uuid::new_v4());

        let handshake = config.server_builder().handshake::<_, Bytes>(io);
        let mut h2_conn = tokio::time::timeout(config.handshake_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                TransportError::ConnectionError(format!("H2 handshake failed: {}", e))
            })?;

        let cancel = CancellationToken::new();
        if let Some(ping_pong) = h2_conn.ping_pong() {
            spawn_keep_alive(ping_pong, config, cancel.clone(), session_id.clone());
        }

        let (accept_tx, accept_rx) = mpsc::channel(64);

        // Spawn connection driver
        let token = cancel.clone();
        let id = session_id.clone();
        tokio::spawn(async move {
            loop {
                // Reserve a slot first; while the backlog is full keep driving
                // the connection so existing streams and PINGs still flow
                let permit = tokio::select! {
                    permit = accept_tx.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    res = poll_fn(|cx| h2_conn.poll_closed(cx)) => {
                        match res {
                            Ok(()) => debug!("[{}] H2 connection closed", id),
                            Err(e) => debug!("[{}] H2 connection closed: {}", id, e),
                        }
                        break;
                    }
                    _ = token.cancelled() => {
                        debug!("[{}] Closing H2 connection", id);
                        break;
                    }
                };

                tokio::select! {
                    next = h2_conn.accept() => match next {
                        Some(Ok((request, respond))) => {
                            trace!("[{}] Accepted H2 stream", id);
                            permit.send((request.into_body(), respond));
                        }
                        Some(Err(e)) if e.is_go_away() || e.is_io() => {
                            debug!("[{}] H2 connection closed: {}", id, e);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("[{}] H2 accept error: {}", id, e);
                            break;
                        }
                        None => {
                            debug!("[{}] H2 connection closed", id);
                            break;
                        }
                    },
                    _ = token.cancelled() => {
                        debug!("[{}] Closing H2 connection", id);
                        break;
                    }
                }
            }
            token.cancel();
        });

        Ok(Self {
            session_id,
            role: Role::Acceptor {
                incoming: Mutex::new(accept_rx),
            },
            cancel,
            active_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    async fn request_stream(
        &self,
        send_request: &Mutex<SendRequest<Bytes>>,
    ) -> TransportResult<H2Stream> {
        // SendRequest is Clone; hold the lock only long enough to copy it
        let send_request = send_request.lock().await.clone();

        let mut ready = send_request.ready().await.map_err(map_h2_error)?;

        let mut request = Request::new(());
        *request.method_mut() = Method::POST;
        *request.uri_mut() = Uri::from_static(STREAM_URI);

        let (response, send_stream) = ready
            .send_request(request, false)
            .map_err(map_h2_error)?;

        let response = response.await.map_err(map_h2_error)?;
        if !response.status().is_success() {
            return Err(TransportError::ProtocolError(format!(
                "Peer refused stream with status {}",
                response.status()
            )));
        }

        let stream = H2Stream::new(
            send_stream,
            response.into_body(),
            self.active_streams.clone(),
        );
        debug!("[{}] Opened stream {}", self.session_id, stream.stream_id());
        Ok(stream)
    }
}

impl Drop for H2Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Session for H2Session {
    type Stream = H2Stream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        let send_request = match &self.role {
            Role::Opener { send_request } => send_request,
            Role::Acceptor { .. } => {
                return Err(TransportError::ProtocolError(
                    "Streams are opened by the peer on this session".to_string(),
                ))
            }
        };

        if self.cancel.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        tokio::select! {
            res = self.request_stream(send_request) => res,
            _ = self.cancel.cancelled() => Err(TransportError::SessionClosed),
        }
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let incoming = match &self.role {
            Role::Acceptor { incoming } => incoming,
            // Nothing is ever opened toward this side; wait out the session
            Role::Opener { .. } => {
                self.cancel.cancelled().await;
                return Ok(None);
            }
        };

        let mut incoming = incoming.lock().await;
        loop {
            let next = tokio::select! {
                next = incoming.recv() => next,
                _ = self.cancel.cancelled() => None,
            };

            let Some((recv_stream, mut respond)) = next else {
                return Ok(None);
            };

            // Response headers establish the return direction
            match respond.send_response(Response::new(()), false) {
                Ok(send_stream) => {
                    let stream =
                        H2Stream::new(send_stream, recv_stream, self.active_streams.clone());
                    debug!("[{}] Accepted stream {}", self.session_id, stream.stream_id());
                    return Ok(Some(stream));
                }
                Err(e) => {
                    debug!(
                        "[{}] Dropping stream reset before accept: {}",
                        self.session_id, e
                    );
                }
            }
        }
    }

    async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    async fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!("[{}] Closing session", self.session_id);
            self.cancel.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> String {
        self.session_id.clone()
    }
}

fn spawn_keep_alive(
    ping_pong: PingPong,
    config: &H2Config,
    cancel: CancellationToken,
    session_id: String,
) {
    if let Some(interval) = config.keep_alive_interval {
        tokio::spawn(keep_alive(
            ping_pong,
            interval,
            config.keep_alive_timeout,
            cancel,
            session_id,
        ));
    }
}

/// Send a PING every `interval`; a PONG that misses `timeout` ends the session
async fn keep_alive(
    mut ping_pong: PingPong,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
    session_id: String,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }

        let ping = tokio::time::timeout(timeout, ping_pong.ping(Ping::opaque()));
        tokio::select! {
            res = ping => match res {
                Ok(Ok(_pong)) => trace!("[{}] Keep-alive PONG received", session_id),
                Ok(Err(e)) => {
                    debug!("[{}] Keep-alive stopped: {}", session_id, e);
                    cancel.cancel();
                    return;
                }
                Err(_) => {
                    warn!(
                        "[{}] Keep-alive timed out after {:?}, closing session",
                        session_id, timeout
                    );
                    cancel.cancel();
                    return;
                }
            },
            _ = cancel.cancelled() => return,
        }
    }
}

fn map_h2_error(e: h2::Error) -> TransportError {
    if e.is_go_away() {
        return TransportError::SessionClosed;
    }
    if e.is_io() {
        return match e.into_io() {
            Some(io) => TransportError::IoError(io),
            None => TransportError::SessionClosed,
        };
    }
    if e.is_reset() {
        return TransportError::StreamClosed;
    }
    TransportError::ConnectionError(e.to_string())
}
