//! Handshake protocol
//!
//! Exactly one request/response exchange runs on every physical connection
//! before any session traffic. The whole exchange is bounded by a single
//! deadline; once it completes the deadline is gone and liveness becomes the
//! multiplexer's concern.
//!
//! ```text
//! client                                   server
//!   | -- RequestHeader{version,name,token,shadow_addr} --> |
//!   |                                  version? token? callbacks? bind?
//!   | <-- ResponseHeader{shadow_addr,error,values} ------- |
//! ```

use crate::codec::{CodecError, HeaderCodec};
use crate::header::{RequestHeader, ResponseHeader};
use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Handshake timed out")]
    Timeout,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Invalid credentials")]
    InvalidToken,

    #[error("{0}")]
    Callback(String),

    #[error("Failed to bind shadow listener on {addr:?}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Handshake rejected by server: {0}")]
    Rejected(String),

    #[error("Codec error: {0}")]
    Codec(CodecError),

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl HandshakeError {
    /// True when the peer simply went away; callers log this at debug level
    pub fn is_closed(&self) -> bool {
        matches!(self, HandshakeError::Closed)
    }
}

fn is_closed_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

impl From<CodecError> for HandshakeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Closed | CodecError::Truncated { .. } => HandshakeError::Closed,
            CodecError::Io(io) if is_closed_kind(io.kind()) => HandshakeError::Closed,
            CodecError::Io(io) => HandshakeError::Io(io),
            other => HandshakeError::Codec(other),
        }
    }
}

/// Server-side enrichment step run on every authenticated request
///
/// Callbacks run in registration order. Returning an error aborts the
/// handshake; its message is sent to the client verbatim.
pub trait HandshakeCallback: Send + Sync {
    fn on_handshake(
        &self,
        request: &RequestHeader,
        response: &mut ResponseHeader,
    ) -> anyhow::Result<()>;
}

impl<F> HandshakeCallback for F
where
    F: Fn(&RequestHeader, &mut ResponseHeader) -> anyhow::Result<()> + Send + Sync,
{
    fn on_handshake(
        &self,
        request: &RequestHeader,
        response: &mut ResponseHeader,
    ) -> anyhow::Result<()> {
        self(request, response)
    }
}

/// Adds `server_version` and a fresh `tunnel_id` to every response
#[derive(Debug, Clone)]
pub struct ServerInfo {
    version: String,
}

impl ServerInfo {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl HandshakeCallback for ServerInfo {
    fn on_handshake(
        &self,
        _request: &RequestHeader,
        response: &mut ResponseHeader,
    ) -> anyhow::Result<()> {
        response.values.insert(
            "server_version".to_string(),
            serde_json::Value::String(self.version.clone()),
        );
        response.values.insert(
            "tunnel_id".to_string(),
            serde_json::Value::String(uuid::Uuid::new_v4().to_string()),
        );
        Ok(())
    }
}

/// Client side: send the request, wait for the terminal response
pub async fn client_handshake<S>(
    io: &mut S,
    request: &RequestHeader,
    timeout: Duration,
) -> Result<ResponseHeader, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let exchange = async {
        HeaderCodec::write(io, request).await?;
        debug!(name = %request.name, "Sent handshake request");

        let response: ResponseHeader = HeaderCodec::read(io).await?;
        if response.is_error() {
            return Err(HandshakeError::Rejected(response.error));
        }
        Ok(response)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Outcome of a successful server-side handshake
#[derive(Debug)]
pub struct Accepted<L> {
    pub request: RequestHeader,
    pub response: ResponseHeader,
    /// Whatever the bind step produced (the shadow listener)
    pub listener: L,
}

/// Server side of the handshake
#[derive(Clone)]
pub struct ServerHandshake {
    token: String,
    version: u32,
    timeout: Duration,
    callbacks: Vec<Arc<dyn HandshakeCallback>>,
}

impl std::fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl ServerHandshake {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            version: crate::PROTOCOL_VERSION,
            timeout: crate::DEFAULT_HANDSHAKE_TIMEOUT,
            callbacks: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the expected protocol version
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn HandshakeCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Vec<Arc<dyn HandshakeCallback>>) -> Self {
        self.callbacks.extend(callbacks);
        self
    }

    /// Run the responding side of the handshake on `io`
    ///
    /// `bind` receives the requested shadow address and returns the bound
    /// listener together with its authoritative address. Callbacks and
    /// binding share the handshake deadline.
    pub async fn accept<S, B, Fut, L>(
        &self,
        io: &mut S,
        bind: B,
    ) -> Result<Accepted<L>, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
        B: FnOnce(String) -> Fut,
        Fut: Future<Output = std::io::Result<(L, String)>>,
    {
        tokio::time::timeout(self.timeout, self.exchange(io, bind))
            .await
            .map_err(|_| HandshakeError::Timeout)?
    }

    async fn exchange<S, B, Fut, L>(
        &self,
        io: &mut S,
        bind: B,
    ) -> Result<Accepted<L>, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
        B: FnOnce(String) -> Fut,
        Fut: Future<Output = std::io::Result<(L, String)>>,
    {
        let request: RequestHeader = HeaderCodec::read(io).await?;
        debug!(
            name = %request.name,
            version = request.version,
            shadow_addr = %request.shadow_addr,
            "Received handshake request"
        );

        if request.version != self.version {
            let err = HandshakeError::VersionMismatch {
                expected: self.version,
                actual: request.version,
            };
            reject(io, &err.to_string()).await;
            return Err(err);
        }

        if !bool::from(request.token.as_bytes().ct_eq(self.token.as_bytes())) {
            let err = HandshakeError::InvalidToken;
            reject(io, &err.to_string()).await;
            return Err(err);
        }

        let mut response = ResponseHeader::default();
        for callback in &self.callbacks {
            if let Err(e) = callback.on_handshake(&request, &mut response) {
                let message = e.to_string();
                reject(io, &message).await;
                return Err(HandshakeError::Callback(message));
            }
        }

        let (listener, bound_addr) = match bind(request.shadow_addr.clone()).await {
            Ok(bound) => bound,
            Err(e) => {
                let err = HandshakeError::Bind {
                    addr: request.shadow_addr.clone(),
                    reason: e.to_string(),
                };
                reject(io, &err.to_string()).await;
                return Err(err);
            }
        };

        response.shadow_addr = bound_addr;
        response.error.clear();
        HeaderCodec::write(io, &response).await?;

        Ok(Accepted {
            request,
            response,
            listener,
        })
    }
}

/// Best-effort error response; the transport may already be gone
async fn reject<S>(io: &mut S, message: &str)
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    if let Err(e) = HeaderCodec::write(io, &ResponseHeader::rejected(message)).await {
        debug!("Failed to send handshake rejection: {}", e);
    }
}
