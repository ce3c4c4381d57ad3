//! Session abstraction for burrow tunnels
//!
//! A tunnel runs one multiplexed session over the physical connection that
//! carried its handshake. The agents never touch framing or flow control;
//! they consume the session through the traits below and move bytes with
//! [`pipe`].
//!
//! ```text
//!   server agent                         client agent
//!  ┌────────────────┐  one TCP connection  ┌────────────────┐
//!  │ accept_session │══════════════════════│ open_session   │
//!  │ open_stream  ──┼─── virtual stream ──>│ accept_stream  │
//!  └────────────────┘                      └────────────────┘
//! ```
//!
//! Naming follows the transport: the client agent dials, so it *opens* the
//! session; the server agent *accepts* it. Streams flow the other way.

pub mod pipe;

pub use pipe::{pipe, PipeStats};

use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl TransportError {
    /// True for conditions that mean "the session is over", not "something broke"
    pub fn is_closed(&self) -> bool {
        match self {
            TransportError::SessionClosed | TransportError::StreamClosed => true,
            TransportError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A multiplexed session over one physical connection
///
/// Implementations must be safe for concurrent `open_stream` and
/// `accept_stream` calls from different tasks.
#[async_trait]
pub trait Session: Send + Sync + Debug + 'static {
    /// The virtual stream type carried by this session
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static;

    /// Open a new virtual stream toward the peer
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept the next virtual stream opened by the peer
    ///
    /// Returns `None` once the session has ended.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Resolves when the session has ended, for any reason
    async fn closed(&self);

    /// Close the session and its physical connection
    ///
    /// Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Number of virtual streams currently open
    fn active_streams(&self) -> usize;

    /// Stable identifier for logs
    fn session_id(&self) -> String;
}

/// Builds sessions on top of an already-handshaken connection
#[async_trait]
pub trait Multiplexer: Send + Sync + Debug + 'static {
    type Session: Session;

    /// Dialing side (the client agent)
    async fn open_session<T>(&self, io: T) -> TransportResult<Self::Session>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Responding side (the server agent)
    async fn accept_session<T>(&self, io: T) -> TransportResult<Self::Session>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}
