//! HTTP/2 session multiplexer using h2
//!
//! Runs a burrow session over the plain TCP connection left behind by the
//! handshake. Transport security, if any, belongs to that connection.
//!
//! # Stream Mapping
//!
//! HTTP/2 streams map naturally to tunnel streams:
//! - Each tunnel stream = one HTTP/2 request/response pair
//! - Data is sent as DATA frames, with h2 flow control as backpressure
//! - Stream close = END_STREAM flag, abort = RST_STREAM
//! - Liveness = PING frames on an interval

pub mod config;
pub mod session;
pub mod stream;

pub use config::H2Config;
pub use session::H2Session;
pub use stream::H2Stream;

use async_trait::async_trait;
use burrow_transport::{Multiplexer, TransportResult};
use tokio::io::{AsyncRead, AsyncWrite};

/// HTTP/2 multiplexer
#[derive(Debug, Clone, Default)]
pub struct H2Multiplexer {
    config: H2Config,
}

impl H2Multiplexer {
    pub fn new(config: H2Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Multiplexer for H2Multiplexer {
    type Session = H2Session;

    async fn open_session<T>(&self, io: T) -> TransportResult<Self::Session>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        H2Session::acceptor(io, &self.config).await
    }

    async fn accept_session<T>(&self, io: T) -> TransportResult<Self::Session>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        H2Session::opener(io, &self.config).await
    }
}
