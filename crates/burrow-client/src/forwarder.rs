use burrow_transport::{pipe, PipeStats};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Errors that can occur during TCP forwarding
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to target address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to target address {0}")]
    Timeout(String),
}

/// Dials the local target for every tunnel stream
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    target_addr: String,
    connect_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(target_addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            target_addr: target_addr.into(),
            connect_timeout,
        }
    }

    pub fn target_addr(&self) -> &str {
        &self.target_addr
    }

    /// Forward traffic between a tunnel stream and the target
    ///
    /// If the target cannot be reached the stream is dropped, which resets
    /// it toward the server.
    pub async fn forward<S>(&self, stream: S) -> Result<PipeStats, ForwarderError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.target_addr),
        )
        .await
        .map_err(|_| ForwarderError::Timeout(self.target_addr.clone()))?
        .map_err(|e| ForwarderError::ConnectionFailed {
            address: self.target_addr.clone(),
            source: e,
        })?;
        let _ = target.set_nodelay(true);

        tracing::debug!(target_addr = %self.target_addr, "Connected to target");

        let stats = pipe(stream, target).await;

        tracing::debug!(
            target_addr = %self.target_addr,
            bytes_to_target = stats.a_to_b,
            bytes_to_tunnel = stats.b_to_a,
            "Forward completed"
        );

        Ok(stats)
    }
}
