//! Tunnel client implementation

use crate::forwarder::TcpForwarder;
use burrow_proto::{
    client_handshake, HandshakeError, RequestHeader, ResponseHeader, Values,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
use burrow_transport::{Multiplexer, Session, TransportError};
use burrow_transport_h2::{H2Config, H2Multiplexer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to server {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// True when retrying with the same configuration cannot succeed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Handshake(HandshakeError::Rejected(_))
                | ClientError::Handshake(HandshakeError::VersionMismatch { .. })
                | ClientError::Handshake(HandshakeError::InvalidToken)
        )
    }

    /// Server went away mid-handshake or mid-session; retry quietly
    pub fn is_closed(&self) -> bool {
        match self {
            ClientError::Handshake(e) => e.is_closed(),
            ClientError::Transport(e) => e.is_closed(),
            _ => false,
        }
    }
}

/// Tunnel client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Server address (e.g., "tunnel.example.com:7835")
    pub server_addr: String,
    /// Requested shadow address; empty lets the server choose
    pub shadow_addr: String,
    /// Tunnel name; generated when absent
    pub name: Option<String>,
    /// Shared secret
    pub token: String,
    /// Local address every tunnel stream is forwarded to
    pub target_addr: String,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub h2: H2Config,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_addr", &self.server_addr)
            .field("shadow_addr", &self.shadow_addr)
            .field("name", &self.name)
            .field("token", &"<redacted>")
            .field("target_addr", &self.target_addr)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(
        server_addr: impl Into<String>,
        token: impl Into<String>,
        target_addr: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            shadow_addr: String::new(),
            name: None,
            token: token.into(),
            target_addr: target_addr.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            h2: H2Config::default(),
        }
    }

    pub fn with_shadow_addr(mut self, shadow_addr: impl Into<String>) -> Self {
        self.shadow_addr = shadow_addr.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_h2_config(mut self, h2: H2Config) -> Self {
        self.h2 = h2;
        self
    }
}

/// Best-effort unique name for diagnostics
fn generate_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("burrow-{}", &id[..8])
}

/// An established tunnel
///
/// Created by [`TunnelClient::connect`]; serve it with [`TunnelClient::run`].
pub struct TunnelClient<M: Multiplexer = H2Multiplexer> {
    name: String,
    response: ResponseHeader,
    session: Arc<M::Session>,
    forwarder: Arc<TcpForwarder>,
}

impl<M: Multiplexer> std::fmt::Debug for TunnelClient<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("name", &self.name)
            .field("shadow_addr", &self.response.shadow_addr)
            .field("session", &self.session)
            .finish()
    }
}

impl TunnelClient<H2Multiplexer> {
    /// Dial the server, run the handshake and start the session
    ///
    /// Returns once the handshake has completed or failed.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let multiplexer = H2Multiplexer::new(config.h2.clone());
        Self::connect_with(config, &multiplexer).await
    }
}

impl<M: Multiplexer> TunnelClient<M> {
    pub async fn connect_with(config: ClientConfig, multiplexer: &M) -> Result<Self, ClientError> {
        let name = config
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(generate_name);

        info!("Connecting to tunnel server at {}", config.server_addr);

        let mut socket = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(&config.server_addr),
        )
        .await
        .map_err(|_| ClientError::Timeout(format!("connecting to {}", config.server_addr)))?
        .map_err(|e| ClientError::ConnectionFailed {
            address: config.server_addr.clone(),
            source: e,
        })?;
        let _ = socket.set_nodelay(true);

        let request = RequestHeader::new(
            name.clone(),
            config.token.clone(),
            config.shadow_addr.clone(),
        );
        let response = client_handshake(&mut socket, &request, config.handshake_timeout).await?;

        let session = multiplexer.open_session(socket).await?;

        info!(
            tunnel = %name,
            shadow = %response.shadow_addr,
            target = %config.target_addr,
            "Tunnel established"
        );

        Ok(Self {
            name,
            response,
            session: Arc::new(session),
            forwarder: Arc::new(TcpForwarder::new(
                config.target_addr,
                config.connect_timeout,
            )),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the server actually bound for this tunnel
    pub fn shadow_addr(&self) -> &str {
        &self.response.shadow_addr
    }

    /// Metadata added by the server's handshake callbacks
    pub fn values(&self) -> &Values {
        &self.response.values
    }

    /// Serve streams until the session ends
    ///
    /// A target that cannot be reached costs only the stream that needed
    /// it. Session closure is a normal exit.
    pub async fn run(&self) -> Result<(), ClientError> {
        debug!(
            tunnel = %self.name,
            target = %self.forwarder.target_addr(),
            "Serving tunnel streams"
        );
        loop {
            let stream = match self.session.accept_stream().await {
                Ok(Some(stream)) => stream,
                Ok(None) => break,
                Err(e) if e.is_closed() => break,
                Err(e) => return Err(e.into()),
            };

            let forwarder = self.forwarder.clone();
            let tunnel = self.name.clone();
            tokio::spawn(async move {
                match forwarder.forward(stream).await {
                    Ok(stats) => {
                        if let Some(e) = stats.error {
                            debug!(tunnel = %tunnel, "Stream ended: {}", e);
                        }
                    }
                    Err(e) => warn!(tunnel = %tunnel, "Dropping stream: {}", e),
                }
            });
        }

        info!(tunnel = %self.name, "Tunnel session closed");
        Ok(())
    }

    /// Close the session and the physical connection
    ///
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.session.close().await;
        Ok(())
    }

    /// Resolves when the session has ended
    pub async fn closed(&self) {
        self.session.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names() {
        let a = generate_name();
        let b = generate_name();
        assert!(a.starts_with("burrow-"));
        assert_eq!(a.len(), "burrow-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let config = ClientConfig::new("server:7835", "s3cret", "127.0.0.1:22")
            .with_shadow_addr(":2222")
            .with_name("ssh");
        let printed = format!("{:?}", config);
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains(":2222"));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ClientError::Handshake(HandshakeError::Rejected("no".into())).is_fatal());
        assert!(!ClientError::Handshake(HandshakeError::Timeout).is_fatal());
        assert!(!ClientError::Timeout("connecting".into()).is_fatal());
    }

    #[test]
    fn test_closed_errors() {
        assert!(ClientError::Handshake(HandshakeError::Closed).is_closed());
        assert!(ClientError::Transport(TransportError::SessionClosed).is_closed());
        assert!(!ClientError::Handshake(HandshakeError::Closed).is_fatal());
        assert!(!ClientError::Handshake(HandshakeError::InvalidToken).is_closed());
        assert!(!ClientError::Timeout("connecting".into()).is_closed());
    }
}
