//! Tunnel server implementation

use crate::registry::{TunnelInfo, TunnelRegistry};
use crate::shadow;
use burrow_proto::{HandshakeCallback, HandshakeError, ServerHandshake, DEFAULT_HANDSHAKE_TIMEOUT};
use burrow_transport::{Multiplexer, Session, TransportError};
use burrow_transport_h2::{H2Config, H2Multiplexer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunnel server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ServerError {
    /// Peer went away; not worth more than a debug line
    pub fn is_closed(&self) -> bool {
        match self {
            ServerError::Handshake(e) => e.is_closed(),
            ServerError::Transport(e) => e.is_closed(),
            _ => false,
        }
    }
}

/// Tunnel server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Shared secret every client must present
    pub token: String,
    pub handshake_timeout: Duration,
    pub h2: H2Config,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("token", &"<redacted>")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("h2", &self.h2)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            h2: H2Config::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_h2_config(mut self, h2: H2Config) -> Self {
        self.h2 = h2;
        self
    }
}

/// Tunnel server
///
/// Accepts physical connections from clients, runs the handshake on each,
/// and exposes one shadow listener per established tunnel.
pub struct TunnelServer<M = H2Multiplexer> {
    config: ServerConfig,
    multiplexer: Arc<M>,
    callbacks: Vec<Arc<dyn HandshakeCallback>>,
    registry: Arc<TunnelRegistry>,
}

impl TunnelServer<H2Multiplexer> {
    pub fn new(config: ServerConfig) -> Self {
        let multiplexer = H2Multiplexer::new(config.h2.clone());
        Self::with_multiplexer(config, multiplexer)
    }
}

impl<M: Multiplexer> TunnelServer<M> {
    pub fn with_multiplexer(config: ServerConfig, multiplexer: M) -> Self {
        Self {
            config,
            multiplexer: Arc::new(multiplexer),
            callbacks: Vec::new(),
            registry: Arc::new(TunnelRegistry::new()),
        }
    }

    /// Add a callback run on every authenticated handshake, in registration order
    ///
    /// Only affects listeners started afterwards.
    pub fn register_handshake_callback<C>(&mut self, callback: C)
    where
        C: HandshakeCallback + 'static,
    {
        self.callbacks.push(Arc::new(callback));
    }

    /// Bind the physical listener and start accepting clients
    pub async fn listen(&self, bind_addr: SocketAddr) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ServerError::BindError {
                address: bind_addr.to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!("Tunnel server listening on {}", local_addr);

        let handshake = Arc::new(
            ServerHandshake::new(self.config.token.clone())
                .with_timeout(self.config.handshake_timeout)
                .with_callbacks(self.callbacks.clone()),
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            handshake,
            self.multiplexer.clone(),
            self.registry.clone(),
            shutdown.clone(),
        ));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            registry: self.registry.clone(),
            task: Mutex::new(Some(task)),
        })
    }
}

/// Handle to a running listener
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    registry: Arc<TunnelRegistry>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting physical connections
    ///
    /// Established tunnels keep running until their own connections end.
    /// Calling this again is a no-op.
    pub async fn close(&self) -> Result<(), ServerError> {
        self.shutdown.cancel();

        // Wait for the accept loop so the listening socket is gone on return
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Accept loop on {} ended abnormally: {}", self.local_addr, e);
            }
        }
        Ok(())
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Snapshot of live tunnels
    pub fn tunnels(&self) -> Vec<TunnelInfo> {
        self.registry.all()
    }
}

async fn accept_loop<M: Multiplexer>(
    listener: TcpListener,
    handshake: Arc<ServerHandshake>,
    multiplexer: Arc<M>,
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    let handshake = handshake.clone();
                    let multiplexer = multiplexer.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(socket, peer_addr, handshake, multiplexer, registry)
                                .await
                        {
                            if e.is_closed() {
                                debug!("Connection from {} closed: {}", peer_addr, e);
                            } else {
                                warn!("Tunnel from {} failed: {}", peer_addr, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    info!("Tunnel server on {:?} stopped accepting", listener.local_addr());
}

/// Drive one physical connection from handshake to session end
async fn handle_connection<M: Multiplexer>(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    handshake: Arc<ServerHandshake>,
    multiplexer: Arc<M>,
    registry: Arc<TunnelRegistry>,
) -> Result<(), ServerError> {
    let _ = socket.set_nodelay(true);

    // On failure the socket is dropped here, closing the connection
    let accepted = handshake.accept(&mut socket, shadow::bind_shadow).await?;
    let name = accepted.request.name.clone();
    let shadow_addr = accepted.response.shadow_addr.clone();

    let session = Arc::new(multiplexer.accept_session(socket).await?);
    let id = session.session_id();

    info!(
        tunnel = %name,
        peer = %peer_addr,
        shadow = %shadow_addr,
        "Tunnel established"
    );

    registry.register(TunnelInfo {
        id: id.clone(),
        name: name.clone(),
        peer_addr,
        shadow_addr,
        values: accepted.response.values,
        connected_at: chrono::Utc::now(),
    });

    shadow::serve(accepted.listener, session.clone(), &name).await;

    registry.unregister(&id);
    session.close().await;
    info!(tunnel = %name, peer = %peer_addr, "Tunnel closed");
    Ok(())
}
