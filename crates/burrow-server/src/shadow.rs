//! Shadow listeners
//!
//! Every established tunnel owns one public listener on the server. Each
//! connection accepted there becomes a new virtual stream toward the client.

use burrow_transport::{pipe, Session};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

/// Resolve the wildcard forms a client may request
///
/// `""` binds any interface on an ephemeral port, `":port"` binds any
/// interface on that port. Anything else is used as given.
pub fn normalize_shadow_addr(requested: &str) -> String {
    let requested = requested.trim();
    if requested.is_empty() {
        "0.0.0.0:0".to_string()
    } else if requested.starts_with(':') {
        format!("0.0.0.0{}", requested)
    } else {
        requested.to_string()
    }
}

/// Bind the shadow listener for a handshake; returns the authoritative address
pub(crate) async fn bind_shadow(requested: String) -> io::Result<(TcpListener, String)> {
    let addr = normalize_shadow_addr(&requested);
    let listener = TcpListener::bind(&addr).await?;
    let bound = listener.local_addr()?.to_string();
    debug!("Bound shadow listener on {} (requested {:?})", bound, requested);
    Ok((listener, bound))
}

/// Serve a shadow listener until its session ends
///
/// The listener is dropped the moment the session reports closure, so no
/// public port outlives the client that asked for it.
pub(crate) async fn serve<S: Session>(listener: TcpListener, session: Arc<S>, tunnel: &str) {
    loop {
        tokio::select! {
            biased;

            _ = session.closed() => {
                debug!(tunnel, "Session closed, tearing down shadow listener");
                break;
            }
            res = listener.accept() => match res {
                Ok((conn, peer_addr)) => {
                    debug!(tunnel, peer = %peer_addr, "Accepted shadow connection");
                    let session = session.clone();
                    let tunnel = tunnel.to_string();
                    tokio::spawn(async move {
                        forward(conn, peer_addr, session, &tunnel).await;
                    });
                }
                Err(e) => {
                    error!(tunnel, "Shadow listener accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Relay one shadow connection through a fresh virtual stream
async fn forward<S: Session>(
    conn: TcpStream,
    peer_addr: SocketAddr,
    session: Arc<S>,
    tunnel: &str,
) {
    let _ = conn.set_nodelay(true);

    let stream = match session.open_stream().await {
        Ok(stream) => stream,
        Err(e) if e.is_closed() => {
            debug!(tunnel, peer = %peer_addr, "Session gone before stream opened");
            return;
        }
        Err(e) => {
            warn!(tunnel, peer = %peer_addr, "Failed to open stream: {}", e);
            return;
        }
    };

    let stats = pipe(conn, stream).await;
    match stats.error {
        Some(e) => debug!(
            tunnel,
            peer = %peer_addr,
            sent = stats.a_to_b,
            received = stats.b_to_a,
            "Shadow connection ended: {}",
            e
        ),
        None => debug!(
            tunnel,
            peer = %peer_addr,
            sent = stats.a_to_b,
            received = stats.b_to_a,
            "Shadow connection closed"
        ),
    }
}
