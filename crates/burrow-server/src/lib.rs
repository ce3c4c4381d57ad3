//! Burrow tunnel server
//!
//! Listens for clients, authenticates them with the burrow handshake, and
//! opens a shadow listener on behalf of each one. Connections accepted on a
//! shadow listener are forwarded to the client through its session.
//!
//! ```no_run
//! use burrow_server::{ServerConfig, TunnelServer};
//!
//! # async fn run() -> Result<(), burrow_server::ServerError> {
//! let server = TunnelServer::new(ServerConfig::new("secret"));
//! let handle = server.listen("0.0.0.0:7835".parse().unwrap()).await?;
//! // ...
//! handle.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod registry;
pub mod server;
pub mod shadow;

pub use registry::{TunnelInfo, TunnelRegistry};
pub use server::{ServerConfig, ServerError, ServerHandle, TunnelServer};
pub use shadow::normalize_shadow_addr;
