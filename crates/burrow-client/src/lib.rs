//! Burrow tunnel client
//!
//! Dials a burrow server from behind a firewall, asks it for a shadow
//! listener, and forwards every connection the server relays to a local
//! target address.

pub mod client;
pub mod forwarder;

pub use client::{ClientConfig, ClientError, TunnelClient};
pub use forwarder::{ForwarderError, TcpForwarder};
