//! Burrow Protocol Definitions
//!
//! This crate defines the handshake headers exchanged once per physical
//! connection, the codec that puts them on the wire, and both sides of the
//! handshake state machine.

pub mod codec;
pub mod handshake;
pub mod header;

pub use codec::{CodecError, HeaderCodec};
pub use handshake::{
    client_handshake, Accepted, HandshakeCallback, HandshakeError, ServerHandshake, ServerInfo,
};
pub use header::{RequestHeader, ResponseHeader, Values};

use std::time::Duration;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded header size (64KB)
pub const MAX_HEADER_SIZE: u32 = 64 * 1024;

/// Default deadline for the whole handshake exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
