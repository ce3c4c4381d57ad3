//! HTTP/2 session configuration

use burrow_transport::{TransportError, TransportResult};
use std::time::Duration;

/// Smallest and largest frame sizes allowed by RFC 9113
const MIN_FRAME_SIZE: u32 = 16 * 1024;
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024 - 1;

/// HTTP/2-specific configuration
#[derive(Debug, Clone)]
pub struct H2Config {
    /// Keep-alive interval (PING frames); `None` disables keep-alive
    pub keep_alive_interval: Option<Duration>,

    /// How long to wait for a PONG before the session is considered dead
    pub keep_alive_timeout: Duration,

    /// Deadline for the HTTP/2 connection preface and settings exchange
    pub handshake_timeout: Duration,

    /// Initial per-stream window size
    pub initial_window_size: u32,

    /// Initial connection-level window size
    pub initial_connection_window_size: u32,

    /// Maximum concurrent streams
    pub max_concurrent_streams: u32,

    /// Maximum frame size
    pub max_frame_size: u32,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            keep_alive_interval: Some(Duration::from_secs(30)),
            keep_alive_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            initial_window_size: 1024 * 1024, // 1MB
            initial_connection_window_size: 4 * 1024 * 1024,
            max_concurrent_streams: 1000,
            max_frame_size: MIN_FRAME_SIZE, // 16KB (HTTP/2 default)
        }
    }
}

impl H2Config {
    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive_interval = None;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_window_size(mut self, stream: u32, connection: u32) -> Self {
        self.initial_window_size = stream;
        self.initial_connection_window_size = connection;
        self
    }

    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Check the values h2 would otherwise reject at runtime
    pub fn validate(&self) -> TransportResult<()> {
        if self.initial_window_size == 0 || self.initial_connection_window_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Initial window size must be > 0".to_string(),
            ));
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(TransportError::ConfigurationError(format!(
                "Max frame size must be between {} and {}",
                MIN_FRAME_SIZE, MAX_FRAME_SIZE
            )));
        }
        if self.max_concurrent_streams == 0 {
            return Err(TransportError::ConfigurationError(
                "Max concurrent streams must be > 0".to_string(),
            ));
        }
        if matches!(self.keep_alive_interval, Some(d) if d.is_zero()) {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn client_builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size)
            .max_concurrent_streams(self.max_concurrent_streams);
        builder
    }

    pub(crate) fn server_builder(&self) -> h2::server::Builder {
        let mut builder = h2::server::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size)
            .max_concurrent_streams(self.max_concurrent_streams);
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = H2Config::default();
        assert_eq!(config.initial_window_size, 1024 * 1024);
        assert_eq!(config.max_concurrent_streams, 1000);
        assert_eq!(config.keep_alive_interval, Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(H2Config::default().with_window_size(0, 1).validate().is_err());
        assert!(H2Config::default().with_max_frame_size(1024).validate().is_err());
        assert!(H2Config::default()
            .with_max_frame_size(MAX_FRAME_SIZE + 1)
            .validate()
            .is_err());
        assert!(H2Config::default()
            .with_keep_alive(Duration::ZERO)
            .validate()
            .is_err());
        assert!(H2Config::default().without_keep_alive().validate().is_ok());
    }
}
