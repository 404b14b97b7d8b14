//! Transport Layer Traits
//!
//! The bus loop only ever sees a byte pipe. Framing lives in the protocol
//! crate; everything here is about getting raw bytes on and off the wire.

use async_trait::async_trait;
use errors::TwcError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Nothing arrived within the receive window
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl TransportError {
    /// Errors after which the link has to be re-opened
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionLost(_)
                | Self::SendFailed(_)
                | Self::ReceiveFailed(_)
                | Self::IoError(_)
        )
    }
}

impl From<TransportError> for TwcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => TwcError::Timeout(msg),
            TransportError::ConfigError(msg) => TwcError::Config(msg),
            other => TwcError::Transport(other.to_string()),
        }
    }
}

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Transport statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub disconnections: u64,
    pub last_connection: Option<SystemTime>,
    pub connection_state: ConnectionState,
}

impl TransportStats {
    pub fn new() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            connection_attempts: 0,
            successful_connections: 0,
            failed_connections: 0,
            disconnections: 0,
            last_connection: None,
            connection_state: ConnectionState::Disconnected,
        }
    }

    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
        self.connection_state = ConnectionState::Connecting;
    }

    pub fn record_successful_connection(&mut self) {
        self.successful_connections += 1;
        self.last_connection = Some(SystemTime::now());
        self.connection_state = ConnectionState::Connected;
    }

    pub fn record_failed_connection(&mut self) {
        self.failed_connections += 1;
        self.connection_state = ConnectionState::Error;
    }

    pub fn record_disconnection(&mut self) {
        self.disconnections += 1;
        self.connection_state = ConnectionState::Disconnected;
    }

    pub fn record_bytes_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }
}

impl Default for TransportStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A byte pipe to the RS-485 bus
///
/// Implementations never interpret the bytes. `receive` returns `Ok(0)`
/// when the window elapsed without data; only real failures are errors.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Transport type identifier ("serial", "tcp", "dummy")
    fn transport_type(&self) -> &str;

    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Write all of `data`, returning the byte count
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever is available, waiting at most `timeout`
    async fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError>;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> TransportStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats() {
        let mut stats = TransportStats::new();
        assert_eq!(stats.connection_attempts, 0);
        assert_eq!(stats.connection_state, ConnectionState::Disconnected);

        stats.record_connection_attempt();
        assert_eq!(stats.connection_state, ConnectionState::Connecting);

        stats.record_successful_connection();
        assert_eq!(stats.successful_connections, 1);
        assert_eq!(stats.connection_state, ConnectionState::Connected);
        assert!(stats.last_connection.is_some());

        stats.record_bytes_sent(14);
        stats.record_bytes_received(16);
        assert_eq!(stats.bytes_sent, 14);
        assert_eq!(stats.bytes_received, 16);

        stats.record_disconnection();
        assert_eq!(stats.disconnections, 1);
        assert_eq!(stats.connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_error_conversion() {
        let err: TwcError = TransportError::ConnectionLost("port vanished".into()).into();
        assert_eq!(err.error_code(), "TRANSPORT_ERROR");
        assert!(err.to_string().contains("port vanished"));

        let err: TwcError = TransportError::Timeout("1s".into()).into();
        assert_eq!(err.error_code(), "TIMEOUT");

        assert!(TransportError::SendFailed("x".into()).is_fatal());
        assert!(!TransportError::Timeout("x".into()).is_fatal());
    }
}
