//! TCP Transport Implementation
//!
//! Reaches the RS-485 bus through a serial-over-IP gateway. With `listen`
//! set, the roles flip and we accept a single peer instead of dialing out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};
use twc_protocol::hex_str;

use super::traits::{ConnectionState, Transport, TransportError, TransportStats};

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpTransportConfig {
    /// Gateway address, or bind address when listening
    pub host: String,
    pub port: u16,
    /// Accept one inbound connection instead of connecting
    pub listen: bool,
    /// Connect/accept timeout in seconds
    pub connect_timeout: u64,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6000,
            listen: false,
            connect_timeout: 10,
        }
    }
}

impl TcpTransportConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.is_empty() {
            return Err(TransportError::ConfigError(
                "Host cannot be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(TransportError::ConfigError(
                "Port cannot be zero".to_string(),
            ));
        }

        if self.connect_timeout == 0 {
            return Err(TransportError::ConfigError(
                "Connect timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TCP transport implementation
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpTransportConfig,
    connection: Option<TcpStream>,
    stats: TransportStats,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Result<Self, TransportError> {
        config.validate()?;

        Ok(Self {
            config,
            connection: None,
            stats: TransportStats::new(),
        })
    }

    async fn open(&self, addr: &str) -> std::io::Result<TcpStream> {
        if self.config.listen {
            let listener = TcpListener::bind(addr).await?;
            info!("Waiting for bus peer on {addr}");
            let (stream, peer) = listener.accept().await?;
            info!("Accepted bus peer {peer}");
            Ok(stream)
        } else {
            TcpStream::connect(addr).await
        }
    }

    fn mark_broken(&mut self) {
        self.connection = None;
        self.stats.connection_state = ConnectionState::Error;
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &str {
        "tcp"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.stats.record_connection_attempt();

        let addr = self.config.socket_addr();
        let connect_timeout = Duration::from_secs(self.config.connect_timeout);
        debug!("Connecting to TCP endpoint: {addr}");

        match timeout(connect_timeout, self.open(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {e}");
                }
                self.connection = Some(stream);
                self.stats.record_successful_connection();
                info!("Successfully connected to TCP endpoint: {addr}");
                Ok(())
            },
            Ok(Err(e)) => {
                let error_msg = format!("Failed to connect to {addr}: {e}");
                error!("{error_msg}");
                self.stats.record_failed_connection();
                Err(TransportError::ConnectionFailed(error_msg))
            },
            Err(_) => {
                let error_msg = format!("Connection to {addr} timed out");
                warn!("{error_msg}");
                self.stats.record_failed_connection();
                Err(TransportError::ConnectionFailed(error_msg))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.connection.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("Error during TCP shutdown: {e}");
            }
            self.stats.record_disconnection();
            info!("Disconnected from TCP endpoint");
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let Some(stream) = self.connection.as_mut() else {
            return Err(TransportError::SendFailed("Not connected".to_string()));
        };

        match stream.write_all(data).await {
            Ok(()) => {
                self.stats.record_bytes_sent(data.len());
                trace!(hex_data = %hex_str(data), direction = "send", "[TCP] Raw packet");
                Ok(data.len())
            },
            Err(e) => {
                let error_msg = format!("Failed to send data: {e}");
                error!("{error_msg}");
                self.mark_broken();
                Err(TransportError::SendFailed(error_msg))
            },
        }
    }

    async fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout_duration: Option<Duration>,
    ) -> Result<usize, TransportError> {
        let receive_timeout = timeout_duration.unwrap_or(Duration::from_millis(25));
        let Some(stream) = self.connection.as_mut() else {
            return Err(TransportError::ReceiveFailed("Not connected".to_string()));
        };

        match timeout(receive_timeout, stream.read(buffer)).await {
            Ok(Ok(0)) => {
                warn!("TCP connection closed by peer");
                self.connection = None;
                self.stats.record_disconnection();
                Err(TransportError::ConnectionLost(
                    "Connection closed by peer".to_string(),
                ))
            },
            Ok(Ok(bytes_read)) => {
                self.stats.record_bytes_received(bytes_read);
                trace!(hex_data = %hex_str(&buffer[..bytes_read]), direction = "recv", "[TCP] Raw packet");
                Ok(bytes_read)
            },
            Ok(Err(e)) => {
                let error_msg = format!("Failed to receive data: {e}");
                error!("{error_msg}");
                self.mark_broken();
                Err(TransportError::ReceiveFailed(error_msg))
            },
            Err(_) => Ok(0),
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_tcp_config_validation() {
        let mut config = TcpTransportConfig::default();
        assert!(config.validate().is_ok());

        config.host = "".to_string();
        assert!(config.validate().is_err());

        config.host = "gateway.local".to_string();
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_tcp_round_trip_through_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut transport = TcpTransport::new(TcpTransportConfig {
            port,
            ..Default::default()
        })
        .unwrap();
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        transport.send(&[0xC0, 0xFD, 0xE2, 0xC0]).await.unwrap();
        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 4 {
            let n = transport
                .receive(&mut buf, Some(Duration::from_millis(500)))
                .await
                .unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, vec![0xC0, 0xFD, 0xE2, 0xC0]);
        assert_eq!(transport.stats().bytes_sent, 4);

        server.await.unwrap();
    }
}
