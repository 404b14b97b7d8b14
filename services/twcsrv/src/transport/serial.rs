//! Serial Transport Implementation
//!
//! RS-485 adapter on a local serial port. TWCs talk 9600 baud 8-N-1.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};
use twc_protocol::hex_str;

use super::traits::{ConnectionState, Transport, TransportError, TransportStats};

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialTransportConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub port: String,
    pub baud: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// "none", "even" or "odd"
    pub parity: String,
    /// Write timeout in milliseconds
    pub write_timeout_ms: u64,
}

impl Default for SerialTransportConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
            write_timeout_ms: 1000,
        }
    }
}

impl SerialTransportConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.port.is_empty() {
            return Err(TransportError::ConfigError(
                "Port path cannot be empty".to_string(),
            ));
        }

        if self.baud == 0 {
            return Err(TransportError::ConfigError(
                "Baud rate must be greater than zero".to_string(),
            ));
        }

        if ![5, 6, 7, 8].contains(&self.data_bits) {
            return Err(TransportError::ConfigError(
                "Data bits must be 5, 6, 7, or 8".to_string(),
            ));
        }

        if ![1, 2].contains(&self.stop_bits) {
            return Err(TransportError::ConfigError(
                "Stop bits must be 1 or 2".to_string(),
            ));
        }

        if !["none", "even", "odd"].contains(&self.parity.to_lowercase().as_str()) {
            return Err(TransportError::ConfigError(
                "Parity must be none, even, or odd".to_string(),
            ));
        }

        Ok(())
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        }
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// Serial transport implementation
#[derive(Debug)]
pub struct SerialTransport {
    config: SerialTransportConfig,
    port: Option<SerialStream>,
    stats: TransportStats,
}

impl SerialTransport {
    pub fn new(config: SerialTransportConfig) -> Result<Self, TransportError> {
        config.validate()?;

        Ok(Self {
            config,
            port: None,
            stats: TransportStats::new(),
        })
    }

    fn mark_broken(&mut self) {
        self.port = None;
        self.stats.connection_state = ConnectionState::Error;
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> &str {
        "serial"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.stats.record_connection_attempt();
        debug!("Opening serial port: {}", self.config.port);

        let port_result = tokio_serial::new(&self.config.port, self.config.baud)
            .data_bits(self.config.data_bits())
            .parity(self.config.parity())
            .stop_bits(self.config.stop_bits())
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async();

        match port_result {
            Ok(mut port) => {
                #[cfg(unix)]
                port.set_exclusive(false).map_err(|e| {
                    TransportError::IoError(format!("Failed to set exclusive mode: {e}"))
                })?;

                self.port = Some(port);
                self.stats.record_successful_connection();
                info!(
                    "Opened serial port {} at {} baud",
                    self.config.port, self.config.baud
                );
                Ok(())
            },
            Err(e) => {
                let error_msg = format!("Failed to open serial port {}: {e}", self.config.port);
                error!("{error_msg}");
                self.stats.record_failed_connection();
                Err(TransportError::ConnectionFailed(error_msg))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            self.stats.record_disconnection();
            info!("Closed serial port: {}", self.config.port);
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let write_timeout = Duration::from_millis(self.config.write_timeout_ms);
        let Some(port) = self.port.as_mut() else {
            return Err(TransportError::SendFailed(
                "Serial port not connected".to_string(),
            ));
        };

        let send_operation = async {
            port.write_all(data).await?;
            port.flush().await?;
            Ok::<_, std::io::Error>(data.len())
        };

        match timeout(write_timeout, send_operation).await {
            Ok(Ok(bytes_sent)) => {
                self.stats.record_bytes_sent(bytes_sent);
                trace!(hex_data = %hex_str(data), direction = "send", "[Serial] Raw packet");
                Ok(bytes_sent)
            },
            Ok(Err(e)) => {
                let error_msg = format!("Failed to send data: {e}");
                error!("{error_msg}");
                self.mark_broken();
                Err(TransportError::SendFailed(error_msg))
            },
            Err(_) => {
                let error_msg = format!("Send operation timed out after {write_timeout:?}");
                warn!("{error_msg}");
                Err(TransportError::Timeout(error_msg))
            },
        }
    }

    async fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout_duration: Option<Duration>,
    ) -> Result<usize, TransportError> {
        let receive_timeout = timeout_duration.unwrap_or(Duration::from_millis(25));
        let Some(port) = self.port.as_mut() else {
            return Err(TransportError::ReceiveFailed(
                "Serial port not connected".to_string(),
            ));
        };

        match timeout(receive_timeout, port.read(buffer)).await {
            Ok(Ok(bytes_read)) => {
                if bytes_read > 0 {
                    self.stats.record_bytes_received(bytes_read);
                    trace!(hex_data = %hex_str(&buffer[..bytes_read]), direction = "recv", "[Serial] Raw packet");
                }
                Ok(bytes_read)
            },
            Ok(Err(e)) => {
                let error_msg = format!("Failed to receive data: {e}");
                error!("{error_msg}");
                self.mark_broken();
                Err(TransportError::ReceiveFailed(error_msg))
            },
            // An idle bus is the normal case between frames
            Err(_) => Ok(0),
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
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
    fn test_serial_config_validation() {
        let mut config = SerialTransportConfig::default();
        assert!(config.validate().is_ok());

        config.port = "".to_string();
        assert!(config.validate().is_err());

        config.port = "/dev/ttyUSB0".to_string();
        config.baud = 0;
        assert!(config.validate().is_err());

        config.baud = 9600;
        config.data_bits = 9;
        assert!(config.validate().is_err());

        config.data_bits = 8;
        config.stop_bits = 3;
        assert!(config.validate().is_err());

        config.stop_bits = 1;
        config.parity = "mark".to_string();
        assert!(config.validate().is_err());

        config.parity = "Even".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.parity(), tokio_serial::Parity::Even);
    }

    #[tokio::test]
    async fn test_not_connected_initially() {
        let mut transport = SerialTransport::new(SerialTransportConfig::default()).unwrap();
        assert_eq!(transport.transport_type(), "serial");
        assert!(!transport.is_connected());
        assert_eq!(transport.stats().connection_state, ConnectionState::Disconnected);

        let err = transport.send(&[0xC0]).await.unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
    }
}
