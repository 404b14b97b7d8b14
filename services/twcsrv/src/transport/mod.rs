//! Transport Layer Module
//!
//! Separates the physical link from the bus protocol. The bus loop writes
//! framed bytes and reads raw bytes; it never knows what carries them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Bus loop                             │
//! │       (FrameReceiver, Core, round-robin heartbeats)     │
//! └─────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              Transport Interface (Trait)                │
//! │  connect(), disconnect(), send(), receive()             │
//! └─────────────────────────────────────────────────────────┘
//!                             │
//!          ┌──────────────────┼──────────────────┐
//!          ▼                  ▼                  ▼
//!    ┌───────────┐     ┌─────────────┐    ┌─────────────┐
//!    │  Serial   │     │     TCP     │    │    Dummy    │
//!    │ (RS-485)  │     │  (gateway)  │    │ (simulated) │
//!    └───────────┘     └─────────────┘    └─────────────┘
//! ```

pub mod dummy;
pub mod serial;
pub mod tcp;
pub mod traits;

use serde::{Deserialize, Serialize};
use tracing::info;

pub use dummy::{DummyTransport, DummyTransportConfig};
pub use serial::{SerialTransport, SerialTransportConfig};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use traits::{ConnectionState, Transport, TransportError, TransportStats};

/// The `interface` configuration section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceConfig {
    Serial(SerialTransportConfig),
    Tcp(TcpTransportConfig),
    Dummy(DummyTransportConfig),
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self::Serial(SerialTransportConfig::default())
    }
}

impl InterfaceConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        match self {
            Self::Serial(c) => c.validate(),
            Self::Tcp(c) => c.validate(),
            Self::Dummy(c) => c.validate(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Serial(_) => "serial",
            Self::Tcp(_) => "tcp",
            Self::Dummy(_) => "dummy",
        }
    }
}

/// Build the transport described by `config`, not yet connected
pub fn create_transport(config: &InterfaceConfig) -> Result<Box<dyn Transport>, TransportError> {
    info!("Creating {} transport", config.type_name());
    let transport: Box<dyn Transport> = match config {
        InterfaceConfig::Serial(c) => Box::new(SerialTransport::new(c.clone())?),
        InterfaceConfig::Tcp(c) => Box::new(TcpTransport::new(c.clone())?),
        InterfaceConfig::Dummy(c) => Box::new(DummyTransport::new(c.clone())?),
    };
    Ok(transport)
}
