//! Wire protocol errors

use errors::TwcError;
use thiserror::Error;

/// Errors raised while framing or decoding bus traffic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("invalid escape sequence DB {0:02X}")]
    InvalidEscape(u8),

    #[error("frame is not delimited by C0")]
    MissingDelimiter,

    #[error("unexpected message length {0}")]
    InvalidLength(usize),

    #[error("unknown command {:02X} {:02X}", .0[0], .0[1])]
    UnknownCommand([u8; 2]),

    #[error("{name} too short: {len} bytes")]
    Truncated { name: &'static str, len: usize },

    #[error("refusing to send dangerous command {:02X} {:02X}", .0[0], .0[1])]
    DangerousCommand([u8; 2]),
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<ProtocolError> for TwcError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::DangerousCommand(_) => TwcError::DangerousCommand(err.to_string()),
            ProtocolError::ChecksumMismatch { .. }
            | ProtocolError::InvalidEscape(_)
            | ProtocolError::MissingDelimiter
            | ProtocolError::InvalidLength(_) => TwcError::Frame(err.to_string()),
            ProtocolError::UnknownCommand(_) | ProtocolError::Truncated { .. } => {
                TwcError::Protocol(err.to_string())
            },
        }
    }
}
