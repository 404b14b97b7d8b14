//! Unified error handling for the TWC load-sharing services
//!
//! Every library crate keeps its own narrow error enum and converts into
//! [`TwcError`] at the service boundary. The variants follow the error
//! taxonomy of the bus controller: transient wire errors, protocol
//! inconsistencies, ID conflicts, capacity breaches, slave timeouts,
//! collaborator failures, dangerous commands and fatal I/O.

use thiserror::Error;

// ============================================================================
// TwcError - Main error type
// ============================================================================

/// Main error type for the TWC services
#[derive(Debug, Error)]
pub enum TwcError {
    // ======================================
    // Wire & Protocol Errors
    // ======================================
    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Refusing to send dangerous command {0}")]
    DangerousCommand(String),

    #[error("TWCID conflict: {0} is already in use on the bus")]
    IdConflict(String),

    // ======================================
    // Bus & Slave Errors
    // ======================================
    #[error("Wiring capacity exceeded: {0}")]
    Capacity(String),

    #[error("Slave {0} timed out")]
    SlaveTimeout(String),

    #[error("More than {max} slave TWCs seen on the bus, dropping {evicted}")]
    TooManySlaves { max: usize, evicted: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    // ======================================
    // Configuration & Settings Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Policy error: {0}")]
    Policy(String),

    // ======================================
    // External Collaborator Errors
    // ======================================
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: String,
        message: String,
    },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // ======================================
    // File & I/O Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Runtime Errors
    // ======================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using TwcError
pub type TwcResult<T> = Result<T, TwcError>;

/// Error category used for log levels and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Corrupt or unexpected bytes on the bus
    Wire,
    /// Link to the bus itself
    Connection,
    Timeout,
    Configuration,
    /// Vehicle API, energy meters, webhooks
    External,
    /// Refused for safety
    Safety,
    Internal,
}

impl TwcError {
    /// Build a collaborator failure
    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Frame(_) | Self::Protocol(_) | Self::IdConflict(_) => ErrorCategory::Wire,
            Self::Transport(_) | Self::SlaveTimeout(_) => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Config(_)
            | Self::InvalidConfig { .. }
            | Self::Settings(_)
            | Self::Policy(_) => ErrorCategory::Configuration,
            Self::Collaborator { .. } | Self::HttpClient(_) => ErrorCategory::External,
            Self::DangerousCommand(_) | Self::Capacity(_) | Self::TooManySlaves { .. } => {
                ErrorCategory::Safety
            },
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) | Self::Other(_) => {
                ErrorCategory::Internal
            },
        }
    }

    /// Check if this error is retryable
    ///
    /// Retryable errors never stop the bus loop; they are logged and the
    /// operation is attempted again on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Wire
                | ErrorCategory::Connection
                | ErrorCategory::Timeout
                | ErrorCategory::External
        )
    }

    /// Stable code for logs and status output
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Frame(_) => "FRAME_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::DangerousCommand(_) => "DANGEROUS_COMMAND",
            Self::IdConflict(_) => "ID_CONFLICT",
            Self::Capacity(_) => "CAPACITY_EXCEEDED",
            Self::SlaveTimeout(_) => "SLAVE_TIMEOUT",
            Self::TooManySlaves { .. } => "TOO_MANY_SLAVES",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Settings(_) => "SETTINGS_ERROR",
            Self::Policy(_) => "POLICY_ERROR",
            Self::Collaborator { .. } => "COLLABORATOR_ERROR",
            Self::HttpClient(_) => "HTTP_CLIENT_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    /// Level at which this error should be logged
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Wire => Level::DEBUG,
            ErrorCategory::Connection | ErrorCategory::Timeout | ErrorCategory::External => {
                Level::WARN
            },
            ErrorCategory::Safety | ErrorCategory::Configuration | ErrorCategory::Internal => {
                Level::ERROR
            },
        }
    }
}

// Conversion traits for common error types
impl From<serde_json::Error> for TwcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for TwcError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for TwcError {
    fn from(err: std::num::ParseFloatError) -> Self {
        Self::Serialization(format!("Invalid float: {}", err))
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::TwcError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::TwcError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($msg:expr) => {
        $crate::TwcError::Protocol($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::TwcError::Protocol(format!($fmt, $($arg)*))
    };
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(TwcError::Timeout("slave heartbeat".into()).is_retryable());
        assert!(TwcError::Frame("checksum".into()).is_retryable());
        assert!(TwcError::collaborator("vehicle api", "502").is_retryable());
        assert!(!TwcError::DangerousCommand("FC 19".into()).is_retryable());
        assert!(!TwcError::Config("missing".into()).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TwcError::TooManySlaves {
                max: 3,
                evicted: "1122".into()
            }
            .error_code(),
            "TOO_MANY_SLAVES"
        );
        assert_eq!(TwcError::Capacity("x".into()).error_code(), "CAPACITY_EXCEEDED");
        assert_eq!(TwcError::Capacity("x".into()).category(), ErrorCategory::Safety);
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(TwcError::Frame("x".into()).log_level(), tracing::Level::DEBUG);
        assert_eq!(TwcError::Transport("x".into()).log_level(), tracing::Level::WARN);
        assert_eq!(
            TwcError::DangerousCommand("x".into()).log_level(),
            tracing::Level::ERROR
        );
    }

    #[test]
    fn test_macros() {
        let err = config_error!("bad value {}", 3);
        assert_eq!(err.to_string(), "Configuration error: bad value 3");
        let err = protocol_error!("unknown command");
        assert!(matches!(err, TwcError::Protocol(_)));
    }

    #[test]
    fn test_from_json_error() {
        let err: TwcError = serde_json::from_str::<u8>("nope").unwrap_err().into();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }
}
