//! Policy engine error types

use errors::TwcError;
use thiserror::Error;

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Policy engine errors
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A rule's condition is not one of eq/ne/gt/gte/lt/lte/none/false
    #[error("Unknown condition {condition:?} in policy {policy}")]
    UnknownCondition { policy: String, condition: String },

    /// match/condition/value vectors differ in length or nesting
    #[error("Malformed policy {policy}: {reason}")]
    Malformed { policy: String, reason: String },

    /// An extension names a policy that does not exist
    #[error("Policy not found: {0}")]
    NotFound(String),
}

impl From<PolicyError> for TwcError {
    fn from(err: PolicyError) -> Self {
        TwcError::Policy(err.to_string())
    }
}
