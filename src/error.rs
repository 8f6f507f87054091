//! Error types for the Warden engine.

use thiserror::Error;

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// A rule, quota or other addressed entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was being looked up ("rule", "quota")
        kind: &'static str,
        /// The identifier that was not found
        id: String,
    },

    /// A rule or quota definition was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration file or environment could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    pub(crate) fn rule_not_found(id: &str) -> Self {
        WardenError::NotFound {
            kind: "rule",
            id: id.to_string(),
        }
    }

    pub(crate) fn quota_not_found(id: &str) -> Self {
        WardenError::NotFound {
            kind: "quota",
            id: id.to_string(),
        }
    }

    /// Whether this error is the caller's fault (unknown id, bad definition).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WardenError::NotFound { .. } | WardenError::InvalidConfiguration(_)
        )
    }
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = WardenError::rule_not_found("abc");
        assert_eq!(err.to_string(), "rule not found: abc");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_io_is_not_client_error() {
        let err = WardenError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(!err.is_client_error());
    }
}
