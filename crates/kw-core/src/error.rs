//! Core error types for keyward

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for lifecycle operations
///
/// Structural errors (`Conflict`, `NotFound`, `InvalidArgument`,
/// `Precondition`) are never retried. Network-class errors (`AuthFailed`,
/// `KeyRejected`, `Unavailable`, `Timeout`) only surface from deploy and
/// redeploy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KwError {
    /// Singleton violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing key, connection, repository or file
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad key type, malformed key file or out-of-range field
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires state that does not exist
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Password rejected by the target
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Password accepted and key installed, but the key does not authenticate
    #[error("Key rejected: {0}")]
    KeyRejected(String),

    /// Network or transport failure to the target
    #[error("Host unavailable: {0}")]
    Unavailable(String),

    /// Remote call exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    /// Local I/O or persistence failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KwError {
    /// Stable machine-readable code for API payloads
    pub fn code(&self) -> &'static str {
        match self {
            KwError::Conflict(_) => "conflict",
            KwError::NotFound(_) => "not_found",
            KwError::InvalidArgument(_) => "invalid_argument",
            KwError::Precondition(_) => "precondition",
            KwError::AuthFailed(_) => "auth_failed",
            KwError::KeyRejected(_) => "key_rejected",
            KwError::Unavailable(_) => "unavailable",
            KwError::Timeout => "timeout",
            KwError::Internal(_) => "internal",
        }
    }

    /// HTTP status code this error maps to
    pub fn http_status(&self) -> u16 {
        match self {
            KwError::Conflict(_) => 409,
            KwError::NotFound(_) => 404,
            KwError::InvalidArgument(_) => 400,
            KwError::Precondition(_) => 412,
            KwError::AuthFailed(_) => 401,
            KwError::KeyRejected(_) => 502,
            KwError::Unavailable(_) => 503,
            KwError::Timeout => 504,
            KwError::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for KwError {
    fn from(e: std::io::Error) -> Self {
        KwError::Internal(e.to_string())
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(KwError::Conflict("x".into()).http_status(), 409);
        assert_eq!(KwError::Precondition("x".into()).http_status(), 412);
        assert_eq!(KwError::AuthFailed("x".into()).http_status(), 401);
        assert_eq!(KwError::Unavailable("x".into()).http_status(), 503);
        assert_eq!(KwError::Timeout.http_status(), 504);
    }

    #[test]
    fn test_key_rejection_is_not_a_password_failure() {
        let rejected = KwError::KeyRejected("publickey denied".into());
        assert_eq!(rejected.code(), "key_rejected");
        assert_eq!(rejected.http_status(), 502);
        assert_ne!(rejected.code(), KwError::AuthFailed("x".into()).code());
        assert_eq!(KwError::Unavailable("down".into()).code(), "unavailable");
    }
}
