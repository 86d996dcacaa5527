//! Signer error types.

use thiserror::Error;

/// Errors raised while issuing or checking a signed link.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("missing signing credentials: {0}")]
    MissingCredentials(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid bucket locator: {0}")]
    InvalidLocator(String),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("link expiry must be between 1 and {max} seconds, got {secs}")]
    InvalidExpiry { secs: u64, max: u64 },

    #[error("invalid CDN host: {0}")]
    InvalidCdnHost(String),

    #[error("malformed signed link: {0}")]
    Malformed(String),

    #[error("verification failed")]
    VerificationFailed,

    #[error("signed link expired")]
    Expired,
}

/// Result type for signing operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;
