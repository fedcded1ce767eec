//! Errors from token handling and payload encryption.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Payload could not be sealed
    #[error("payload encryption failed")]
    EncryptionFailed,

    /// Payload is truncated, tampered with, or sealed under another secret
    #[error("payload failed authentication")]
    DecryptionFailed,

    /// Secret of the wrong size
    #[error("secret must be {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// OS randomness unavailable
    #[error("OS random source failed")]
    RandomFailed,

    /// Token is not valid base64url or has the wrong length
    #[error("invalid token encoding")]
    InvalidToken,
}
