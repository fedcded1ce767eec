//! # paystream Crypto
//!
//! Cryptographic primitives for the paystream protocol.
//!
//! This crate provides:
//! - Connection token generation
//! - Deterministic shared-secret derivation from a server secret and a token
//! - `XChaCha20-Poly1305` encryption of protocol payloads
//! - Fulfillment and condition derivation for conditional payments
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Secret derivation | keyed BLAKE3 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Fulfillment | keyed BLAKE3 | 128-bit |
//! | Condition | BLAKE3 | 128-bit collision |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod random;
pub mod token;

pub use aead::{PacketCipher, decrypt, encrypt};
pub use error::CryptoError;
pub use hash::{derive_shared_secret, fulfillment_to_condition, generate_fulfillment};
pub use token::{Token, generate_token};

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Shared secret size
pub const SHARED_SECRET_SIZE: usize = 32;

/// Server secret size
pub const SERVER_SECRET_SIZE: usize = 32;

/// Fulfillment size
pub const FULFILLMENT_SIZE: usize = 32;

/// Condition size
pub const CONDITION_SIZE: usize = 32;

/// Per-connection secret shared between client and server.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    /// Create a shared secret from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SHARED_SECRET_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SHARED_SECRET_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Get raw secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Long-lived server secret from which every connection secret is derived.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ServerSecret([u8; SERVER_SECRET_SIZE]);

impl ServerSecret {
    /// Create a server secret from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; SERVER_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random server secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random::random_secret()?))
    }

    /// Get raw secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SERVER_SECRET_SIZE] {
        &self.0
    }

    /// True if every byte is zero (never a valid configured secret).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_from_slice() {
        let secret = SharedSecret::from_slice(&[7u8; 32]).unwrap();
        assert_eq!(secret.as_bytes(), &[7u8; 32]);

        assert!(matches!(
            SharedSecret::from_slice(&[0u8; 31]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            })
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let shared = SharedSecret::from_bytes([0xAB; 32]);
        let server = ServerSecret::from_bytes([0xCD; 32]);
        assert!(!format!("{shared:?}").contains("171"));
        assert_eq!(format!("{server:?}"), "ServerSecret(..)");
    }

    #[test]
    fn test_server_secret_zero_detection() {
        assert!(ServerSecret::from_bytes([0u8; 32]).is_zero());
        assert!(!ServerSecret::generate().unwrap().is_zero());
    }
}
