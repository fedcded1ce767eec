//! Connection tokens.
//!
//! A token is 18 random bytes. In addresses it is written as 24 characters
//! of unpadded base64url, which stays inside the address character set.

use crate::{CryptoError, ServerSecret, SharedSecret, hash, random};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

/// Raw token size in bytes.
pub const TOKEN_SIZE: usize = 18;

/// Length of an encoded token.
pub const ENCODED_TOKEN_LEN: usize = 24;

/// A random connection token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_SIZE]);

impl Token {
    /// Create a token from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }

    /// Address form of the token.
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parse the address form of a token.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidToken`] if `s` is not 24 base64url characters.
    pub fn decode(s: &str) -> Result<Self, CryptoError> {
        if s.len() != ENCODED_TOKEN_LEN {
            return Err(CryptoError::InvalidToken);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| CryptoError::InvalidToken)?;
        let bytes: [u8; TOKEN_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidToken)?;
        Ok(Self(bytes))
    }

    /// Shared secret this token maps to under `server_secret`.
    ///
    /// The derivation input is the encoded form, so the server can derive it
    /// straight from the address segment.
    #[must_use]
    pub fn shared_secret(&self, server_secret: &ServerSecret) -> SharedSecret {
        hash::derive_shared_secret(server_secret, self.encode().as_bytes())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({})", self.encode())
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Generate a fresh random token.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
pub fn generate_token() -> Result<Token, CryptoError> {
    let mut bytes = [0u8; TOKEN_SIZE];
    random::fill_random(&mut bytes)?;
    Ok(Token(bytes))
}
