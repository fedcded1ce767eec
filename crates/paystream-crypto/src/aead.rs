//! `XChaCha20-Poly1305` payload encryption.
//!
//! Every protocol payload is sealed under a key derived from the connection's
//! shared secret. The output is self-contained:
//!
//! ```text
//! nonce (24 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! A fresh random 192-bit nonce is drawn for each message, so the birthday
//! bound on nonce collisions is 2^96 messages per key.
//!
//! ## Usage
//!
//! ```ignore
//! use paystream_crypto::{SharedSecret, aead::PacketCipher};
//!
//! let cipher = PacketCipher::new(&secret);
//! let sealed = cipher.encrypt(b"frames")?;
//! let opened = cipher.decrypt(&sealed)?;
//! ```

use crate::hash::{ENCRYPTION_KEY_CONTEXT, Kdf, fulfillment_key, fulfillment_with_key};
use crate::{CONDITION_SIZE, CryptoError, FULFILLMENT_SIZE, SharedSecret, random};
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit},
};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Smallest well-formed sealed message (empty plaintext).
pub const MIN_SEALED_LEN: usize = NONCE_SIZE + TAG_SIZE;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; NONCE_SIZE] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Generate a random nonce from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random::random_nonce()?))
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// AEAD encryption key (32 bytes), zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive the payload encryption key for a connection.
    #[must_use]
    pub fn derive(secret: &SharedSecret) -> Self {
        Self(Kdf::new(ENCRYPTION_KEY_CONTEXT).derive_key(secret.as_bytes()))
    }

    /// Seal `plaintext` under an explicit nonce.
    ///
    /// Returns ciphertext with appended tag (`plaintext.len()` + 16 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        XChaCha20Poly1305::new((&self.0).into())
            .encrypt(nonce.as_generic(), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open ciphertext-with-tag under an explicit nonce.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn open(&self, nonce: &Nonce, ciphertext_and_tag: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        XChaCha20Poly1305::new((&self.0).into())
            .decrypt(nonce.as_generic(), ciphertext_and_tag)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// Per-connection crypto state.
///
/// Holds the keys derived once from the shared secret so the hot path does
/// not re-run the KDF for every packet.
#[derive(Clone, ZeroizeOnDrop)]
pub struct PacketCipher {
    key: AeadKey,
    fulfillment_key: [u8; 32],
}

impl PacketCipher {
    /// Derive all per-connection keys from `secret`.
    #[must_use]
    pub fn new(secret: &SharedSecret) -> Self {
        Self {
            key: AeadKey::derive(secret),
            fulfillment_key: fulfillment_key(secret),
        }
    }

    /// Encrypt `plaintext` into `nonce || ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RandomFailed` or `CryptoError::EncryptionFailed`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::generate()?;
        let sealed = self.key.seal(&nonce, plaintext)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(nonce.as_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt a message produced by [`PacketCipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` for truncated input, a wrong
    /// key, or any modification of the message.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < MIN_SEALED_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, sealed) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce).ok_or(CryptoError::DecryptionFailed)?;
        self.key.open(&nonce, sealed)
    }

    /// Fulfillment for a request carrying `data`.
    #[must_use]
    pub fn fulfillment(&self, data: &[u8]) -> [u8; FULFILLMENT_SIZE] {
        fulfillment_with_key(&self.fulfillment_key, data)
    }

    /// Condition a request carrying `data` must be sent with.
    #[must_use]
    pub fn condition(&self, data: &[u8]) -> [u8; CONDITION_SIZE] {
        crate::hash::fulfillment_to_condition(&self.fulfillment(data))
    }
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketCipher(..)")
    }
}

/// Encrypt `plaintext` under the encryption key derived from `secret`.
///
/// # Errors
///
/// Returns `CryptoError::RandomFailed` or `CryptoError::EncryptionFailed`.
pub fn encrypt(secret: &SharedSecret, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    PacketCipher::new(secret).encrypt(plaintext)
}

/// Decrypt a message produced by [`encrypt`] with the same secret.
///
/// # Errors
///
/// Returns `CryptoError::DecryptionFailed` on any tag or format mismatch.
pub fn decrypt(secret: &SharedSecret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    PacketCipher::new(secret).decrypt(data)
}
