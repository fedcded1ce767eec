//! BLAKE3 key derivation, fulfillments, and conditions.
//!
//! Every derived key uses its own BLAKE3 `derive_key` context string, so
//! material derived for one purpose is never usable for another.

use crate::{CONDITION_SIZE, FULFILLMENT_SIZE, ServerSecret, SharedSecret};

/// Context for deriving the shared-secret generator key from the server secret.
pub const SHARED_SECRET_CONTEXT: &str = "paystream 2024-06 shared secret";

/// Context for deriving the payload encryption key from a shared secret.
pub const ENCRYPTION_KEY_CONTEXT: &str = "paystream 2024-06 encryption key";

/// Context for deriving the fulfillment key from a shared secret.
pub const FULFILLMENT_KEY_CONTEXT: &str = "paystream 2024-06 fulfillment key";

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive a 32-byte key from input key material.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        blake3::derive_key(self.context, ikm)
    }
}

/// Derive the shared secret for a connection token.
///
/// Deterministic in `(server_secret, token)`. Without the server secret the
/// output for one token reveals nothing about the output for another.
/// `token` must be the bare token, without any `~tag` suffix.
#[must_use]
pub fn derive_shared_secret(server_secret: &ServerSecret, token: &[u8]) -> SharedSecret {
    let generator = Kdf::new(SHARED_SECRET_CONTEXT).derive_key(server_secret.as_bytes());
    SharedSecret::from_bytes(*blake3::keyed_hash(&generator, token).as_bytes())
}

/// Derive the fulfillment key for a shared secret.
#[must_use]
pub fn fulfillment_key(secret: &SharedSecret) -> [u8; 32] {
    Kdf::new(FULFILLMENT_KEY_CONTEXT).derive_key(secret.as_bytes())
}

/// Fulfillment for a request whose opaque data is `data`.
///
/// Only holders of `secret` can produce it, and anyone holding it can
/// recompute it from the request alone.
#[must_use]
pub fn generate_fulfillment(secret: &SharedSecret, data: &[u8]) -> [u8; FULFILLMENT_SIZE] {
    fulfillment_with_key(&fulfillment_key(secret), data)
}

/// Fulfillment computed with an already-derived fulfillment key.
#[must_use]
pub fn fulfillment_with_key(key: &[u8; 32], data: &[u8]) -> [u8; FULFILLMENT_SIZE] {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// Condition that the given fulfillment satisfies.
#[must_use]
pub fn fulfillment_to_condition(fulfillment: &[u8; FULFILLMENT_SIZE]) -> [u8; CONDITION_SIZE] {
    hash(fulfillment)
}
