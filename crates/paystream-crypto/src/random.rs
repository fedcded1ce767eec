//! OS randomness for secrets, tokens and nonces.

use crate::CryptoError;
use rand_core::{OsRng, RngCore};

/// Fill `buf` from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS source is unavailable.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|_| CryptoError::RandomFailed)
}

/// Fresh key material for a server secret.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS source is unavailable.
pub fn random_secret() -> Result<[u8; 32], CryptoError> {
    random_array()
}

/// Fresh `XChaCha20` nonce.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS source is unavailable.
pub fn random_nonce() -> Result<[u8; 24], CryptoError> {
    random_array()
}

fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    fill_random(&mut buf)?;
    Ok(buf)
}
