//! Per-record encryption of position samples.
//!
//! Every record gets a fresh salt and nonce. The record key is stretched from
//! the traveler id and the salt with PBKDF2-HMAC-SHA256, and the sample is
//! sealed with XChaCha20-Poly1305, so a wrong key or a flipped bit fails
//! decryption instead of producing garbage.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::position::PositionSample;

/// Lower bound on key-stretching rounds.
pub const MIN_KDF_ITERATIONS: u32 = 10_000;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// XChaCha20 nonce length in bytes.
pub const NONCE_LEN: usize = 24;

const FINGERPRINT_CONTEXT: &str = "tripwatch 2024 record owner fingerprint v1";

/// Errors from sealing or opening a record.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The cipher refused to seal the plaintext.
    #[error("encryption failed")]
    Encryption,

    /// Wrong key, corrupted ciphertext, or malformed nonce/salt.
    #[error("decryption failed: wrong key or corrupted record")]
    Decryption,

    /// The sample could not be (de)serialized.
    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Output of [`CryptoCodec::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ciphertext with the Poly1305 tag appended.
    pub ciphertext: Vec<u8>,
    /// Per-record nonce.
    pub iv: Vec<u8>,
    /// Per-record key-derivation salt.
    pub salt: Vec<u8>,
}

/// Stateless record codec.
///
/// Holds only the iteration count; key material is supplied on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoCodec {
    iterations: u32,
}

impl Default for CryptoCodec {
    fn default() -> Self {
        Self::new(MIN_KDF_ITERATIONS)
    }
}

impl CryptoCodec {
    /// Create a codec. Iteration counts below [`MIN_KDF_ITERATIONS`] are raised.
    #[must_use]
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(MIN_KDF_ITERATIONS),
        }
    }

    /// Key-stretching rounds in use.
    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Seal a sample under the given key material.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the cipher fails.
    pub fn encrypt(
        &self,
        sample: &PositionSample,
        key_material: &str,
    ) -> Result<Sealed, CryptoError> {
        let mut salt = vec![0u8; SALT_LEN];
        let mut iv = vec![0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let plaintext = Zeroizing::new(serde_json::to_vec(sample)?);
        let cipher = self.cipher(key_material, &salt);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|_| CryptoError::Encryption)?;

        Ok(Sealed {
            ciphertext,
            iv,
            salt,
        })
    }

    /// Open a sealed sample.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] if the key is wrong or any part of
    /// the record is corrupted. This is permanent for that record.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        salt: &[u8],
        key_material: &str,
    ) -> Result<PositionSample, CryptoError> {
        if iv.len() != NONCE_LEN || salt.len() != SALT_LEN {
            return Err(CryptoError::Decryption);
        }
        let cipher = self.cipher(key_material, salt);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(XNonce::from_slice(iv), ciphertext)
                .map_err(|_| CryptoError::Decryption)?,
        );
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn cipher(&self, key_material: &str, salt: &[u8]) -> XChaCha20Poly1305 {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2_hmac::<Sha256>(key_material.as_bytes(), salt, self.iterations, &mut *key);
        XChaCha20Poly1305::new(Key::from_slice(&*key))
    }
}

/// One-way digest identifying which traveler a record belongs to.
///
/// Stored next to each record so ownership can be checked without keeping the
/// traveler id (which is also the key material) in clear.
#[must_use]
pub fn key_fingerprint(key_material: &str) -> String {
    let digest = blake3::derive_key(FINGERPRINT_CONTEXT, key_material.as_bytes());
    blake3::Hash::from(digest).to_hex()[..32].to_string()
}
