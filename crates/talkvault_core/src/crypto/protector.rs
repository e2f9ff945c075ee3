//! Password-based protection of the master key.
//!
//! Blob layout, all multi-byte integers big-endian:
//!
//! ```text
//! format:u8 | salt:32 | cost:u32 | nonce:24 | ciphertext || tag:16
//! ```
//!
//! The key is derived with Argon2id, where `cost` is the memory size in KiB,
//! and the plaintext is sealed with XChaCha20-Poly1305.

use super::{KeyStrengthener, SecretKey, KEY_SIZE};
use crate::config::KdfConfig;
use crate::error::{CoreError, CoreResult, DecryptionError};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::Zeroizing;

/// Format byte of a blob sealed with a plain password-derived key.
pub const FORMAT_PLAIN: u8 = 0;
/// Format byte of a blob sealed with a strengthened key.
pub const FORMAT_STRENGTHENED: u8 = 1;

/// Length of the KDF salt.
pub const SALT_LEN: usize = 32;
/// Length of the encoded cost.
pub const COST_LEN: usize = 4;
/// Length of the cipher nonce.
pub const NONCE_LEN: usize = 24;
/// Length of the authentication tag.
pub const TAG_LEN: usize = 16;
/// Length of everything before the ciphertext.
pub const HEADER_LEN: usize = 1 + SALT_LEN + COST_LEN + NONCE_LEN;
/// Shortest well-formed blob (empty plaintext).
pub const MIN_BLOB_LEN: usize = HEADER_LEN + TAG_LEN;

const ITERATIONS: u32 = 2;
const LANES: u32 = 1;

/// Encrypts and decrypts small secrets under a password.
///
/// The protector holds no key material; it is cheap to construct and can be
/// shared freely.
#[derive(Debug, Clone, Copy)]
pub struct KeyProtector {
    kdf: KdfConfig,
}

impl KeyProtector {
    /// Creates a protector with the given derivation tuning.
    #[must_use]
    pub const fn new(kdf: KdfConfig) -> Self {
        Self { kdf }
    }

    /// Chooses a KDF cost for this device.
    ///
    /// Times one derivation at the minimum cost, then doubles the cost while
    /// the projected derivation time stays under the target.
    /// The result always lies in the range decryption accepts.
    #[must_use]
    pub fn derive_cost(&self) -> u32 {
        let min = self
            .kdf
            .min_cost
            .clamp(KdfConfig::FLOOR_COST, KdfConfig::CEILING_COST);
        let max = self.kdf.max_cost.clamp(min, KdfConfig::CEILING_COST);
        if min == max {
            return min;
        }

        let start = Instant::now();
        let timed = derive_key(b"password", &[0u8; SALT_LEN], min);
        let elapsed = start.elapsed().max(Duration::from_micros(1));
        if timed.is_err() {
            return min;
        }

        let mut cost = min;
        while cost <= max / 2
            && elapsed.as_secs_f64() * f64::from(cost * 2) / f64::from(min)
                < self.kdf.target.as_secs_f64()
        {
            cost *= 2;
        }
        debug!(cost, ?elapsed, "calibrated key derivation cost");
        cost
    }

    /// Encrypts `plaintext` under `password`.
    ///
    /// When a strengthener is supplied the password-derived key is passed
    /// through it and the blob is marked as strengthened.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation or encryption fails.
    pub fn encrypt_with_password(
        &self,
        plaintext: &[u8],
        password: &str,
        strengthener: Option<&dyn KeyStrengthener>,
    ) -> CoreResult<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);
        let cost = self.derive_cost();

        let mut key = derive_key(password.as_bytes(), &salt, cost)?;
        let format = match strengthener {
            Some(s) => {
                key = s.strengthen_key(&key);
                FORMAT_STRENGTHENED
            }
            None => FORMAT_PLAIN,
        };

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let sealed = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CoreError::encryption("AEAD seal failed"))?;

        let mut blob = Vec::with_capacity(HEADER_LEN + sealed.len());
        blob.push(format);
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&cost.to_be_bytes());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Decrypts a blob produced by [`encrypt_with_password`](Self::encrypt_with_password).
    ///
    /// # Errors
    ///
    /// - [`DecryptionError::InvalidCiphertext`] if the blob is too short, has
    ///   an unknown format byte or an unsupported cost
    /// - [`DecryptionError::KeyStrengthenerError`] if the blob is strengthened
    ///   and no initialised strengthener is supplied
    /// - [`DecryptionError::InvalidPassword`] if authentication fails
    pub fn decrypt_with_password(
        &self,
        blob: &[u8],
        password: &str,
        strengthener: Option<&dyn KeyStrengthener>,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        if blob.len() < MIN_BLOB_LEN {
            return Err(DecryptionError::InvalidCiphertext);
        }
        let format = blob[0];
        if format != FORMAT_PLAIN && format != FORMAT_STRENGTHENED {
            return Err(DecryptionError::InvalidCiphertext);
        }

        let salt = &blob[1..1 + SALT_LEN];
        let mut cost_bytes = [0u8; COST_LEN];
        cost_bytes.copy_from_slice(&blob[1 + SALT_LEN..1 + SALT_LEN + COST_LEN]);
        let cost = u32::from_be_bytes(cost_bytes);
        if !(KdfConfig::FLOOR_COST..=KdfConfig::CEILING_COST).contains(&cost) {
            return Err(DecryptionError::InvalidCiphertext);
        }
        let nonce = &blob[1 + SALT_LEN + COST_LEN..HEADER_LEN];
        let sealed = &blob[HEADER_LEN..];

        let strengthener = if format == FORMAT_STRENGTHENED {
            match strengthener {
                Some(s) if s.is_initialised() => Some(s),
                _ => return Err(DecryptionError::KeyStrengthenerError),
            }
        } else {
            None
        };

        let mut key = derive_key(password.as_bytes(), salt, cost)
            .map_err(|_| DecryptionError::InvalidCiphertext)?;
        if let Some(s) = strengthener {
            key = s.strengthen_key(&key);
        }

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map(Zeroizing::new)
            .map_err(|_| DecryptionError::InvalidPassword)
    }

    /// Returns true if the blob was sealed with a strengthened key.
    ///
    /// Only the format byte is inspected.
    #[must_use]
    pub fn is_encrypted_with_strengthened_key(blob: &[u8]) -> bool {
        blob.first() == Some(&FORMAT_STRENGTHENED)
    }
}

fn derive_key(password: &[u8], salt: &[u8], cost: u32) -> CoreResult<SecretKey> {
    let params = Params::new(cost, ITERATIONS, LANES, Some(KEY_SIZE))
        .map_err(|e| CoreError::encryption(format!("invalid KDF parameters: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| CoreError::encryption(format!("key derivation failed: {e}")))?;
    let key = SecretKey::from_array(out);
    zeroize::Zeroize::zeroize(&mut out);
    Ok(key)
}
