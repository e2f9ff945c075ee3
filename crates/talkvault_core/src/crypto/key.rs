//! Symmetric secret keys.

use crate::error::{CoreError, CoreResult};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a secret key in bytes.
pub const KEY_SIZE: usize = 32;

/// A 32-byte symmetric key.
///
/// Used both for the store's master key and for keys derived from
/// passwords. The key is zeroized when dropped and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Wraps raw key bytes.
    #[must_use]
    pub const fn from_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Creates a key from a slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CoreError::invalid_operation(format!(
                "invalid key size: expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Returns the key bytes.
    ///
    /// # Security
    ///
    /// Don't log or persist the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        assert_ne!(SecretKey::generate(), SecretKey::generate());
    }

    #[test]
    fn from_bytes_checks_length() {
        assert!(SecretKey::from_bytes(&[1u8; 31]).is_err());
        let key = SecretKey::from_bytes(&[1u8; 32]).unwrap();
        assert_eq!(key.as_bytes(), &[1u8; 32]);
    }

    #[test]
    fn debug_is_redacted() {
        let key = SecretKey::from_array([0xAB; KEY_SIZE]);
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
    }
}
