//! Cryptographic operations for TalkVault.
//!
//! The store's master key never touches disk in the clear. It is sealed
//! under the user's password by a [`KeyProtector`] and the resulting blob is
//! kept by the account layer.
//!
//! ## Security Model
//!
//! - Argon2id password derivation with a per-device calibrated memory cost
//! - XChaCha20-Poly1305 authenticated encryption with a random 24-byte nonce
//! - Optional [`KeyStrengthener`] applied to the derived key
//! - Keys are zeroized on drop
//!
//! ## Usage
//!
//! ```rust
//! use talkvault_core::config::KdfConfig;
//! use talkvault_core::crypto::{KeyProtector, SecretKey};
//!
//! let protector = KeyProtector::new(KdfConfig::fixed(8));
//! let key = SecretKey::generate();
//! let blob = protector.encrypt_with_password(key.as_bytes(), "correct horse", None).unwrap();
//! let plain = protector.decrypt_with_password(&blob, "correct horse", None).unwrap();
//! assert_eq!(plain.as_slice(), key.as_bytes());
//! ```

mod key;
pub mod password;
mod protector;
mod strengthener;

pub use key::{SecretKey, KEY_SIZE};
pub use protector::{
    KeyProtector, COST_LEN, FORMAT_PLAIN, FORMAT_STRENGTHENED, HEADER_LEN, MIN_BLOB_LEN, NONCE_LEN,
    SALT_LEN, TAG_LEN,
};
pub use strengthener::KeyStrengthener;
