//! Pluggable key strengthening.

use super::SecretKey;

/// Transforms a password-derived key into a stronger one, typically with
/// help from secure hardware.
///
/// The transform must be deterministic: the same input key always yields the
/// same output key on the same device.
pub trait KeyStrengthener: Send + Sync {
    /// Returns true once the strengthener is ready to use.
    fn is_initialised(&self) -> bool;

    /// Derives the strengthened key.
    fn strengthen_key(&self, key: &SecretKey) -> SecretKey;
}
