//! Password strength estimation.

use std::collections::HashSet;

/// No strength at all (empty password).
pub const NONE: f32 = 0.0;
/// Weak.
pub const WEAK: f32 = 0.25;
/// Quite weak; the lowest strength accepted for a new account.
pub const QUITE_WEAK: f32 = 0.5;
/// Quite strong.
pub const QUITE_STRONG: f32 = 0.75;
/// Strong.
pub const STRONG: f32 = 1.0;

/// Unique characters needed for a password to count as strong.
const STRONG_UNIQUE_CHARS: usize = 12;

/// Estimates password strength from the number of distinct characters.
///
/// Returns a value in `[0.0, 1.0]`.
#[must_use]
pub fn estimate_strength(password: &str) -> f32 {
    let unique: HashSet<char> = password.chars().collect();
    (unique.len() as f32 / STRONG_UNIQUE_CHARS as f32).min(STRONG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_password_has_no_strength() {
        assert_eq!(estimate_strength(""), NONE);
    }

    #[test]
    fn repeated_characters_count_once() {
        assert_eq!(estimate_strength("aaaaaaaaaaaaaaaa"), 1.0 / 12.0);
        assert_eq!(estimate_strength("abcabc"), WEAK);
    }

    #[test]
    fn strength_is_capped() {
        assert_eq!(estimate_strength("abcdefghijklmnopqrstuvwxyz"), STRONG);
        assert_eq!(estimate_strength("abcdefghijkl"), STRONG);
        assert!(estimate_strength("abcdefghi") >= QUITE_STRONG);
    }
}
