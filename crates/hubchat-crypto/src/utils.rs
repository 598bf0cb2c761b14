//! Constant-time comparison helpers.
//!
//! Used wherever a peer-supplied secret is matched against a stored one, so
//! the comparison does not leak how many leading bytes were correct.

use constant_time_eq::constant_time_eq;

/// Compare two byte slices in constant time.
///
/// ```rust
/// use hubchat_crypto::utils::constant_time_compare;
///
/// assert!(constant_time_compare(b"secret", b"secret"));
/// assert!(!constant_time_compare(b"secret", b"secreT"));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

/// Compare two strings in constant time over their UTF-8 bytes.
pub fn secrets_match(a: &str, b: &str) -> bool {
    constant_time_compare(a.as_bytes(), b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare_equal() {
        assert!(constant_time_compare(b"hello world", b"hello world"));
    }

    #[test]
    fn test_constant_time_compare_different() {
        assert!(!constant_time_compare(b"hello world", b"hello worlD"));
    }

    #[test]
    fn test_constant_time_compare_different_length() {
        assert!(!constant_time_compare(b"hello", b"hello world"));
    }

    #[test]
    fn test_secrets_match() {
        let secret = "q5Jm3gG7t1g1cXn5K2VwVq0c0mJc2t4vYQ6cFZ7ZbS8=";
        assert!(secrets_match(secret, secret));
        assert!(!secrets_match(secret, "q5Jm3gG7t1g1cXn5K2VwVq0c0mJc2t4vYQ6cFZ7ZbS9="));
        assert!(!secrets_match(secret, ""));
    }
}
