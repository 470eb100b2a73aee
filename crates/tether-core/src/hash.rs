//! Fast, non-cryptographic hashing for line dedup and message dedup
//! keys. Uses the standard library's `DefaultHasher`; nothing in the
//! relay's correctness depends on collision resistance, only on
//! determinism within a single process run.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub fn fast_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Composite dedup key for cross-source message dedup: `pty:<sessionId>:<hash>`.
pub fn pty_dedup_key(session_id: &str, text: &str) -> String {
    let trimmed = text.trim();
    let prefix: String = trimmed.chars().take(100).collect();
    format!("pty:{session_id}:{:x}", fast_hash(prefix.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_hashes_the_same() {
        assert_eq!(fast_hash(b"hello"), fast_hash(b"hello"));
    }

    #[test]
    fn dedup_key_only_considers_first_100_chars() {
        let long_a = "x".repeat(200);
        let mut long_b = "x".repeat(100);
        long_b.push_str(&"y".repeat(100));
        assert_eq!(pty_dedup_key("A", &long_a), pty_dedup_key("A", &long_b));
    }

    #[test]
    fn dedup_key_is_session_scoped() {
        assert_ne!(pty_dedup_key("A", "hi"), pty_dedup_key("B", "hi"));
    }
}
