//! Join-token generation and fingerprinting.
//!
//! A join token stored at rest is 32 random bytes, base62-encoded. A
//! node-unique token carries a stable fingerprint (the first half) plus a
//! random component (the second half), so re-installations can be told
//! apart from legitimate token rotation without storing the full history.

use rand::RngCore;

/// Generates a fresh 32-byte join token, base62-encoded (length 43-51).
#[must_use]
pub fn generate_join_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base62::encode(&bytes)
}

/// A node-unique token split into its stable fingerprint and random parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeUniqueToken<'a> {
    pub fingerprint: &'a str,
    pub random: &'a str,
}

impl<'a> NodeUniqueToken<'a> {
    /// Node-unique tokens are `<fingerprint>.<random>`; anything without the
    /// separator is treated as an opaque legacy token with no fingerprint.
    #[must_use]
    pub fn parse(raw: &'a str) -> Option<Self> {
        let (fingerprint, random) = raw.split_once('.')?;
        if fingerprint.is_empty() || random.is_empty() {
            return None;
        }
        Some(Self { fingerprint, random })
    }

    #[must_use]
    pub fn same_fingerprint(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_fall_within_the_documented_length_range() {
        let token = generate_join_token();
        assert!((43..=51).contains(&token.len()), "len={}", token.len());
    }

    #[test]
    fn parse_splits_on_first_dot() {
        let parsed = NodeUniqueToken::parse("abc123.def456").unwrap();
        assert_eq!(parsed.fingerprint, "abc123");
        assert_eq!(parsed.random, "def456");
    }

    #[test]
    fn parse_rejects_tokens_without_a_fingerprint() {
        assert!(NodeUniqueToken::parse("opaque-legacy-token").is_none());
    }

    #[test]
    fn fingerprint_comparison_ignores_the_random_part() {
        let a = NodeUniqueToken::parse("fp.random-a").unwrap();
        let b = NodeUniqueToken::parse("fp.random-b").unwrap();
        assert!(a.same_fingerprint(&b));
    }
}
