//! Channel identity and shared-token material
//!
//! Channel ids and shared tokens are generated locally for every create
//! call. Tokens are compared in constant time so a delivery's response
//! timing does not leak how much of a guessed token was right.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Random bytes per shared token
const TOKEN_BYTES: usize = 32;

/// Fresh channel id (`wch-<uuid>`), within the provider's 64-char limit
pub fn new_channel_id() -> String {
    format!("wch-{}", uuid::Uuid::new_v4())
}

/// Fresh URL-safe shared token
pub fn new_shared_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time token comparison
///
/// Unequal lengths return early; token length is not secret.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}

/// Lowercase hex SHA-256 of a delivery body
pub fn content_hash(body: &[u8]) -> String {
    Sha256::digest(body)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_shape() {
        let id = new_channel_id();
        assert!(id.starts_with("wch-"));
        assert!(id.len() <= 64);
        assert_ne!(id, new_channel_id());
    }

    #[test]
    fn test_shared_token_is_url_safe() {
        let token = new_shared_token();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, new_shared_token());
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "abcd"));
        assert!(!tokens_match("abc", ""));
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
    }
}
