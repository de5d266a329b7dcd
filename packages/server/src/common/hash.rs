use sha2::{Digest, Sha256};

/// Stable key for a url, used in lock, cache and topic names.
///
/// The url is hashed verbatim. Normalization happens before it reaches the core.
pub fn url_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_url_same_key() {
        assert_eq!(url_key("https://x.test"), url_key("https://x.test"));
    }

    #[test]
    fn test_key_is_sha256_hex() {
        let key = url_key("https://x.test");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_is_not_normalized() {
        assert_ne!(url_key("https://x.test"), url_key("https://x.test/"));
    }
}
