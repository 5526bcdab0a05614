//! Content normalization and hashing.

use sha2::{Digest, Sha256};

/// Normalize content for dedup: lowercase, trim, collapse inner whitespace.
pub fn normalize(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lowercased alphanumeric words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Token string stored for prefix-free token matching in SQL.
pub fn search_text(text: &str) -> String {
    tokenize(text).join(" ")
}

/// Compute SHA-256 of the normalized content and return it as hex.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(content).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        let hash = content_hash("hello world");
        assert_eq!(hash.len(), 64); // SHA-256 produces 64 hex chars

        assert_eq!(content_hash("hello world"), content_hash("hello world"));
        assert_ne!(content_hash("hello world"), content_hash("hello world!"));
    }

    #[test]
    fn test_known_hash() {
        // Known SHA-256 hash for "hello"
        assert_eq!(
            content_hash("  HELLO "),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_tokenize_splits_on_punctuation() {
        assert_eq!(tokenize("What's my name?"), vec!["what", "s", "my", "name"]);
        assert_eq!(search_text("User works at TechCorp."), "user works at techcorp");
        assert!(tokenize(" -- ").is_empty());
    }

    #[test]
    fn test_normalization_equivalence() {
        assert_eq!(
            content_hash("My name is Alice Johnson"),
            content_hash("  my NAME is   alice\tjohnson\n")
        );
        assert_eq!(normalize("  A\n b  "), "a b");
    }
}
