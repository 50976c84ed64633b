//! Content preprocessing for embedding generation.
//!
//! Prepares note text for embedding:
//! 1. Strip fenced code blocks and images
//! 2. Replace markdown links with their label
//! 3. Drop formatting characters (`#`, `*`, `_`, backticks)
//! 4. Collapse whitespace

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static CODE_BLOCK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?```").expect("Failed to compile code block regex"));

static IMAGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[.*?\]\(.*?\)").expect("Failed to compile image regex"));

static LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").expect("Failed to compile link regex"));

static FORMATTING_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[#*_`]").expect("Failed to compile formatting regex"));

static WHITESPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("Failed to compile whitespace regex"));

/// Clean raw markdown into the text that gets embedded and hashed.
///
/// Returns an empty string when nothing indexable is left.
pub fn clean_content(raw: &str) -> String {
    let text = CODE_BLOCK_REGEX.replace_all(raw, "");
    let text = IMAGE_REGEX.replace_all(&text, "");
    let text = LINK_REGEX.replace_all(&text, "$1");
    let text = FORMATTING_REGEX.replace_all(&text, "");
    let text = WHITESPACE_REGEX.replace_all(&text, " ");

    text.trim().to_string()
}

/// Compute the SHA-256 fingerprint of cleaned content as lowercase hex.
///
/// Leading and trailing whitespace does not affect the fingerprint.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Truncate text to at most `max_chars` characters without splitting a
/// UTF-8 sequence.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_code_blocks() {
        let raw = "before\n```rust\nfn main() {}\n```\nafter";
        assert_eq!(clean_content(raw), "before after");
    }

    #[test]
    fn test_strips_images_and_keeps_link_labels() {
        let raw = "See ![diagram](img/d.png) and [the docs](https://example.com).";
        assert_eq!(clean_content(raw), "See and the docs.");
    }

    #[test]
    fn test_strips_formatting() {
        let raw = "## Title\n**bold** _it_ `code`";
        assert_eq!(clean_content(raw), "Title bold it code");
    }

    #[test]
    fn test_whitespace_only_is_empty() {
        assert!(clean_content("  \n\t ").is_empty());
        assert!(clean_content("```\nonly code\n```").is_empty());
    }

    #[test]
    fn test_content_hash_consistency() {
        let hash1 = content_hash("some note text");
        let hash2 = content_hash("some note text");
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert!(hash1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_content_hash_different_for_different_content() {
        assert_ne!(content_hash("note A"), content_hash("note B"));
    }

    #[test]
    fn test_content_hash_trims() {
        assert_eq!(content_hash("  text  "), content_hash("text"));
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
        assert_eq!(truncate_chars("", 3), "");
    }
}
