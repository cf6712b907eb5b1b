//! Small text utilities shared by the account and thread services.

use std::collections::HashSet;

use domains::{DomainError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Longest mention or tag accepted, marker character included.
pub const MAX_MENTION_LEN: usize = 18;
pub const USERNAME_MAX_CHARS: usize = 16;

/// Trims, then cuts to at most `n` characters, ending in `...` when cut.
pub fn soft_trunc(s: &str, n: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= n {
        return s.to_string();
    }
    if n <= 3 {
        return s.chars().take(n).collect();
    }
    let mut out: String = s.chars().take(n - 3).collect();
    out.push_str("...");
    out
}

/// Lower-cases and keeps only letters, digits and `_`.
pub fn sanitize_username(raw: &str) -> String {
    raw.trim()
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .take(USERNAME_MAX_CHARS)
        .collect()
}

/// Every run of non-whitespace introduced by `marker`, one per word, with
/// the marker still attached.
fn marked_words(text: &str, marker: char) -> impl Iterator<Item = &str> {
    text.split_whitespace().filter_map(move |word| {
        let at = word.find(marker)?;
        let found = &word[at..];
        (found.len() > marker.len_utf8()).then_some(found)
    })
}

fn dedupe_capped<'a>(items: impl Iterator<Item = &'a str>, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .filter(|m| m.chars().count() <= MAX_MENTION_LEN)
        .filter(|m| seen.insert(*m))
        .take(max)
        .map(|m| m[1..].to_string())
        .collect()
}

/// `@name` mentions in order of first appearance, without the `@`.
/// Mentions longer than [`MAX_MENTION_LEN`] are dropped; at most `max` kept.
pub fn extract_mentions(text: &str, max: usize) -> Vec<String> {
    dedupe_capped(marked_words(text, '@'), max)
}

/// `#tag` markers, same rules as mentions.
pub fn extract_tags(text: &str, max: usize) -> Vec<String> {
    let words = text
        .split_whitespace()
        .filter_map(|w| w.strip_prefix('#').map(|_| w))
        .filter(|w| w.len() > 1);
    dedupe_capped(words, max)
}

/// Keyed, truncated digest of a client address. Stored instead of raw IPs.
#[derive(Clone)]
pub struct IpHasher {
    mac: Hmac<Sha256>,
}

impl IpHasher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|e| DomainError::validation(e.to_string()))?;
        Ok(Self { mac })
    }

    pub fn hash(&self, ip: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(b"ip\0");
        mac.update(ip.trim().as_bytes());
        hex::encode(&mac.finalize().into_bytes()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_trunc_is_char_safe() {
        assert_eq!(soft_trunc("  hello  ", 10), "hello");
        assert_eq!(soft_trunc("hello world", 8), "hello...");
        assert_eq!(soft_trunc("你好世界你好世界", 5), "你好...");
        assert_eq!(soft_trunc("abcdef", 2), "ab");
    }

    #[test]
    fn mentions_are_deduped_in_order() {
        let m = extract_mentions("hi @bob and @carol, also @bob again x@dave", 8);
        assert_eq!(m, vec!["bob", "carol,", "dave"]);
    }

    #[test]
    fn long_mentions_are_dropped_and_count_capped() {
        let text = "@a @b @c @d @averyveryverylongname";
        assert_eq!(extract_mentions(text, 3), vec!["a", "b", "c"]);
        assert_eq!(extract_mentions("@averyveryverylongname @z", 5), vec!["z"]);
        assert!(extract_mentions("@ @", 5).is_empty());
    }

    #[test]
    fn tags_need_leading_hash() {
        assert_eq!(extract_tags("#rust is not a#tag #rust #go", 4), vec!["rust", "go"]);
    }

    #[test]
    fn usernames_are_normalised() {
        assert_eq!(sanitize_username("  Alice-Smith! "), "alicesmith");
        assert_eq!(sanitize_username("ÄBC_1"), "äbc_1");
        assert_eq!(sanitize_username("x".repeat(40).as_str()).len(), USERNAME_MAX_CHARS);
    }

    #[test]
    fn ip_hash_is_keyed_and_stable() {
        let a = IpHasher::new(b"key-a").unwrap();
        let b = IpHasher::new(b"key-b").unwrap();
        assert_eq!(a.hash("1.2.3.4"), a.hash("1.2.3.4 "));
        assert_ne!(a.hash("1.2.3.4"), b.hash("1.2.3.4"));
        assert_eq!(a.hash("1.2.3.4").len(), 16);
    }
}
