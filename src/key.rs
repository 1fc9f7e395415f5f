//! Key validation and namespacing.

use crate::error::{Error, Result};

/// Separator between namespace and logical key.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Turns logical keys into physical (namespaced) keys.
///
/// Final key format: `"{namespace}:{key}"`, or just `"{key}"` when the
/// namespace is empty. Validation happens on the logical key, before any
/// breaker or backend interaction.
///
/// ```
/// use cache_mesh::key::CacheKeyBuilder;
///
/// let keys = CacheKeyBuilder::new("users", 250);
/// assert_eq!(keys.build("42").unwrap(), "users:42");
/// assert!(keys.build("").is_err());
/// ```
#[derive(Clone, Debug)]
pub struct CacheKeyBuilder {
    namespace: String,
    max_key_length: usize,
}

impl CacheKeyBuilder {
    pub fn new(namespace: impl Into<String>, max_key_length: usize) -> Self {
        CacheKeyBuilder {
            namespace: namespace.into(),
            max_key_length,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Reject empty keys and keys longer than the configured maximum.
    pub fn validate(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::ValidationError("Cache key must not be empty".into()));
        }
        if key.len() > self.max_key_length {
            return Err(Error::ValidationError(format!(
                "Cache key length {} exceeds maximum of {}",
                key.len(),
                self.max_key_length
            )));
        }
        Ok(())
    }

    /// Validate `key` and apply the namespace prefix.
    pub fn build(&self, key: &str) -> Result<String> {
        self.validate(key)?;
        Ok(self.prefixed(key))
    }

    /// Namespace a glob pattern for bulk deletion.
    ///
    /// An empty pattern matches everything in the namespace.
    pub fn pattern(&self, pattern: &str) -> String {
        if pattern.is_empty() {
            self.prefixed("*")
        } else {
            self.prefixed(pattern)
        }
    }

    /// Strip the namespace from a physical key, if it carries ours.
    pub fn logical<'a>(&self, physical: &'a str) -> Option<&'a str> {
        if self.namespace.is_empty() {
            return Some(physical);
        }
        physical
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
    }

    fn prefixed(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}{}{}", self.namespace, NAMESPACE_SEPARATOR, key)
        }
    }
}

/// Redis-style glob match: `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\x` escapes.
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    glob(&pattern, &key)
}

fn glob(pattern: &[char], key: &[char]) -> bool {
    let (mut p, mut k) = (0, 0);
    // Backtrack point: pattern index after the last `*` and the key index it matched up to.
    let mut star: Option<(usize, usize)> = None;

    while k < key.len() {
        let step = match pattern.get(p) {
            Some('*') => {
                star = Some((p + 1, k));
                p += 1;
                continue;
            }
            Some('?') => Some(1),
            Some('[') => class_match(&pattern[p..], key[k]),
            Some('\\') if p + 1 < pattern.len() => (pattern[p + 1] == key[k]).then_some(2),
            Some(c) => (*c == key[k]).then_some(1),
            None => None,
        };

        match step {
            Some(width) => {
                p += width;
                k += 1;
            }
            None => match star {
                Some((sp, sk)) => {
                    p = sp;
                    k = sk + 1;
                    star = Some((sp, sk + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Match `c` against a `[...]` class at the start of `pattern`.
/// Returns the class width on success.
fn class_match(pattern: &[char], c: char) -> Option<usize> {
    let mut i = 1;
    let negate = matches!(pattern.get(i), Some('^') | Some('!'));
    if negate {
        i += 1;
    }
    let mut matched = false;
    while i < pattern.len() && pattern[i] != ']' {
        let lo = if pattern[i] == '\\' && i + 1 < pattern.len() {
            i += 1;
            pattern[i]
        } else {
            pattern[i]
        };
        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            let hi = pattern[i + 2];
            if lo <= c && c <= hi {
                matched = true;
            }
            i += 3;
        } else {
            if lo == c {
                matched = true;
            }
            i += 1;
        }
    }
    if i >= pattern.len() {
        // Unterminated class: treat `[` literally.
        return (c == '[').then_some(1);
    }
    (matched != negate).then_some(i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_build_with_namespace() {
        let keys = CacheKeyBuilder::new("session", 64);
        assert_eq!(keys.build("abc").unwrap(), "session:abc");
        assert_eq!(keys.logical("session:abc"), Some("abc"));
        assert_eq!(keys.logical("other:abc"), None);
    }

    #[test]
    fn test_build_without_namespace() {
        let keys = CacheKeyBuilder::new("", 64);
        assert_eq!(keys.build("abc").unwrap(), "abc");
        assert_eq!(keys.pattern("user:*"), "user:*");
    }

    #[test]
    fn test_empty_pattern_matches_namespace() {
        let keys = CacheKeyBuilder::new("ns", 64);
        assert_eq!(keys.pattern(""), "ns:*");
        assert_eq!(keys.pattern("a?"), "ns:a?");
    }

    #[test]
    fn test_rejects_empty_and_long_keys() {
        let keys = CacheKeyBuilder::new("ns", 8);
        assert!(keys.build("").unwrap_err().is_validation());
        assert!(keys.build("123456789").unwrap_err().is_validation());
        assert!(keys.build("12345678").is_ok());
    }

    #[test]
    fn test_glob_wildcards() {
        assert!(matches_pattern("*", ""));
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("user:*", "user:42"));
        assert!(!matches_pattern("user:*", "session:42"));
        assert!(matches_pattern("user:?", "user:7"));
        assert!(!matches_pattern("user:?", "user:77"));
        assert!(matches_pattern("*:profile:*", "ns:profile:9"));
        assert!(matches_pattern("a*b*c", "axxbyyc"));
        assert!(!matches_pattern("a*b*c", "axxbyy"));
    }

    #[test]
    fn test_glob_classes_and_escapes() {
        assert!(matches_pattern("h[ae]llo", "hallo"));
        assert!(!matches_pattern("h[ae]llo", "hillo"));
        assert!(matches_pattern("h[^e]llo", "hallo"));
        assert!(!matches_pattern("h[^e]llo", "hello"));
        assert!(matches_pattern("k[0-9]", "k5"));
        assert!(!matches_pattern("k[0-9]", "kx"));
        assert!(matches_pattern("a\\*b", "a*b"));
        assert!(!matches_pattern("a\\*b", "axb"));
        assert!(matches_pattern("[abc", "[abc"));
    }

    proptest! {
        #[test]
        fn prop_literal_patterns_match_themselves(key in "[a-z0-9:]{0,24}") {
            prop_assert!(matches_pattern(&key, &key));
            let prefix = format!("{}*", key);
            let extended = format!("{}suffix", key);
            prop_assert!(matches_pattern(&prefix, &extended));
        }

        #[test]
        fn prop_validation_follows_length(key in ".{0,40}") {
            let keys = CacheKeyBuilder::new("p", 20);
            let ok = !key.is_empty() && key.len() <= 20;
            prop_assert_eq!(keys.build(&key).is_ok(), ok);
        }

        #[test]
        fn prop_namespaces_do_not_collide(key in "[a-z0-9]{1,16}") {
            let a = CacheKeyBuilder::new("alpha", 64).build(&key).unwrap();
            let b = CacheKeyBuilder::new("beta", 64).build(&key).unwrap();
            prop_assert_ne!(a, b);
        }
    }
}
