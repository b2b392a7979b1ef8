//! Public keys and key allocation

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{RelayError, Result};

/// Maximum key length accepted from clients
pub const MAX_KEY_LEN: usize = 128;

/// Opaque identifier under which an origin is published
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    /// Parse and validate a key supplied by a client
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Input`] if the key is empty, longer than
    /// [`MAX_KEY_LEN`], or contains characters other than ASCII alphanumerics,
    /// hyphens and underscores.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(RelayError::input("key cannot be empty"));
        }

        if raw.len() > MAX_KEY_LEN {
            return Err(RelayError::input(format!(
                "key too long: {} chars, max {MAX_KEY_LEN}",
                raw.len()
            )));
        }

        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RelayError::input(
                "key must contain only alphanumeric characters, hyphens, and underscores",
            ));
        }

        Ok(Self(raw.to_string()))
    }

    /// The key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PublicKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PublicKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How new keys are generated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// 128-bit random keys rendered as 32 hex characters
    #[default]
    Random,
    /// Monotonic decimal counter starting at 1
    Sequential,
}

impl std::str::FromStr for KeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "sequential" => Ok(Self::Sequential),
            other => Err(format!("unknown key strategy: {other}")),
        }
    }
}

/// Produces candidate keys
///
/// Candidates are not guaranteed to be unused; the registry retries until it
/// finds a vacant one.
#[derive(Debug)]
pub struct KeyAllocator {
    strategy: KeyStrategy,
    counter: AtomicU64,
}

impl KeyAllocator {
    /// Create an allocator for the given strategy
    #[must_use]
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
        }
    }

    /// The configured strategy
    #[must_use]
    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    /// Next candidate key
    pub fn next_key(&self) -> PublicKey {
        match self.strategy {
            KeyStrategy::Random => PublicKey(Uuid::new_v4().simple().to_string()),
            KeyStrategy::Sequential => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                PublicKey(n.to_string())
            }
        }
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new(KeyStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_valid_keys() {
        assert!(PublicKey::parse("1").is_ok());
        assert!(PublicKey::parse("my-api_2").is_ok());
        assert!(PublicKey::parse(&"a".repeat(MAX_KEY_LEN)).is_ok());
    }

    #[test]
    fn test_parse_invalid_keys() {
        assert!(PublicKey::parse("").is_err());
        assert!(PublicKey::parse(&"a".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(PublicKey::parse("a/b").is_err());
        assert!(PublicKey::parse("a b").is_err());
        assert!(PublicKey::parse("ключ").is_err());
    }

    #[test]
    fn test_sequential_allocation() {
        let allocator = KeyAllocator::new(KeyStrategy::Sequential);
        assert_eq!(allocator.next_key().as_str(), "1");
        assert_eq!(allocator.next_key().as_str(), "2");
        assert_eq!(allocator.next_key().as_str(), "3");
    }

    #[test]
    fn test_random_allocation_unique() {
        let allocator = KeyAllocator::default();
        let keys: HashSet<_> = (0..1000).map(|_| allocator.next_key()).collect();
        assert_eq!(keys.len(), 1000);

        let key = allocator.next_key();
        assert_eq!(key.as_str().len(), 32);
        assert!(PublicKey::parse(key.as_str()).is_ok());
    }

    #[test]
    fn test_sequential_allocation_concurrent() {
        let allocator = std::sync::Arc::new(KeyAllocator::new(KeyStrategy::Sequential));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..100).map(|_| allocator.next_key()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(all.insert(key));
            }
        }
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("random".parse::<KeyStrategy>(), Ok(KeyStrategy::Random));
        assert_eq!("Sequential".parse::<KeyStrategy>(), Ok(KeyStrategy::Sequential));
        assert!("other".parse::<KeyStrategy>().is_err());
    }
}
