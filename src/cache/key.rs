//! Structural cache keys with a prefix hierarchy.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// One component of a cache key after the namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Int(i64),
  Str(String),
  /// Filter set (e.g. `{status: "published", page: "2"}`), kept sorted
  Filters(BTreeMap<String, String>),
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<i64> for KeyPart {
  fn from(n: i64) -> Self {
    KeyPart::Int(n)
  }
}

impl From<u64> for KeyPart {
  fn from(n: u64) -> Self {
    KeyPart::Int(n as i64)
  }
}

impl From<BTreeMap<String, String>> for KeyPart {
  fn from(filters: BTreeMap<String, String>) -> Self {
    KeyPart::Filters(filters)
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Int(n) => write!(f, "{}", n),
      KeyPart::Str(s) => write!(f, "{:?}", s),
      KeyPart::Filters(filters) => {
        write!(f, "{{")?;
        for (i, (k, v)) in filters.iter().enumerate() {
          if i > 0 {
            write!(f, ",")?;
          }
          write!(f, "{}:{:?}", k, v)?;
        }
        write!(f, "}}")
      }
    }
  }
}

/// Identifier for one cached query result: a namespace plus zero or more parts.
///
/// Equality is structural. `["course", 7]` starts with `["course"]`, which is
/// what bulk invalidation matches on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  namespace: String,
  parts: Vec<KeyPart>,
}

impl CacheKey {
  pub fn new(namespace: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      parts: Vec::new(),
    }
  }

  /// Append a part to the key.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.parts.push(part.into());
    self
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.parts
  }

  /// True when `prefix` has the same namespace and its parts are a prefix of ours.
  pub fn starts_with(&self, prefix: &CacheKey) -> bool {
    self.namespace == prefix.namespace && self.parts.starts_with(&prefix.parts)
  }

  /// Stable, fixed-length identifier used for persistent storage.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{:?}", self.namespace)?;
    for part in &self.parts {
      write!(f, ", {}", part)?;
    }
    write!(f, "]")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_structural_equality() {
    let a = CacheKey::new("course").with(7i64);
    let b = CacheKey::new("course").with(7i64);
    assert_eq!(a, b);
    assert_ne!(a, CacheKey::new("course").with("7"));
  }

  #[test]
  fn test_prefix_hierarchy() {
    let list = CacheKey::new("admin-courses");
    let page = CacheKey::new("admin-courses").with(BTreeMap::from([(
      "page".to_string(),
      "2".to_string(),
    )]));

    assert!(page.starts_with(&list));
    assert!(list.starts_with(&list));
    assert!(!list.starts_with(&page));
    assert!(!CacheKey::new("admin-courses-archive").starts_with(&list));
  }

  #[test]
  fn test_cache_hash_is_stable() {
    let key = CacheKey::new("lesson").with("l-1");
    assert_eq!(key.cache_hash(), key.clone().cache_hash());
    assert_eq!(key.cache_hash().len(), 64);
    assert_ne!(key.cache_hash(), CacheKey::new("lesson").cache_hash());
  }

  #[test]
  fn test_display() {
    let key = CacheKey::new("course").with(3i64).with("draft");
    assert_eq!(key.to_string(), r#"["course", 3, "draft"]"#);
  }
}
