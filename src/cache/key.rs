//! Cache key generation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }

    /// Key a generated query by connection, normalised question text and intent.
    ///
    /// Whitespace runs collapse to one space and letters are lower-cased, so
    /// trivially re-typed questions share an entry.
    pub fn for_query(connection_id: Option<&str>, query: &str, intent: Option<&str>) -> Self {
        let mut parts: BTreeMap<&str, String> = BTreeMap::new();
        parts.insert("connection", connection_id.unwrap_or_default().to_string());
        parts.insert("query", normalize(query));
        if let Some(intent) = intent {
            parts.insert("intent", intent.to_string());
        }
        let canonical = serde_json::to_string(&parts).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Self::new(hash)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

fn normalize(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalised_queries_share_a_key() {
        let a = CacheKey::for_query(Some("db1"), "Top  10 customers\n", Some("ranking"));
        let b = CacheKey::for_query(Some("db1"), "top 10 customers", Some("ranking"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_connection_and_intent_separate_keys() {
        let base = CacheKey::for_query(Some("db1"), "count orders", None);
        assert_ne!(base, CacheKey::for_query(Some("db2"), "count orders", None));
        assert_ne!(base, CacheKey::for_query(Some("db1"), "count orders", Some("aggregate")));
    }
}
