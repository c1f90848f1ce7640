//! Fingerprints for change detection and idempotent creates.
//!
//! Attribute maps are ordered, so hashing their JSON encoding is deterministic
//! across runs and processes.

use sha2::{Digest, Sha256};

use super::spec::ClusterSpec;
use crate::graph::Attributes;

/// Hasher for computing attribute and spec fingerprints.
#[derive(Debug, Default)]
pub struct SpecHasher;

impl SpecHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the SHA-256 fingerprint of an attribute map.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in attributes {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a fingerprint of the whole spec, used for plan display.
    #[must_use]
    pub fn hash_spec(&self, spec: &ClusterSpec) -> String {
        let mut hasher = Sha256::new();
        // Struct fields serialize in declaration order and maps are BTreeMaps.
        let encoded = serde_json::to_vec(spec).unwrap_or_default();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }

    /// Derives a client request token from a node id and its fingerprint.
    ///
    /// The same desired attributes always produce the same token, so a
    /// retried create is recognized by the provider.
    #[must_use]
    pub fn client_token(&self, node_id: &str, fingerprint: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(node_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("kubeplan-{}", &digest[..32])
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(count: u32) -> Attributes {
        let mut a = Attributes::new();
        a.insert(String::from("name"), json!("default"));
        a.insert(String::from("max_count"), json!(count));
        a
    }

    #[test]
    fn test_attribute_hash_deterministic() {
        let hasher = SpecHasher::new();
        assert_eq!(hasher.hash_attributes(&attrs(3)), hasher.hash_attributes(&attrs(3)));
        assert_ne!(hasher.hash_attributes(&attrs(3)), hasher.hash_attributes(&attrs(5)));
    }

    #[test]
    fn test_client_token_stable() {
        let hasher = SpecHasher::new();
        let fp = hasher.hash_attributes(&attrs(3));
        let a = hasher.client_token("node-pool:default", &fp);
        let b = hasher.client_token("node-pool:default", &fp);
        assert_eq!(a, b);
        assert!(a.starts_with("kubeplan-"));
        assert_ne!(a, hasher.client_token("node-pool:gpu", &fp));
    }

    #[test]
    fn test_short_hash() {
        let hasher = SpecHasher::new();
        assert_eq!(hasher.short_hash("abcdef1234567890"), "abcdef12");
    }
}
