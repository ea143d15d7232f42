//! Content-addressed build step cache
//!
//! A cached step is keyed by the hash of its normalized container spec.
//! The container name and run network are cleared before hashing: both
//! embed run-specific values, and identical steps across runs must map
//! to the same key.

use crate::Result;
use kiln_engine::ContainerSpec;
use sha2::{Digest, Sha256};

/// Where a step's cache image lives: `cache-<repo>:<key>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDescriptor {
    pub image: String,
    pub tag: String,
}

impl CacheDescriptor {
    pub fn new(repo_name: &str, key: String) -> Self {
        Self {
            image: format!("cache-{}", repo_name),
            tag: key,
        }
    }

    /// Full image reference
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Derive the cache key for a step's container spec
pub fn compute_key(spec: &ContainerSpec) -> Result<String> {
    let mut normalized = spec.clone();
    normalized.name = None;
    normalized.network = None;

    let bytes = serde_json::to_vec(&normalized)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        let mut s = ContainerSpec::new("rust:1.79");
        s.cmd = vec!["/bin/sh".to_string(), "-cex".to_string(), "make\n".to_string()];
        s.working_dir = Some("/build".to_string());
        s.env = vec!["A=1".to_string()];
        s
    }

    #[test]
    fn test_identical_specs_hash_identically() {
        let a = compute_key(&spec()).unwrap();
        let b = compute_key(&spec()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_name_and_network_do_not_affect_key() {
        let base = compute_key(&spec()).unwrap();

        let mut named = spec();
        named.name = Some("app-0-1234".to_string());
        named.network = Some("app-main-01234567".to_string());
        assert_eq!(compute_key(&named).unwrap(), base);
    }

    #[test]
    fn test_changed_command_changes_key() {
        let base = compute_key(&spec()).unwrap();

        let mut changed = spec();
        changed.cmd[2] = "make test\n".to_string();
        assert_ne!(compute_key(&changed).unwrap(), base);

        let mut env_changed = spec();
        env_changed.env.push("B=2".to_string());
        assert_ne!(compute_key(&env_changed).unwrap(), base);
    }

    #[test]
    fn test_descriptor_reference() {
        let desc = CacheDescriptor::new("app", "abc123".to_string());
        assert_eq!(desc.image, "cache-app");
        assert_eq!(desc.reference(), "cache-app:abc123");
    }
}
