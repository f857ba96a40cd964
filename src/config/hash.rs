//! Definition hashing for change detection.
//!
//! Resources persist the hash of the definition they last converged to, so
//! a repeated deploy can tell "nothing changed" without touching the
//! provider.

use sha2::{Digest, Sha256};

use crate::resource::Definition;

/// Hasher for computing definition hashes.
#[derive(Debug, Default)]
pub struct DefinitionHasher;

impl DefinitionHasher {
    /// Creates a new definition hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of one definition.
    ///
    /// Setting keys are hashed in sorted order, so the hash does not depend
    /// on how the network file orders them.
    #[must_use]
    pub fn hash_definition(&self, defn: &Definition) -> String {
        let mut hasher = Sha256::new();
        Self::update(&mut hasher, defn);
        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a whole set of definitions, independent of their
    /// order.
    #[must_use]
    pub fn hash_definitions(&self, defns: &[Definition]) -> String {
        let mut sorted: Vec<&Definition> = defns.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut hasher = Sha256::new();
        for defn in sorted {
            Self::update(&mut hasher, defn);
        }
        hex::encode(hasher.finalize())
    }

    fn update(hasher: &mut Sha256, defn: &Definition) {
        // Length-prefix every field so adjacent fields cannot run together.
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        };

        field(defn.name.as_bytes());
        field(defn.type_tag.as_bytes());
        field(defn.provider_name().as_bytes());

        let mut deps: Vec<&String> = defn.depends_on.iter().collect();
        deps.sort();
        for dep in deps {
            field(dep.as_bytes());
        }

        // serde_json maps are ordered by key.
        let settings = serde_json::Value::Object(defn.attrs.clone()).to_string();
        field(settings.as_bytes());
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

    fn volume(name: &str, size: u32) -> Definition {
        Definition::new(name, "volume")
            .with_attr("size_gb", json!(size))
            .with_attr("region", json!("eu-1"))
    }

    #[test]
    fn test_definition_hash_deterministic() {
        let hasher = DefinitionHasher::new();
        assert_eq!(
            hasher.hash_definition(&volume("data", 10)),
            hasher.hash_definition(&volume("data", 10))
        );
    }

    #[test]
    fn test_setting_change_changes_hash() {
        let hasher = DefinitionHasher::new();
        assert_ne!(
            hasher.hash_definition(&volume("data", 10)),
            hasher.hash_definition(&volume("data", 20))
        );
    }

    #[test]
    fn test_setting_order_does_not_matter() {
        let hasher = DefinitionHasher::new();
        let reordered = Definition::new("data", "volume")
            .with_attr("region", json!("eu-1"))
            .with_attr("size_gb", json!(10));
        assert_eq!(
            hasher.hash_definition(&volume("data", 10)),
            hasher.hash_definition(&reordered)
        );
    }

    #[test]
    fn test_set_hash_ignores_definition_order() {
        let hasher = DefinitionHasher::new();
        let a = volume("a", 1);
        let b = volume("b", 2);
        assert_eq!(
            hasher.hash_definitions(&[a.clone(), b.clone()]),
            hasher.hash_definitions(&[b, a])
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = DefinitionHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }
}
