//! Desired-state definitions.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigError, Result};
use crate::provider::DEFAULT_PROVIDER;

/// Desired state of one resource.
///
/// Produced fresh by the definition compiler on every evaluation and never
/// persisted. Type-specific settings stay untyped here and are decoded by
/// the resource type with [`Definition::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Resource name, unique within the deployment.
    pub name: String,
    /// Type tag selecting the implementation.
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Provider name; the default provider when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Resources that must be created first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Type-specific settings.
    #[serde(flatten)]
    pub attrs: Map<String, Value>,
}

impl Definition {
    /// Creates a definition without settings.
    #[must_use]
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            provider: None,
            depends_on: Vec::new(),
            attrs: Map::new(),
        }
    }

    /// Adds a setting.
    #[must_use]
    pub fn with_attr(mut self, key: &str, value: Value) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: &str) -> Self {
        self.depends_on.push(name.to_string());
        self
    }

    /// Provider name, falling back to the default provider.
    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.as_deref().unwrap_or(DEFAULT_PROVIDER)
    }

    /// Decodes the type-specific settings.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the resource if the settings do not
    /// match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.attrs.clone())).map_err(|e| {
            ConfigError::validation(
                format!("invalid settings for {} resource: {e}", self.type_tag),
                format!("resources.{}", self.name),
            )
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct VolumeSettings {
        size_gb: u32,
        #[serde(default)]
        region: Option<String>,
    }

    #[test]
    fn test_yaml_definition_keeps_type_specific_settings() {
        let yaml = r"
name: data
type: volume
provider: aws
depends_on: [web]
size_gb: 20
";
        let defn: Definition = serde_yaml::from_str(yaml).expect("parses");
        assert_eq!(defn.type_tag, "volume");
        assert_eq!(defn.provider_name(), "aws");
        assert_eq!(defn.depends_on, vec![String::from("web")]);

        let settings: VolumeSettings = defn.parse().expect("decodes");
        assert_eq!(settings.size_gb, 20);
        assert!(settings.region.is_none());
    }

    #[test]
    fn test_bad_settings_name_the_resource() {
        let defn = Definition::new("data", "volume").with_attr("size_gb", json!("big"));
        let err = defn.parse::<VolumeSettings>().expect_err("wrong type");
        assert!(err.to_string().contains("volume"));
        assert_eq!(defn.provider_name(), DEFAULT_PROVIDER);
    }
}
