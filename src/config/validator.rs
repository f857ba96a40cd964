//! Network file validation.
//!
//! Collects every problem in one pass so the operator can fix them
//! together; the first error is returned as the failure.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::error::{ConfigError, Result};
use crate::provider::DEFAULT_PROVIDER;
use crate::resource::ResourceRegistry;

use super::spec::NetworkSpec;

/// Validator for network files.
#[derive(Debug)]
pub struct ConfigValidator {
    /// Type tags with a registered implementation.
    known_types: HashSet<String>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new(&ResourceRegistry::with_builtin_kinds())
    }
}

impl ConfigValidator {
    /// Creates a validator accepting the types of `registry`.
    #[must_use]
    pub fn new(registry: &ResourceRegistry) -> Self {
        Self {
            known_types: registry.type_tags().map(str::to_string).collect(),
        }
    }

    /// Validates a network.
    ///
    /// # Errors
    ///
    /// Returns the first error found; duplicate names and unknown types map
    /// to their dedicated [`ConfigError`] variants.
    pub fn validate(&self, spec: &NetworkSpec) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        if let Err(err) = spec.settings.check() {
            result.errors.push(ValidationError {
                field: String::from("settings"),
                message: err.to_string(),
            });
        }
        Self::validate_build(spec, &mut result);
        let names = self.validate_resources(spec, &mut result)?;
        Self::validate_dependencies(spec, &names, &mut result);

        for warning in &result.warnings {
            warn!("{warning}");
        }

        if result.errors.is_empty() {
            debug!("Network validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }
            .into())
        }
    }

    fn validate_build(spec: &NetworkSpec, result: &mut ValidationResult) {
        if let Some(build) = &spec.build {
            if build.command.trim().is_empty() {
                result.errors.push(ValidationError {
                    field: String::from("build.command"),
                    message: String::from("Build command cannot be empty"),
                });
            }
        } else if spec
            .resources
            .iter()
            .any(|r| r.type_tag == "vm" || r.type_tag == "none")
        {
            result.warnings.push(String::from(
                "No build command configured; deploy will stop after creating resources",
            ));
        }
    }

    /// Checks names, types and providers; returns the set of names.
    fn validate_resources(
        &self,
        spec: &NetworkSpec,
        result: &mut ValidationResult,
    ) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();

        for (i, defn) in spec.resources.iter().enumerate() {
            let field = format!("resources[{i}]");

            if !names.insert(defn.name.clone()) {
                return Err(ConfigError::DuplicateName {
                    name: defn.name.clone(),
                }
                .into());
            }
            if !is_valid_name(&defn.name) {
                result.errors.push(ValidationError {
                    field: format!("{field}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        defn.name
                    ),
                });
            }

            if !self.known_types.contains(&defn.type_tag) {
                return Err(ConfigError::UnknownResourceType {
                    name: defn.name.clone(),
                    type_tag: defn.type_tag.clone(),
                }
                .into());
            }

            let provider = defn.provider_name();
            let provider_needed = defn.type_tag != "none";
            if provider_needed && !spec.providers.contains_key(provider) {
                if provider == DEFAULT_PROVIDER && defn.provider.is_none() {
                    result.errors.push(ValidationError {
                        field: format!("{field}.provider"),
                        message: format!(
                            "Resource '{}' needs a provider; configure providers.{DEFAULT_PROVIDER}",
                            defn.name
                        ),
                    });
                } else {
                    return Err(ConfigError::UnknownProvider {
                        name: defn.name.clone(),
                        provider: provider.to_string(),
                    }
                    .into());
                }
            }
        }

        Ok(names)
    }

    fn validate_dependencies(
        spec: &NetworkSpec,
        names: &BTreeSet<String>,
        result: &mut ValidationResult,
    ) {
        for (i, defn) in spec.resources.iter().enumerate() {
            for dep in &defn.depends_on {
                if dep == &defn.name {
                    result.errors.push(ValidationError {
                        field: format!("resources[{i}].depends_on"),
                        message: format!("Resource '{}' depends on itself", defn.name),
                    });
                } else if !names.contains(dep) {
                    result.errors.push(ValidationError {
                        field: format!("resources[{i}].depends_on"),
                        message: format!(
                            "Resource '{}' depends on unknown resource '{dep}'",
                            defn.name
                        ),
                    });
                }
            }
        }
    }
}

/// Checks if a name is valid (lowercase alphanumeric with hyphens).
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    // Rest must be lowercase alphanumeric or hyphen
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::DeployError;

    fn parse(yaml: &str) -> NetworkSpec {
        ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("Failed to parse")
    }

    const PROVIDERS: &str = r"
providers:
  default:
    endpoint: http://localhost:9000
";

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("web"));
        assert!(is_valid_name("db-replica-2"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Web")); // uppercase
        assert!(!is_valid_name("2-web")); // starts with number
        assert!(!is_valid_name("web_1")); // underscore
        assert!(!is_valid_name("web-")); // ends with hyphen
        assert!(!is_valid_name("web--1")); // consecutive hyphens
    }

    #[test]
    fn test_valid_network_passes() {
        let spec = parse(&format!(
            "{PROVIDERS}
build:
  command: ./build.sh
resources:
  - {{ name: data, type: volume, region: eu-1, size_gb: 10 }}
  - {{ name: web, type: vm, depends_on: [data] }}
"
        ));
        let result = ConfigValidator::default().validate(&spec).expect("valid");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let spec = parse(&format!(
            "{PROVIDERS}
resources:
  - {{ name: web, type: volume }}
  - {{ name: web, type: volume }}
"
        ));
        let err = ConfigValidator::default().validate(&spec).expect_err("duplicate");
        assert!(matches!(err, DeployError::Config(ConfigError::DuplicateName { .. })));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let spec = parse(&format!(
            "{PROVIDERS}
resources:
  - {{ name: jobs, type: queue }}
"
        ));
        let err = ConfigValidator::default().validate(&spec).expect_err("unknown type");
        assert!(matches!(
            err,
            DeployError::Config(ConfigError::UnknownResourceType { ref type_tag, .. }) if type_tag == "queue"
        ));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let spec = parse(&format!(
            "{PROVIDERS}
resources:
  - {{ name: data, type: volume, provider: other }}
"
        ));
        let err = ConfigValidator::default().validate(&spec).expect_err("unknown provider");
        assert!(matches!(err, DeployError::Config(ConfigError::UnknownProvider { .. })));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let spec = parse(&format!(
            "{PROVIDERS}
resources:
  - {{ name: web, type: vm, depends_on: [ghost] }}
"
        ));
        let err = ConfigValidator::default().validate(&spec).expect_err("unknown dep");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_unmanaged_hosts_need_no_provider() {
        let spec = parse(
            r"
build:
  command: ./build.sh
resources:
  - { name: db, type: none, host: 192.0.2.1 }
",
        );
        ConfigValidator::default().validate(&spec).expect("valid");
    }
}
