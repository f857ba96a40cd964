//! Provider credential resolution.
//!
//! A provider token comes from, in order: the network file, the
//! `STATECRAFT_<PROVIDER>_TOKEN` environment variable, then the credentials
//! file (`~/.config/statecraft/credentials.yaml`), keyed by profile.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{ConfigError, Result};

use super::spec::ProviderConfig;

/// One profile of the credentials file.
#[derive(Debug, Clone, Deserialize)]
struct Profile {
    token: String,
}

/// Resolves provider tokens.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    credentials_file: Option<PathBuf>,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver {
    /// Resolver using the default credentials file.
    #[must_use]
    pub fn new() -> Self {
        Self {
            credentials_file: default_credentials_file(),
        }
    }

    /// Resolver reading another credentials file.
    #[must_use]
    pub fn with_credentials_file(path: impl Into<PathBuf>) -> Self {
        Self {
            credentials_file: Some(path.into()),
        }
    }

    /// Environment variable consulted for `provider`.
    #[must_use]
    pub fn env_var(provider: &str) -> String {
        let normalized: String = provider
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("STATECRAFT_{normalized}_TOKEN")
    }

    /// Resolves the token of provider `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredential`] if no source has one, or a
    /// parse error if the credentials file is malformed.
    pub fn resolve(&self, name: &str, config: &ProviderConfig) -> Result<String> {
        if let Some(token) = &config.token {
            debug!(provider = %name, "using token from the network file");
            return Ok(token.clone());
        }

        let env_var = Self::env_var(name);
        if let Ok(token) = std::env::var(&env_var) {
            debug!(provider = %name, "using token from {env_var}");
            return Ok(token);
        }

        let profile = config.profile.as_deref().unwrap_or(name);
        if let Some(path) = &self.credentials_file {
            if let Some(token) = read_profile(path, profile)? {
                debug!(provider = %name, "using profile '{profile}' from {}", path.display());
                return Ok(token);
            }
        }

        Err(ConfigError::MissingCredential {
            provider: name.to_string(),
            env_var,
            file: self
                .credentials_file
                .as_ref()
                .map_or_else(|| String::from("<no home directory>"), |p| p.display().to_string()),
        }
        .into())
    }
}

fn default_credentials_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("statecraft").join("credentials.yaml"))
}

fn read_profile(path: &Path, profile: &str) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let mut profiles: BTreeMap<String, Profile> =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: format!("Invalid credentials file: {e}"),
            location: Some(path.display().to_string()),
        })?;
    Ok(profiles.remove(profile).map(|p| p.token))
}
