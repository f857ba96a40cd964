//! Network file types.
//!
//! These structs map one-to-one onto `statecraft.yaml`. Everything except
//! the `resources` list describes how to reach providers and machines; the
//! resources are handed to the engine as [`Definition`]s.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::Definition;

use super::Settings;

/// Root of a network file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Deployment-level settings.
    #[serde(default)]
    pub deployment: DeploymentConfig,
    /// Where state is kept.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider backends by name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Build collaborator.
    #[serde(default)]
    pub build: Option<BuildConfig>,
    /// SSH access to machines.
    #[serde(default)]
    pub ssh: SshConfig,
    /// Tunables.
    #[serde(default)]
    pub settings: Settings,
    /// Resource definitions.
    #[serde(default)]
    pub resources: Vec<Definition>,
}

/// Deployment-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Description shown by `list` and `info`.
    #[serde(default)]
    pub description: Option<String>,
    /// Keep every generation for rollback instead of only the latest.
    #[serde(default = "default_true")]
    pub rollback_enabled: bool,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            rollback_enabled: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// State location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// State directory; `.statecraft` next to the network file by default.
    #[serde(default)]
    pub dir: Option<String>,
}

/// One provider backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider's REST API.
    pub endpoint: String,
    /// API token; resolved from the environment or credentials file when
    /// absent.
    #[serde(default)]
    pub token: Option<String>,
    /// Profile in the credentials file; the provider name by default.
    #[serde(default)]
    pub profile: Option<String>,
    /// Additional error codes to treat as transient.
    #[serde(default)]
    pub transient_codes: Vec<String>,
}

/// Build collaborator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Shell command producing the build directory.
    pub command: String,
}

/// SSH access to machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// Default login user.
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Default port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Extra `-o` options.
    #[serde(default)]
    pub options: Vec<String>,
    /// Directory receiving artifacts on machines.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            options: Vec::new(),
            remote_dir: default_remote_dir(),
        }
    }
}

fn default_ssh_user() -> String {
    String::from("root")
}

const fn default_ssh_port() -> u16 {
    22
}

fn default_remote_dir() -> String {
    String::from("/var/lib/statecraft")
}
