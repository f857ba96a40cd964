//! Configuration module for statecraft.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `statecraft.yaml` network files
//! - Validation of definitions against the registered resource types
//! - Definition hashing for change detection
//! - Runtime settings and provider credential resolution

mod compiler;
mod credentials;
mod hash;
mod parser;
mod settings;
mod spec;
mod validator;

pub use compiler::{DefinitionCompiler, YamlCompiler};
pub use credentials::CredentialResolver;
pub use hash::DefinitionHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use settings::{DEFAULT_MAX_CONCURRENT, Settings};
pub use spec::{
    BuildConfig, DeploymentConfig, NetworkSpec, ProviderConfig, SshConfig, StateConfig,
};
pub use self::validator::{ConfigValidator, ValidationError, ValidationResult, is_valid_name};

#[cfg(test)]
pub use compiler::MockDefinitionCompiler;
