//! Definition compiler: turns a network file into resource definitions.

use std::path::PathBuf;

use tracing::info;

use crate::error::Result;
use crate::resource::{Definition, ResourceRegistry};

use super::{ConfigParser, ConfigValidator};

/// Produces the definitions of a deployment.
#[cfg_attr(test, mockall::automock)]
pub trait DefinitionCompiler: Send + Sync {
    /// Compiles the definitions of `deployment`.
    ///
    /// # Errors
    ///
    /// Any failure is fatal to evaluation.
    fn compile(&self, deployment: &str) -> Result<Vec<Definition>>;
}

/// Compiles the `resources` section of a YAML network file.
///
/// The file is re-read on every call, so edits show up on the next
/// evaluation.
#[derive(Debug)]
pub struct YamlCompiler {
    path: PathBuf,
    validator: ConfigValidator,
}

impl YamlCompiler {
    /// Creates a compiler for the network file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, registry: &ResourceRegistry) -> Self {
        Self {
            path: path.into(),
            validator: ConfigValidator::new(registry),
        }
    }
}

impl DefinitionCompiler for YamlCompiler {
    fn compile(&self, deployment: &str) -> Result<Vec<Definition>> {
        let spec = ConfigParser::new().load_file(&self.path)?;
        self.validator.validate(&spec)?;
        info!(
            "Compiled {} definition(s) for deployment {deployment}",
            spec.resources.len()
        );
        Ok(spec.resources)
    }
}
