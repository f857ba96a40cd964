//! Build collaborator.
//!
//! Given the machines of a deployment and their facts, a build produces one
//! content-addressed directory holding one artifact per machine. The engine
//! never looks inside an artifact; it only copies and activates it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// Marker file in a machine artifact asking for a reboot on activation.
pub const REBOOT_MARKER: &str = "reboot-required";

/// One machine's build artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineArtifact {
    /// Local path of the artifact.
    pub path: PathBuf,
    /// Whether activation needs a reboot.
    pub reboot_required: bool,
}

/// Output of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Content-addressed build directory.
    pub path: PathBuf,
    /// Artifact per machine name.
    pub machines: BTreeMap<String, MachineArtifact>,
}

/// Produces machine artifacts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Builder: Send + Sync {
    /// Builds artifacts for `machines`, whose facts are in the JSON file at
    /// `facts_path`.
    async fn build(&self, machines: &[String], facts_path: &Path) -> Result<BuildOutput>;
}

/// Runs an external build command.
///
/// The command runs under `sh -c` with `STATECRAFT_FACTS` (facts file) and
/// `STATECRAFT_MACHINES` (space-separated names) set, and must print the
/// build directory on its last line of output. The directory must hold one
/// entry per machine.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: String,
    working_dir: PathBuf,
}

impl CommandBuilder {
    /// Creates a builder running `command` from `working_dir`.
    #[must_use]
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
        }
    }

    /// Collects the per-machine artifacts of a build directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingArtifact`] for the first machine without
    /// one.
    pub fn collect(build_dir: &Path, machines: &[String]) -> Result<BuildOutput> {
        let mut artifacts = BTreeMap::new();
        for machine in machines {
            let path = build_dir.join(machine);
            if !path.exists() {
                return Err(EngineError::MissingArtifact {
                    machine: machine.clone(),
                    path: path.display().to_string(),
                }
                .into());
            }
            let reboot_required = path.join(REBOOT_MARKER).exists();
            artifacts.insert(
                machine.clone(),
                MachineArtifact {
                    path,
                    reboot_required,
                },
            );
        }
        Ok(BuildOutput {
            path: build_dir.to_path_buf(),
            machines: artifacts,
        })
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn build(&self, machines: &[String], facts_path: &Path) -> Result<BuildOutput> {
        info!("Building {} machine(s)", machines.len());
        debug!("Build command: {}", self.command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .env("STATECRAFT_FACTS", facts_path)
            .env("STATECRAFT_MACHINES", machines.join(" "))
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::BuildFailed {
                message: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(last) = stdout.lines().map(str::trim).rfind(|line| !line.is_empty()) else {
            return Err(EngineError::BuildFailed {
                message: String::from("build printed no output path"),
            }
            .into());
        };

        let build_dir = self.working_dir.join(last);
        info!("Build output: {}", build_dir.display());
        Self::collect(&build_dir, machines)
    }
}
