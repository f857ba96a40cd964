//! Remote execution on machines.
//!
//! The engine only needs four remote operations: run a command, copy a
//! build artifact, wait for SSH to come up, and reboot. [`SshExecutor`]
//! implements them with the system `ssh` and `scp` binaries.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{DeployError, EngineError, Result};
use crate::poll::Poller;

/// How to reach one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Machine (resource) name, for logs and errors.
    pub machine: String,
    /// Host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
}

impl SshTarget {
    /// `user@host`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, -1 if killed by a signal.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote operations on machines.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs a shell command on the machine.
    async fn run_command(&self, target: &SshTarget, command: &str) -> Result<CommandOutput>;

    /// Copies a build artifact to the machine and returns its remote path.
    async fn copy_closure_to(&self, target: &SshTarget, artifact: &Path) -> Result<String>;

    /// Waits until the machine accepts SSH connections; returns false on
    /// timeout.
    async fn wait_for_ssh(&self, target: &SshTarget, timeout: Duration) -> Result<bool>;

    /// Reboots the machine and waits for it to come back.
    async fn reboot(&self, target: &SshTarget) -> Result<()>;
}

/// [`RemoteExecutor`] over the system OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    /// Extra `-o` options passed to every connection.
    options: Vec<String>,
    /// Remote directory receiving artifacts.
    remote_dir: String,
    /// Delay between connection attempts while waiting.
    poll_interval: Duration,
    /// How long a reboot may take.
    reboot_timeout: Duration,
}

impl SshExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(options: Vec<String>, remote_dir: impl Into<String>) -> Self {
        Self {
            options,
            remote_dir: remote_dir.into(),
            poll_interval: Duration::from_secs(5),
            reboot_timeout: Duration::from_secs(600),
        }
    }

    /// Overrides the reachability poll interval and reboot budget.
    #[must_use]
    pub const fn with_timing(mut self, poll_interval: Duration, reboot_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.reboot_timeout = reboot_timeout;
        self
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            String::from("-o"),
            String::from("BatchMode=yes"),
            String::from("-o"),
            String::from("StrictHostKeyChecking=accept-new"),
            String::from("-o"),
            String::from("ConnectTimeout=10"),
        ];
        for option in &self.options {
            args.push(String::from("-o"));
            args.push(option.clone());
        }
        args
    }

    async fn run(program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("Running {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn ssh_reachable(&self, target: &SshTarget) -> Result<bool> {
        Ok(self.run_command(target, "true").await?.success())
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run_command(&self, target: &SshTarget, command: &str) -> Result<CommandOutput> {
        let mut args = self.base_args();
        args.push(String::from("-p"));
        args.push(target.port.to_string());
        args.push(target.destination());
        args.push(command.to_string());
        Self::run("ssh", &args).await
    }

    async fn copy_closure_to(&self, target: &SshTarget, artifact: &Path) -> Result<String> {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| DeployError::internal(format!("Invalid artifact path {}", artifact.display())))?;
        let remote_path = PathBuf::from(&self.remote_dir)
            .join(&name)
            .to_string_lossy()
            .to_string();

        let mkdir = self
            .run_command(target, &format!("mkdir -p '{}'", self.remote_dir))
            .await?;
        if !mkdir.success() {
            return Err(EngineError::RemoteCommandFailed {
                machine: target.machine.clone(),
                command: String::from("mkdir"),
                status: mkdir.exit_code,
            }
            .into());
        }

        let mut args = self.base_args();
        args.push(String::from("-P"));
        args.push(target.port.to_string());
        args.push(String::from("-r"));
        args.push(artifact.to_string_lossy().to_string());
        args.push(format!("{}:{}", target.destination(), self.remote_dir));

        info!(resource = %target.machine, "copying {} to {}", artifact.display(), remote_path);
        let output = Self::run("scp", &args).await?;
        if !output.success() {
            return Err(EngineError::RemoteCommandFailed {
                machine: target.machine.clone(),
                command: String::from("scp"),
                status: output.exit_code,
            }
            .into());
        }
        Ok(remote_path)
    }

    async fn wait_for_ssh(&self, target: &SshTarget, timeout: Duration) -> Result<bool> {
        info!(resource = %target.machine, "waiting for SSH");
        Poller::new(self.poll_interval, timeout)
            .until_true(|| self.ssh_reachable(target))
            .await
            .succeeded()
    }

    async fn reboot(&self, target: &SshTarget) -> Result<()> {
        info!(resource = %target.machine, "rebooting");
        // The connection usually drops before the command returns.
        let output = self
            .run_command(target, "systemctl reboot || reboot")
            .await?;
        if !output.success() {
            debug!(resource = %target.machine, "reboot command exited with {}", output.exit_code);
        }

        // Wait for the machine to go down before waiting for it to come up.
        let went_down = Poller::new(self.poll_interval, Duration::from_secs(120))
            .until_true(|| async { self.ssh_reachable(target).await.map(|up| !up) })
            .await
            .succeeded()?;
        if !went_down {
            warn!(resource = %target.machine, "machine did not appear to go down");
        }

        if self.wait_for_ssh(target, self.reboot_timeout).await? {
            Ok(())
        } else {
            Err(DeployError::timeout(
                format!("'{}' to come back after reboot", target.machine),
                self.reboot_timeout.as_secs(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            machine: String::from("web"),
            host: String::from("203.0.113.7"),
            port: 2222,
            user: String::from("root"),
        }
    }

    #[test]
    fn test_destination() {
        assert_eq!(target().destination(), "root@203.0.113.7");
    }

    #[test]
    fn test_extra_options_follow_defaults() {
        let executor = SshExecutor::new(vec![String::from("IdentitiesOnly=yes")], "/var/lib/statecraft");
        let args = executor.base_args();
        assert_eq!(args.len(), 8);
        assert_eq!(args.last().map(String::as_str), Some("IdentitiesOnly=yes"));
    }

    #[tokio::test]
    async fn test_mock_executor_can_stand_in() {
        let mut mock = MockRemoteExecutor::new();
        mock.expect_run_command()
            .returning(|_, _| Ok(CommandOutput::default()));

        let output = mock.run_command(&target(), "uptime").await.expect("runs");
        assert!(output.success());
    }
}
