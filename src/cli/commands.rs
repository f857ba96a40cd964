//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::{DeployOptions, Filter};
use crate::resource::CreateOptions;

/// Statecraft - declarative deployment orchestrator.
#[derive(Parser, Debug)]
#[command(name = "statecraft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the network file.
    #[arg(short, long, global = true, env = "STATECRAFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Deployment uuid, uuid prefix or name.
    #[arg(short, long, global = true, env = "STATECRAFT_DEPLOYMENT")]
    pub deployment: Option<String>,

    /// State directory; overrides the network file.
    #[arg(long, global = true, env = "STATECRAFT_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Answer yes to every confirmation.
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format.
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Resource selection shared by workflow commands.
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Only act on these resources.
    #[arg(long, value_delimiter = ',')]
    pub include: Vec<String>,

    /// Never act on these resources.
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,
}

impl FilterArgs {
    /// Converts to an engine filter.
    #[must_use]
    pub fn to_filter(&self) -> Filter {
        Filter::new(self.include.clone(), self.exclude.clone())
    }
}

/// Flags handed to every resource create.
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct CreateFlags {
    /// Query providers before assuming nothing changed.
    #[arg(long)]
    pub check: bool,

    /// Allow changes that reboot or stop machines.
    #[arg(long)]
    pub allow_reboot: bool,

    /// Allow recreating resources that disappeared.
    #[arg(long)]
    pub allow_recreate: bool,

    /// Reboot machines after activation even if not needed.
    #[arg(long)]
    pub force_reboot: bool,
}

impl From<CreateFlags> for CreateOptions {
    fn from(flags: CreateFlags) -> Self {
        Self {
            check: flags.check,
            allow_reboot: flags.allow_reboot,
            allow_recreate: flags.allow_recreate,
            force_reboot: flags.force_reboot,
        }
    }
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a deployment for the network file.
    Create {
        /// Deployment name.
        #[arg(long)]
        name: Option<String>,

        /// Description.
        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a deployment.
    Delete {
        /// Drop remaining resource records without destroying anything.
        #[arg(long)]
        force: bool,
    },

    /// List deployments.
    List,

    /// Show the resources of a deployment.
    Info,

    /// Converge the deployment to the network file.
    Deploy {
        /// Resource selection.
        #[command(flatten)]
        filter: FilterArgs,

        /// Create flags.
        #[command(flatten)]
        flags: CreateFlags,

        /// Stop after building.
        #[arg(long)]
        build_only: bool,

        /// Stop after creating resources.
        #[arg(long)]
        create_only: bool,

        /// Stop after copying artifacts.
        #[arg(long)]
        copy_only: bool,

        /// Show what would be created without creating it.
        #[arg(long)]
        dry_run: bool,

        /// Destroy resources no longer in the network file.
        #[arg(long)]
        kill_obsolete: bool,

        /// Machines receiving artifacts at the same time.
        #[arg(long)]
        max_concurrent_copy: Option<usize>,
    },

    /// Destroy resources.
    Destroy {
        /// Resource selection.
        #[command(flatten)]
        filter: FilterArgs,

        /// Erase data volumes instead of keeping them.
        #[arg(long)]
        wipe: bool,
    },

    /// Start machines.
    Start {
        /// Resource selection.
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Stop machines.
    Stop {
        /// Resource selection.
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Compare persisted state with the providers.
    Check {
        /// Resource selection.
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Switch machines back to a previous generation.
    Rollback {
        /// Generation number.
        generation: u64,

        /// Resource selection.
        #[command(flatten)]
        filter: FilterArgs,

        /// Create flags.
        #[command(flatten)]
        flags: CreateFlags,

        /// Machines receiving artifacts at the same time.
        #[arg(long)]
        max_concurrent_copy: Option<usize>,
    },

    /// List recorded generations.
    ListGenerations,

    /// Snapshot machine volumes.
    Backup {
        /// Resource selection.
        #[command(flatten)]
        filter: FilterArgs,

        /// Devices to snapshot; every attached device by default.
        #[arg(long, value_delimiter = ',')]
        devices: Vec<String>,
    },

    /// List backups.
    Backups {
        /// Resource selection.
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Restore machine volumes from a backup.
    Restore {
        /// Resource selection.
        #[command(flatten)]
        filter: FilterArgs,

        /// Backup id; the latest complete backup by default.
        #[arg(long)]
        backup_id: Option<String>,

        /// Devices to restore; every device in the backup by default.
        #[arg(long, value_delimiter = ',')]
        devices: Vec<String>,
    },

    /// Remove a backup.
    RemoveBackup {
        /// Backup id.
        backup_id: String,

        /// Forget the backup but keep the snapshots.
        #[arg(long)]
        keep_physical: bool,
    },

    /// Show or remove the deployment lock.
    Unlock {
        /// Remove the lock even though its holder may be alive.
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    /// Deploy options for `deploy`.
    #[must_use]
    pub fn deploy_options(&self) -> Option<DeployOptions> {
        match self {
            Self::Deploy {
                filter,
                flags,
                build_only,
                create_only,
                copy_only,
                dry_run,
                kill_obsolete,
                max_concurrent_copy,
            } => Some(DeployOptions {
                filter: filter.to_filter(),
                create: (*flags).into(),
                build_only: *build_only,
                create_only: *create_only,
                copy_only: *copy_only,
                dry_run: *dry_run,
                kill_obsolete: *kill_obsolete,
                max_concurrent_copy: *max_concurrent_copy,
            }),
            Self::Rollback {
                filter,
                flags,
                max_concurrent_copy,
                ..
            } => Some(DeployOptions {
                filter: filter.to_filter(),
                create: (*flags).into(),
                max_concurrent_copy: *max_concurrent_copy,
                ..DeployOptions::default()
            }),
            _ => None,
        }
    }
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log line format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_flags_become_options() {
        let cli = Cli::try_parse_from([
            "statecraft",
            "deploy",
            "--include",
            "web,db",
            "--exclude",
            "db",
            "--allow-reboot",
            "--copy-only",
            "--max-concurrent-copy",
            "2",
        ])
        .expect("parse");

        let options = cli.command.deploy_options().expect("deploy options");
        assert!(options.copy_only);
        assert!(options.create.allow_reboot);
        assert!(!options.create.force_reboot);
        assert_eq!(options.max_concurrent_copy, Some(2));
        assert!(options.filter.matches("web"));
        assert!(!options.filter.matches("db"));
        assert!(!options.filter.matches("cache"));
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["statecraft", "info", "-d", "prod", "--output", "json"])
            .expect("parse");
        assert_eq!(cli.deployment.as_deref(), Some("prod"));
        assert!(matches!(cli.output, OutputFormat::Json));
        assert!(cli.command.deploy_options().is_none());
    }

    #[test]
    fn test_rollback_takes_generation() {
        let cli = Cli::try_parse_from(["statecraft", "rollback", "3", "--force-reboot"])
            .expect("parse");
        let Commands::Rollback { generation, .. } = &cli.command else {
            panic!("expected rollback");
        };
        assert_eq!(*generation, 3);
        let options = cli.command.deploy_options().expect("options");
        assert!(options.create.force_reboot);
    }
}
