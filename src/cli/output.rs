//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::engine::{CheckReport, DeploymentSummary, Generation, NetworkBackup, ResourceInfo};
use crate::resource::{BackupStatus, ResourceState};
use crate::state::LockInfo;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Deployment row for table display.
#[derive(Tabled)]
struct DeploymentRow {
    #[tabled(rename = "UUID")]
    uuid: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Description")]
    description: String,
    #[tabled(rename = "Resources")]
    resources: usize,
    #[tabled(rename = "Created")]
    created: String,
}

/// Resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    type_tag: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "#")]
    index: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Public")]
    public_address: String,
    #[tabled(rename = "Private")]
    private_address: String,
}

#[derive(Tabled)]
struct GenerationRow {
    #[tabled(rename = "")]
    current: String,
    #[tabled(rename = "Generation")]
    number: u64,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Machines")]
    machines: usize,
    #[tabled(rename = "Build")]
    build_path: String,
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "Backup")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Machines")]
    machines: String,
    #[tabled(rename = "Missing")]
    missing: String,
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Exists")]
    exists: String,
    #[tabled(rename = "Drift")]
    drift: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats the deployment list.
    #[must_use]
    pub fn format_deployments(&self, deployments: &[DeploymentSummary]) -> String {
        match self.format {
            OutputFormat::Json => Self::json(deployments),
            OutputFormat::Text => {
                if deployments.is_empty() {
                    return String::from("No deployments.\n");
                }
                let rows: Vec<DeploymentRow> = deployments
                    .iter()
                    .map(|d| DeploymentRow {
                        uuid: d.uuid.clone(),
                        name: d.name.clone().unwrap_or_default(),
                        description: Self::truncate(d.description.as_deref().unwrap_or(""), 40),
                        resources: d.resources,
                        created: d
                            .created_at
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats the resources of one deployment.
    #[must_use]
    pub fn format_info(&self, summary: &DeploymentSummary, resources: &[ResourceInfo]) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "deployment": summary,
                "resources": resources,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(
                    output,
                    "\nDeployment: {} ({})",
                    summary.name.as_deref().unwrap_or("unnamed").bold(),
                    summary.uuid
                );
                if let Some(description) = &summary.description {
                    let _ = writeln!(output, "   {description}");
                }
                if let Some(path) = &summary.spec_path {
                    let _ = writeln!(output, "   Network file: {path}");
                }
                output.push('\n');

                if resources.is_empty() {
                    output.push_str("   No resources.\n");
                    return output;
                }
                let rows: Vec<ResourceRow> = resources
                    .iter()
                    .map(|r| ResourceRow {
                        name: r.name.clone(),
                        type_tag: r.type_tag.clone(),
                        state: Self::format_state(r.state, r.obsolete),
                        index: r.index.map(|i| i.to_string()).unwrap_or_default(),
                        provider_id: r.provider_id.clone().unwrap_or_default(),
                        public_address: r.public_address.clone().unwrap_or_default(),
                        private_address: r.private_address.clone().unwrap_or_default(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats the recorded generations.
    #[must_use]
    pub fn format_generations(&self, generations: &[Generation], current: Option<u64>) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "current": current,
                "generations": generations,
            })),
            OutputFormat::Text => {
                if generations.is_empty() {
                    return String::from("No generations recorded.\n");
                }
                let rows: Vec<GenerationRow> = generations
                    .iter()
                    .map(|g| GenerationRow {
                        current: if Some(g.number) == current {
                            "*".green().to_string()
                        } else {
                            String::new()
                        },
                        number: g.number,
                        created: g.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        machines: g.machines.len(),
                        build_path: Self::truncate(&g.build_path, 50),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats backups.
    #[must_use]
    pub fn format_backups(&self, backups: &BTreeMap<String, NetworkBackup>) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&backups.values().collect::<Vec<_>>()),
            OutputFormat::Text => {
                if backups.is_empty() {
                    return String::from("No backups.\n");
                }
                let rows: Vec<BackupRow> = backups
                    .values()
                    .map(|b| BackupRow {
                        id: b.id.clone(),
                        status: Self::format_backup_status(b.status),
                        machines: b.machines.keys().cloned().collect::<Vec<_>>().join(", "),
                        missing: b.missing.join(", "),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats check results.
    #[must_use]
    pub fn format_checks(&self, reports: &[CheckReport]) -> String {
        match self.format {
            OutputFormat::Json => {
                let entries: Vec<serde_json::Value> = reports
                    .iter()
                    .map(|r| match &r.outcome {
                        Ok(result) => serde_json::json!({
                            "name": r.name,
                            "state": result.state,
                            "exists": result.exists,
                            "drift": result.drift,
                        }),
                        Err(err) => serde_json::json!({
                            "name": r.name,
                            "error": err.to_string(),
                        }),
                    })
                    .collect();
                Self::json(&entries)
            }
            OutputFormat::Text => {
                let rows: Vec<CheckRow> = reports
                    .iter()
                    .map(|r| match &r.outcome {
                        Ok(result) => CheckRow {
                            name: r.name.clone(),
                            state: Self::format_state(result.state, false),
                            exists: result
                                .exists
                                .map_or_else(|| String::from("?"), |e| e.to_string()),
                            drift: if result.drift.is_empty() {
                                "none".dimmed().to_string()
                            } else {
                                result.drift.join("; ").yellow().to_string()
                            },
                        },
                        Err(err) => CheckRow {
                            name: r.name.clone(),
                            state: "error".red().to_string(),
                            exists: String::from("?"),
                            drift: Self::truncate(&err.to_string(), 60),
                        },
                    })
                    .collect();
                let attention = reports.iter().filter(|r| r.needs_attention()).count();
                let mut output = format!("{}\n", Table::new(rows));
                if attention == 0 {
                    let _ = writeln!(output, "\n{} No drift detected.", "✓".green());
                } else {
                    let _ = writeln!(
                        output,
                        "\n{} {attention}/{} resources need attention.",
                        "⚠".yellow(),
                        reports.len()
                    );
                }
                output
            }
        }
    }

    /// Formats the holder of a deployment lock.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&lock),
            OutputFormat::Text => lock.map_or_else(
                || String::from("Not locked.\n"),
                |info| {
                    let expired = if info.is_expired() {
                        " (expired)".red().to_string()
                    } else {
                        format!(", expires in {}s", info.remaining_secs())
                    };
                    format!(
                        "Locked by {} since {}{expired}\n",
                        info.holder,
                        info.acquired_at.format("%Y-%m-%d %H:%M:%S")
                    )
                },
            ),
        }
    }

    /// Formats a resource state with color.
    fn format_state(state: ResourceState, obsolete: bool) -> String {
        let text = match state {
            ResourceState::Up => state.to_string().green().to_string(),
            ResourceState::Starting | ResourceState::Stopping => state.to_string().yellow().to_string(),
            ResourceState::Stopped | ResourceState::Missing => state.to_string().red().to_string(),
            ResourceState::Unknown => state.to_string().dimmed().to_string(),
        };
        if obsolete {
            format!("{text} {}", "(obsolete)".dimmed())
        } else {
            text
        }
    }

    fn format_backup_status(status: BackupStatus) -> String {
        match status {
            BackupStatus::Complete => status.to_string().green().to_string(),
            BackupStatus::Running => status.to_string().yellow().to_string(),
            BackupStatus::Incomplete | BackupStatus::Unavailable => status.to_string().red().to_string(),
        }
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                Self::json(&serde_json::json!({ "status": "success", "message": message }))
            }
            OutputFormat::Text => format!("{} {message}", "✓".green()),
        }
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                Self::json(&serde_json::json!({ "status": "error", "message": message }))
            }
            OutputFormat::Text => format!("{} {message}", "✗".red()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MachineBackup;

    fn summary() -> DeploymentSummary {
        DeploymentSummary {
            uuid: String::from("3f2a"),
            name: Some(String::from("prod")),
            description: None,
            spec_path: Some(String::from("statecraft.yaml")),
            resources: 1,
            created_at: None,
        }
    }

    fn resource() -> ResourceInfo {
        ResourceInfo {
            name: String::from("web"),
            type_tag: String::from("vm"),
            state: ResourceState::Up,
            obsolete: true,
            index: Some(0),
            provider_id: Some(String::from("vm-1")),
            public_address: Some(String::from("198.51.100.1")),
            private_address: None,
        }
    }

    #[test]
    fn test_info_text_lists_resources() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_info(&summary(), &[resource()]);
        assert!(text.contains("prod"));
        assert!(text.contains("198.51.100.1"));
        assert!(text.contains("up (obsolete)"));
    }

    #[test]
    fn test_info_json_is_parseable() {
        let json = OutputFormatter::new(OutputFormat::Json).format_info(&summary(), &[resource()]);
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["resources"][0]["state"], "up");
        assert_eq!(value["deployment"]["name"], "prod");
    }

    #[test]
    fn test_backups_show_missing_machines() {
        colored::control::set_override(false);
        let backup = NetworkBackup {
            id: String::from("20260101120000"),
            status: BackupStatus::Incomplete,
            machines: BTreeMap::from([(
                String::from("a"),
                MachineBackup {
                    devices: BTreeMap::new(),
                    status: BackupStatus::Complete,
                },
            )]),
            missing: vec![String::from("b")],
        };
        let backups = BTreeMap::from([(backup.id.clone(), backup)]);
        let text = OutputFormatter::new(OutputFormat::Text).format_backups(&backups);
        assert!(text.contains("incomplete"));
        assert!(text.contains("20260101120000"));
    }

    #[test]
    fn test_lock_shows_remaining_time() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        assert_eq!(formatter.format_lock(None), "Not locked.\n");

        let mut info = LockInfo::new("3f2a");
        info.expires_at = info.acquired_at + chrono::Duration::seconds(600);
        let text = formatter.format_lock(Some(&info));
        assert!(text.contains(&info.holder));
        assert!(text.contains("expires in"));

        info.expires_at = info.acquired_at - chrono::Duration::seconds(1);
        assert!(formatter.format_lock(Some(&info)).contains("(expired)"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a long description", 10), "a long ...");
    }
}
