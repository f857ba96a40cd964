//! Network-wide backups of machine volumes.
//!
//! A backup is identified by a timestamp id shared by every participating
//! machine. Its network status merges the per-machine statuses; a machine
//! that took no part makes the backup incomplete.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{DeployError, EngineError, Result};
use crate::resource::{BackupStatus, MachineBackup, Resource};
use crate::scheduler::run_tasks;

use super::{Deployment, Filter};

/// One backup across the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkBackup {
    /// Backup id.
    pub id: String,
    /// Merged status.
    pub status: BackupStatus,
    /// Parts held by each machine.
    pub machines: BTreeMap<String, MachineBackup>,
    /// Machines with no part in it.
    pub missing: Vec<String>,
}

/// A fresh backup id: the current UTC time, `YYYYMMDDHHMMSS`.
#[must_use]
pub fn new_backup_id() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Combines every machine's backups into network backups keyed by id.
#[must_use]
pub fn merge_backups(
    participants: &[String],
    per_machine: Vec<(String, BTreeMap<String, MachineBackup>)>,
) -> BTreeMap<String, NetworkBackup> {
    let mut merged: BTreeMap<String, NetworkBackup> = BTreeMap::new();
    for (machine, backups) in per_machine {
        for (id, part) in backups {
            let entry = merged.entry(id.clone()).or_insert_with(|| NetworkBackup {
                id,
                status: BackupStatus::Complete,
                machines: BTreeMap::new(),
                missing: Vec::new(),
            });
            entry.status = entry.status.merge(part.status);
            entry.machines.insert(machine.clone(), part);
        }
    }

    for backup in merged.values_mut() {
        for machine in participants {
            if !backup.machines.contains_key(machine) {
                backup.missing.push(machine.clone());
                backup.status = backup.status.merge(BackupStatus::Incomplete);
            }
        }
    }
    merged
}

impl Deployment {
    fn backup_machines(&self, filter: &Filter) -> Vec<(String, Arc<dyn Resource>)> {
        self.active_machines(filter)
            .into_iter()
            .filter(|r| r.as_machine().is_some_and(|m| m.supports_backup()))
            .map(|r| (r.name().to_string(), r))
            .collect()
    }

    fn backup_workers(&self) -> i64 {
        i64::try_from(self.env.settings.max_concurrent_backup).unwrap_or(i64::MAX)
    }

    /// Snapshots the volumes of every selected machine under a new id.
    /// An empty `devices` list means every attached device.
    ///
    /// # Errors
    ///
    /// Returns the failure, or an aggregate of every failed machine. Parts
    /// already taken stay recorded; the backup then shows as incomplete.
    pub async fn backup(&self, filter: &Filter, devices: &[String]) -> Result<String> {
        let _lock = self.lock()?;
        let id = new_backup_id();
        let tasks = self.backup_machines(filter);
        info!(deployment = %self.uuid, "Backing up {} machine(s) as {id}", tasks.len());

        let shared = (id.clone(), Arc::new(devices.to_vec()));
        run_tasks(self.backup_workers(), tasks, move |resource| {
            backup_one(resource, shared.0.clone(), Arc::clone(&shared.1))
        })
        .await?;
        Ok(id)
    }

    /// Every backup of the selected machines.
    ///
    /// # Errors
    ///
    /// Returns the failure, or an aggregate of every machine whose backups
    /// could not be listed.
    pub async fn get_backups(&self, filter: &Filter) -> Result<BTreeMap<String, NetworkBackup>> {
        let tasks = self.backup_machines(filter);
        let participants: Vec<String> = tasks.iter().map(|(name, _)| name.clone()).collect();
        let per_machine = run_tasks(self.backup_workers(), tasks, list_one).await?;
        Ok(merge_backups(&participants, per_machine))
    }

    /// Restores the selected machines from a backup, by default the latest
    /// complete one. Machines without a part in it are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownBackup`] if there is no such backup or
    /// no complete one, otherwise the failure of any machine.
    pub async fn restore(
        &self,
        filter: &Filter,
        backup_id: Option<&str>,
        devices: &[String],
    ) -> Result<String> {
        let backups = self.get_backups(filter).await?;
        let _lock = self.lock()?;
        let backup = match backup_id {
            Some(id) => backups.get(id),
            None => backups
                .values()
                .rev()
                .find(|b| b.status == BackupStatus::Complete),
        }
        .ok_or_else(|| EngineError::UnknownBackup {
            backup_id: backup_id.unwrap_or("latest complete").to_string(),
        })?;

        for name in &backup.missing {
            warn!(resource = %name, "Not part of backup {}; skipping", backup.id);
        }
        let tasks: Vec<(String, Arc<dyn Resource>)> = self
            .backup_machines(filter)
            .into_iter()
            .filter(|(name, _)| backup.machines.contains_key(name))
            .collect();
        info!(deployment = %self.uuid, "Restoring {} machine(s) from {}", tasks.len(), backup.id);

        let shared = (backup.id.clone(), Arc::new(devices.to_vec()));
        run_tasks(self.backup_workers(), tasks, move |resource| {
            restore_one(resource, shared.0.clone(), Arc::clone(&shared.1))
        })
        .await?;
        Ok(backup.id.clone())
    }

    /// Forgets a backup on every machine holding part of it, deleting the
    /// snapshots unless `keep_physical` is set.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownBackup`] if no machine has the backup,
    /// otherwise the failure of any machine.
    pub async fn remove_backup(&self, backup_id: &str, keep_physical: bool) -> Result<()> {
        let backups = self.get_backups(&Filter::default()).await?;
        let _lock = self.lock()?;
        let backup = backups.get(backup_id).ok_or_else(|| EngineError::UnknownBackup {
            backup_id: backup_id.to_string(),
        })?;
        let tasks: Vec<(String, Arc<dyn Resource>)> = self
            .backup_machines(&Filter::default())
            .into_iter()
            .filter(|(name, _)| backup.machines.contains_key(name))
            .collect();
        info!(deployment = %self.uuid, "Removing backup {backup_id}");

        let id = backup_id.to_string();
        run_tasks(self.backup_workers(), tasks, move |resource| {
            remove_one(resource, id.clone(), keep_physical)
        })
        .await?;
        Ok(())
    }
}

fn not_a_machine(resource: &dyn Resource) -> DeployError {
    DeployError::internal(format!("'{}' is not a machine", resource.name()))
}

async fn backup_one(resource: Arc<dyn Resource>, id: String, devices: Arc<Vec<String>>) -> Result<()> {
    let machine = resource
        .as_machine()
        .ok_or_else(|| not_a_machine(resource.as_ref()))?;
    machine.backup(&id, &devices).await
}

async fn list_one(resource: Arc<dyn Resource>) -> Result<(String, BTreeMap<String, MachineBackup>)> {
    let machine = resource
        .as_machine()
        .ok_or_else(|| not_a_machine(resource.as_ref()))?;
    Ok((resource.name().to_string(), machine.get_backups().await?))
}

async fn restore_one(resource: Arc<dyn Resource>, id: String, devices: Arc<Vec<String>>) -> Result<()> {
    let machine = resource
        .as_machine()
        .ok_or_else(|| not_a_machine(resource.as_ref()))?;
    machine.restore(&id, &devices).await
}

async fn remove_one(resource: Arc<dyn Resource>, id: String, keep_physical: bool) -> Result<()> {
    let machine = resource
        .as_machine()
        .ok_or_else(|| not_a_machine(resource.as_ref()))?;
    machine.remove_backup(&id, keep_physical).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::Builder;
    use crate::config::DefinitionCompiler;
    use crate::engine::DeployOptions;
    use crate::provider::KIND_SNAPSHOT;
    use crate::resource::Definition;
    use crate::testing::{FakeBuilder, FakeCompiler, TestBed};
    use serde_json::json;

    fn part(status: BackupStatus) -> MachineBackup {
        MachineBackup {
            devices: BTreeMap::from([(String::from("/dev/xvdf"), String::from("snap-1"))]),
            status,
        }
    }

    fn network() -> Vec<Definition> {
        let mut definitions = Vec::new();
        for name in ["a", "b"] {
            definitions.push(
                Definition::new(format!("{name}-data"), "volume")
                    .with_attr("region", json!("eu-1"))
                    .with_attr("size_gb", json!(10)),
            );
            definitions.push(
                Definition::new(name, "vm")
                    .with_attr("region", json!("eu-1"))
                    .with_attr("instance_type", json!("small"))
                    .with_attr("image", json!("base-24"))
                    .with_attr(
                        "volumes",
                        json!([{ "volume": format!("{name}-data"), "device": "/dev/xvdf" }]),
                    ),
            );
        }
        definitions
    }

    async fn deployed(bed: &TestBed) -> Deployment {
        let compiler: Arc<dyn DefinitionCompiler> = Arc::new(FakeCompiler::new(network()));
        let builder: Arc<dyn Builder> = Arc::new(FakeBuilder::default());
        let mut deployment = bed.deployment(compiler, Some(builder));
        deployment
            .deploy(&DeployOptions::default())
            .await
            .expect("deploy");
        deployment
    }

    #[test]
    fn test_backup_id_is_a_timestamp() {
        let id = new_backup_id();
        assert_eq!(id.len(), 14);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_missing_machine_makes_backup_incomplete() {
        let participants = vec![String::from("a"), String::from("b")];
        let merged = merge_backups(
            &participants,
            vec![(
                String::from("a"),
                BTreeMap::from([(String::from("1"), part(BackupStatus::Complete))]),
            )],
        );
        let backup = &merged["1"];
        assert_eq!(backup.status, BackupStatus::Incomplete);
        assert_eq!(backup.missing, vec![String::from("b")]);
    }

    #[test]
    fn test_running_wins_when_merging() {
        let participants = vec![String::from("a"), String::from("b")];
        let merged = merge_backups(
            &participants,
            vec![
                (
                    String::from("a"),
                    BTreeMap::from([(String::from("1"), part(BackupStatus::Unavailable))]),
                ),
                (
                    String::from("b"),
                    BTreeMap::from([(String::from("1"), part(BackupStatus::Running))]),
                ),
            ],
        );
        assert_eq!(merged["1"].status, BackupStatus::Running);
        assert!(merged["1"].missing.is_empty());
    }

    #[tokio::test]
    async fn test_backup_covers_every_machine() {
        let bed = TestBed::new();
        let deployment = deployed(&bed).await;

        let id = deployment
            .backup(&Filter::default(), &[])
            .await
            .expect("backup");

        assert_eq!(bed.cloud.count(KIND_SNAPSHOT), 2);
        let backups = deployment
            .get_backups(&Filter::default())
            .await
            .expect("list");
        let backup = &backups[&id];
        assert_eq!(backup.status, BackupStatus::Complete);
        assert_eq!(backup.machines.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_backup_is_incomplete() {
        let bed = TestBed::new();
        let deployment = deployed(&bed).await;

        let id = deployment
            .backup(&Filter::new(vec![String::from("a")], Vec::new()), &[])
            .await
            .expect("backup a");

        let backups = deployment
            .get_backups(&Filter::default())
            .await
            .expect("list");
        assert_eq!(backups[&id].status, BackupStatus::Incomplete);
        assert_eq!(backups[&id].missing, vec![String::from("b")]);
    }

    #[tokio::test]
    async fn test_restore_defaults_to_latest_complete() {
        let bed = TestBed::new();
        let deployment = deployed(&bed).await;

        let err = deployment
            .restore(&Filter::default(), None, &[])
            .await
            .expect_err("nothing to restore");
        assert!(matches!(
            err,
            DeployError::Engine(EngineError::UnknownBackup { .. })
        ));

        let id = deployment
            .backup(&Filter::default(), &[])
            .await
            .expect("backup");
        let restored = deployment
            .restore(&Filter::default(), None, &[])
            .await
            .expect("restore");
        assert_eq!(restored, id);
        assert!(bed.cloud.log().iter().any(|c| c == "restore volume"));
    }

    #[tokio::test]
    async fn test_remove_backup() {
        let bed = TestBed::new();
        let deployment = deployed(&bed).await;

        let err = deployment
            .remove_backup("19990101000000", false)
            .await
            .expect_err("unknown");
        assert!(matches!(
            err,
            DeployError::Engine(EngineError::UnknownBackup { .. })
        ));

        let id = deployment
            .backup(&Filter::default(), &[])
            .await
            .expect("backup");
        deployment
            .remove_backup(&id, false)
            .await
            .expect("remove");

        assert_eq!(bed.cloud.count(KIND_SNAPSHOT), 0);
        let backups = deployment
            .get_backups(&Filter::default())
            .await
            .expect("list");
        assert!(backups.is_empty());
    }
}
