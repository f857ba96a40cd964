//! Cloud virtual machines.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::DefinitionHasher;
use crate::error::{DeployError, EngineError, ProviderError, Result};
use crate::poll::retry_transient;
use crate::provider::{KIND_SNAPSHOT, KIND_VM, KIND_VOLUME, ObjectStatus, ProviderObject};
use crate::state::Field;

use super::super::{
    BackupStatus, CheckResult, CreateContext, Definition, Machine, MachineBackup, Resource,
    ResourceContext, ResourceHandle, ResourceState, SshDefaults,
};
use super::object::ObjectOps;

const REGION: Field<Option<String>> = Field::optional("region");
const INSTANCE_TYPE: Field<Option<String>> = Field::optional("instance_type");
const IMAGE: Field<Option<String>> = Field::optional("image");
const TAGS: Field<BTreeMap<String, String>> = Field::with_default("tags", BTreeMap::new);
const PUBLIC_IP: Field<Option<String>> = Field::optional("public_ip");
const PRIVATE_IP: Field<Option<String>> = Field::optional("private_ip");
/// Volume id attached per device.
const ATTACHED: Field<BTreeMap<String, String>> = Field::with_default("attached", BTreeMap::new);
/// Snapshot id per device, per backup id.
const BACKUPS: Field<BTreeMap<String, BTreeMap<String, String>>> =
    Field::with_default("backups", BTreeMap::new);

/// Settings of a `vm` definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VmSettings {
    region: String,
    instance_type: String,
    image: String,
    #[serde(default)]
    keypair: Option<String>,
    #[serde(default)]
    security_groups: Vec<String>,
    #[serde(default)]
    volumes: Vec<VolumeAttachment>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VolumeAttachment {
    /// Name of a `volume` resource.
    volume: String,
    /// Device name on the machine.
    device: String,
}

/// A cloud virtual machine.
pub struct VmResource {
    ctx: ResourceContext,
}

impl VmResource {
    /// Creates the resource.
    #[must_use]
    pub const fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }

    fn ops(&self) -> ObjectOps<'_> {
        ObjectOps::new(&self.ctx, KIND_VM)
    }

    fn volume_ops(&self) -> ObjectOps<'_> {
        ObjectOps::new(&self.ctx, KIND_VOLUME)
    }

    fn vm_id(&self) -> Result<String> {
        self.ctx.handle.provider_id().ok_or_else(|| {
            DeployError::internal(format!("VM '{}' has not been created", self.name()))
        })
    }

    fn get<T: serde::de::DeserializeOwned>(&self, field: &Field<T>) -> Result<T> {
        self.ctx.handle.attrs().get(field)
    }

    fn set<T: Serialize + PartialEq>(&self, field: &Field<T>, value: &T) -> Result<()> {
        self.ctx.handle.attrs().set(field, value)
    }

    /// Records the addresses reported by the provider, warning when they
    /// changed.
    fn record_addresses(&self, object: &ProviderObject) -> Result<Vec<String>> {
        let mut drift = Vec::new();
        let name = self.name().to_string();
        self.ctx.handle.db().transaction(|| {
            for (field, key) in [(&PUBLIC_IP, "public_ip"), (&PRIVATE_IP, "private_ip")] {
                let old = self.get(field)?;
                let new = object.attr_str(key).map(str::to_string);
                if old.is_some() && new.is_some() && old != new {
                    warn!(
                        resource = %name,
                        "{key} changed from {} to {}",
                        old.as_deref().unwrap_or_default(),
                        new.as_deref().unwrap_or_default()
                    );
                    drift.push(format!("{key} changed"));
                }
                if new.is_some() {
                    self.set(field, &new)?;
                }
            }
            Ok(())
        })?;
        Ok(drift)
    }

    /// Forgets a VM that vanished so the next create makes a new one.
    fn forget(&self) -> Result<()> {
        let handle = &self.ctx.handle;
        handle.db().transaction(|| {
            handle.set_provider_id(None)?;
            handle.set_state(ResourceState::Missing)?;
            handle.set_definition_hash(None)?;
            handle.set_artifact(None)?;
            self.set(&PUBLIC_IP, &None)?;
            self.set(&PRIVATE_IP, &None)?;
            self.set(&ATTACHED, &BTreeMap::new())
        })
    }

    fn create_spec(&self, settings: &VmSettings, ctx: &CreateContext) -> Result<Value> {
        let keypair = settings
            .keypair
            .as_deref()
            .map(|name| ctx.peer_provider_id(name))
            .transpose()?;
        let security_groups = settings
            .security_groups
            .iter()
            .map(|name| ctx.peer_provider_id(name))
            .collect::<Result<Vec<_>>>()?;

        Ok(json!({
            "name": format!("{}-{}", self.ctx.handle.deployment(), self.name()),
            "region": settings.region,
            "instance_type": settings.instance_type,
            "image": settings.image,
            "keypair": keypair,
            "security_groups": security_groups,
            "tags": settings.tags,
        }))
    }

    async fn wait_until_running(&self, id: &str) -> Result<()> {
        let object = self
            .ops()
            .wait_for_status(
                id,
                &[ObjectStatus::Running],
                Some(self.ctx.settings.create_timeout_secs),
            )
            .await
            .into_result(&format!("VM '{}' to start", self.name()))?;
        self.record_addresses(&object)?;
        self.ctx.handle.set_state(ResourceState::Up)?;

        let target = self.ssh_target()?;
        let timeout = self.ctx.settings.duration(self.ctx.settings.ssh_timeout_secs);
        if !self.ctx.remote.wait_for_ssh(&target, timeout).await? {
            return Err(DeployError::timeout(
                format!("SSH on '{}'", self.name()),
                timeout.as_secs(),
            ));
        }
        Ok(())
    }

    /// Restores the creation-time settings of a VM recorded with its id
    /// alone.
    async fn recover_settings(&self) -> Result<()> {
        let recovered = self
            .ops()
            .recover(&[
                (&REGION, "region"),
                (&INSTANCE_TYPE, "instance_type"),
                (&IMAGE, "image"),
            ])
            .await?;
        let Some(object) = recovered else {
            return Ok(());
        };
        if let Some(tags) = object.attrs.get("tags") {
            let tags: BTreeMap<String, String> =
                serde_json::from_value(tags.clone()).unwrap_or_default();
            self.set(&TAGS, &tags)?;
        }
        Ok(())
    }

    /// Returns false when the change was deferred for lack of
    /// `allow_reboot`.
    async fn change_instance_type(&self, id: &str, wanted: &str, ctx: &CreateContext) -> Result<bool> {
        let current = self.get(&INSTANCE_TYPE)?;
        if current.as_deref() == Some(wanted) {
            return Ok(true);
        }
        if !ctx.options.allow_reboot {
            warn!(
                resource = %self.name(),
                "changing instance type to {wanted} requires a stop/start; pass --allow-reboot"
            );
            return Ok(false);
        }

        info!(resource = %self.name(), "changing instance type to {wanted}");
        self.stop().await?;
        self.ops()
            .modify(id, &json!({ "instance_type": wanted }))
            .await?;
        self.set(&INSTANCE_TYPE, &Some(wanted.to_string()))?;
        self.start().await?;
        Ok(true)
    }

    async fn attach_volumes(&self, id: &str, settings: &VmSettings, ctx: &CreateContext) -> Result<()> {
        let mut attached = self.get(&ATTACHED)?;
        for attachment in &settings.volumes {
            let volume_id = ctx.peer_provider_id(&attachment.volume)?;
            if attached.get(&attachment.device) == Some(&volume_id) {
                continue;
            }
            if let Some(other) = attached.get(&attachment.device) {
                return Err(ProviderError::PreconditionViolation {
                    resource: self.name().to_string(),
                    attribute: format!("device {}", attachment.device),
                    message: format!("already holds volume {other}"),
                }
                .into());
            }

            info!(resource = %self.name(), "attaching {} as {}", attachment.volume, attachment.device);
            self.volume_ops()
                .action(&volume_id, "attach", &json!({ "vm": id, "device": attachment.device }))
                .await?;
            self.volume_ops()
                .wait_for_status(
                    &volume_id,
                    &[ObjectStatus::InUse],
                    Some(self.ctx.settings.create_timeout_secs),
                )
                .await
                .into_result(&format!("volume {volume_id} to attach"))?;

            attached.insert(attachment.device.clone(), volume_id);
            self.set(&ATTACHED, &attached)?;
        }
        Ok(())
    }

    /// Stops the VM, escalating to forced stops when it does not react.
    async fn escalating_stop(&self, id: &str) -> Result<()> {
        let settings = &self.ctx.settings;
        let ops = self.ops();
        let stopped = [ObjectStatus::Stopped];

        ops.action(id, "stop", &json!({ "force": false })).await?;
        if ops
            .wait_for_status(id, &stopped, Some(settings.stop_timeout_secs))
            .await
            .succeeded()?
        {
            return Ok(());
        }

        warn!(resource = %self.name(), "VM did not stop cleanly; forcing");
        ops.action(id, "stop", &json!({ "force": true })).await?;
        if ops
            .wait_for_status(id, &stopped, Some(settings.force_stop_timeout_secs))
            .await
            .succeeded()?
        {
            return Ok(());
        }

        warn!(resource = %self.name(), "forced stop timed out; forcing again and waiting");
        ops.action(id, "stop", &json!({ "force": true })).await?;
        ops.wait_for_status(id, &stopped, None)
            .await
            .into_result(&format!("VM '{}' to stop", self.name()))?;
        Ok(())
    }

    fn selected<'a>(
        devices: &'a BTreeMap<String, String>,
        wanted: &'a [String],
    ) -> impl Iterator<Item = (&'a String, &'a String)> + 'a {
        devices
            .iter()
            .filter(move |(device, _)| wanted.is_empty() || wanted.contains(device))
    }
}

#[async_trait]
impl Resource for VmResource {
    fn handle(&self) -> &ResourceHandle {
        &self.ctx.handle
    }

    fn as_machine(&self) -> Option<&dyn Machine> {
        Some(self)
    }

    fn implicit_dependencies(&self, defn: &Definition) -> Vec<String> {
        let Ok(settings) = defn.parse::<VmSettings>() else {
            return Vec::new();
        };
        let mut names: Vec<String> = settings.keypair.into_iter().collect();
        names.extend(settings.security_groups);
        names.extend(settings.volumes.into_iter().map(|v| v.volume));
        names
    }

    async fn create(&self, defn: &Definition, ctx: &CreateContext) -> Result<()> {
        let settings: VmSettings = defn.parse()?;
        let hash = DefinitionHasher::new().hash_definition(defn);
        let handle = &self.ctx.handle;

        if handle.provider_id().is_some() {
            self.recover_settings().await?;
            if let Some(region) = self.get(&REGION)? {
                if region != settings.region {
                    return Err(ProviderError::PreconditionViolation {
                        resource: self.name().to_string(),
                        attribute: String::from("region"),
                        message: format!(
                            "created in {region}, definition asks for {}",
                            settings.region
                        ),
                    }
                    .into());
                }
            }

            if ctx.options.check || handle.state() != ResourceState::Up {
                let result = self.check().await?;
                if result.exists == Some(false) {
                    if !ctx.options.allow_recreate {
                        return Err(ProviderError::disappeared(
                            KIND_VM,
                            handle.provider_id().unwrap_or_default(),
                        )
                        .into());
                    }
                    warn!(resource = %self.name(), "VM disappeared; recreating it");
                    self.forget()?;
                }
            }

            if handle.state() == ResourceState::Up
                && handle.definition_hash().as_deref() == Some(hash.as_str())
            {
                debug!(resource = %self.name(), "up to date");
                return Ok(());
            }
        }

        let spec = self.create_spec(&settings, ctx)?;
        let (id, created) = self
            .ops()
            .ensure_created(&spec, || {
                self.set(&REGION, &Some(settings.region.clone()))?;
                self.set(&INSTANCE_TYPE, &Some(settings.instance_type.clone()))?;
                self.set(&IMAGE, &Some(settings.image.clone()))?;
                self.set(&TAGS, &settings.tags)?;
                handle.set_state(ResourceState::Starting)
            })
            .await?;
        if !created && self.get(&IMAGE)?.as_deref() != Some(settings.image.as_str()) {
            warn!(resource = %self.name(), "image changes only apply to new VMs");
        }

        if handle.state() == ResourceState::Stopped {
            self.start().await?;
        }
        let converged = self
            .change_instance_type(&id, &settings.instance_type, ctx)
            .await?;
        if handle.state() != ResourceState::Up {
            self.wait_until_running(&id).await?;
        }

        if self.get(&TAGS)? != settings.tags {
            self.ops().modify(&id, &json!({ "tags": settings.tags })).await?;
            self.set(&TAGS, &settings.tags)?;
        }

        self.attach_volumes(&id, &settings, ctx).await?;
        // A deferred change must be retried on the next deploy.
        handle.set_definition_hash(converged.then_some(hash.as_str()))
    }

    async fn destroy(&self, wipe: bool) -> Result<bool> {
        let Some(id) = self.ctx.handle.provider_id() else {
            return Ok(true);
        };
        if !self
            .ctx
            .confirm
            .confirm(&format!("are you sure you want to destroy VM '{}' ({id})?", self.name()))
        {
            return Ok(false);
        }
        if wipe {
            debug!(resource = %self.name(), "VM disks are discarded with the VM; nothing to wipe");
        }

        self.ops().delete().await?;
        self.forget()?;
        Ok(true)
    }

    async fn check(&self) -> Result<CheckResult> {
        let (mut result, object) = self.ops().check().await?;
        match object {
            Some(object) => result.drift.extend(self.record_addresses(&object)?),
            None if result.exists == Some(false) => {
                self.set(&PUBLIC_IP, &None)?;
                self.set(&PRIVATE_IP, &None)?;
            }
            None => {}
        }
        Ok(result)
    }

    async fn start(&self) -> Result<()> {
        let id = self.vm_id()?;
        if self.ctx.handle.state() == ResourceState::Up {
            return Ok(());
        }
        info!(resource = %self.name(), "starting");
        self.ctx.handle.set_state(ResourceState::Starting)?;
        self.ops().action(&id, "start", &json!({})).await?;
        self.wait_until_running(&id).await
    }

    async fn stop(&self) -> Result<()> {
        let id = self.vm_id()?;
        if self.ctx.handle.state() == ResourceState::Stopped {
            return Ok(());
        }
        info!(resource = %self.name(), "stopping");
        self.ctx.handle.set_state(ResourceState::Stopping)?;
        self.escalating_stop(&id).await?;
        self.ctx.handle.set_state(ResourceState::Stopped)
    }

    async fn after_activation(&self, defn: &Definition) -> Result<()> {
        let settings: VmSettings = defn.parse()?;
        let wanted: BTreeSet<&str> = settings.volumes.iter().map(|v| v.device.as_str()).collect();
        let mut attached = self.get(&ATTACHED)?;
        let stale: Vec<(String, String)> = attached
            .iter()
            .filter(|(device, _)| !wanted.contains(device.as_str()))
            .map(|(device, volume)| (device.clone(), volume.clone()))
            .collect();

        for (device, volume_id) in stale {
            info!(resource = %self.name(), "detaching volume {volume_id} from {device}");
            match self.volume_ops().action(&volume_id, "detach", &json!({})).await {
                Ok(_) => {
                    self.volume_ops()
                        .wait_for_status(
                            &volume_id,
                            &[ObjectStatus::Available],
                            Some(self.ctx.settings.create_timeout_secs),
                        )
                        .await
                        .into_result(&format!("volume {volume_id} to detach"))?;
                }
                Err(err) if err.is_disappeared() => {
                    warn!(resource = %self.name(), "volume {volume_id} is already gone");
                }
                Err(err) => return Err(err),
            }
            attached.remove(&device);
            self.set(&ATTACHED, &attached)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Machine for VmResource {
    fn public_address(&self) -> Option<String> {
        self.get(&PUBLIC_IP).ok().flatten()
    }

    fn private_address(&self) -> Option<String> {
        self.get(&PRIVATE_IP).ok().flatten()
    }

    fn ssh_login(&self) -> SshDefaults {
        self.ctx.ssh.clone()
    }

    fn supports_backup(&self) -> bool {
        true
    }

    async fn backup(&self, backup_id: &str, devices: &[String]) -> Result<()> {
        let vm_id = self.vm_id()?;
        let attached = self.get(&ATTACHED)?;
        let provider = self.ctx.provider()?;
        let policy = self.ctx.settings.retry_policy();

        for (device, volume_id) in Self::selected(&attached, devices) {
            let mut backups = self.get(&BACKUPS)?;
            let entry = backups.entry(backup_id.to_string()).or_default();
            if entry.contains_key(device) {
                continue;
            }

            info!(resource = %self.name(), "snapshotting {device} ({volume_id})");
            let spec = json!({
                "volume": volume_id,
                "description": format!(
                    "{} {} {device} backup {backup_id}",
                    self.ctx.handle.deployment(),
                    self.name()
                ),
            });
            // Deterministic token: a rerun of the same backup reuses the
            // snapshot instead of taking a second one.
            let token = format!("{vm_id}-{backup_id}-{device}");
            let snapshot = retry_transient(&policy, &format!("snapshot {device}"), || {
                provider.create(KIND_SNAPSHOT, &spec, &token)
            })
            .await?;

            entry.insert(device.clone(), snapshot.id);
            self.set(&BACKUPS, &backups)?;
        }
        Ok(())
    }

    async fn get_backups(&self) -> Result<BTreeMap<String, MachineBackup>> {
        let backups = self.get(&BACKUPS)?;
        let attached = self.get(&ATTACHED)?;
        let provider = self.ctx.provider()?;
        let policy = self.ctx.settings.retry_policy();

        let mut result = BTreeMap::new();
        for (backup_id, devices) in backups {
            let mut status = if attached.keys().all(|d| devices.contains_key(d)) {
                BackupStatus::Complete
            } else {
                BackupStatus::Incomplete
            };
            for snapshot_id in devices.values() {
                let snapshot = retry_transient(&policy, &format!("describe snapshot {snapshot_id}"), || {
                    provider.describe(KIND_SNAPSHOT, snapshot_id)
                })
                .await?;
                let snapshot_status = match snapshot.map(|s| s.status) {
                    None => BackupStatus::Unavailable,
                    Some(s) if s.is_gone() => BackupStatus::Unavailable,
                    Some(ObjectStatus::Available) => BackupStatus::Complete,
                    Some(_) => BackupStatus::Running,
                };
                status = status.merge(snapshot_status);
            }
            result.insert(backup_id, MachineBackup { devices, status });
        }
        Ok(result)
    }

    async fn restore(&self, backup_id: &str, devices: &[String]) -> Result<()> {
        let backups = self.get(&BACKUPS)?;
        let snapshots = backups.get(backup_id).ok_or_else(|| EngineError::UnknownBackup {
            backup_id: backup_id.to_string(),
        })?;
        let attached = self.get(&ATTACHED)?;

        self.stop().await?;
        for (device, snapshot_id) in Self::selected(snapshots, devices) {
            let Some(volume_id) = attached.get(device) else {
                warn!(resource = %self.name(), "no volume attached as {device}; skipping");
                continue;
            };
            info!(resource = %self.name(), "restoring {device} from {snapshot_id}");
            self.volume_ops()
                .action(volume_id, "restore", &json!({ "snapshot": snapshot_id }))
                .await?;
            self.volume_ops()
                .wait_for_status(
                    volume_id,
                    &[ObjectStatus::InUse],
                    Some(self.ctx.settings.create_timeout_secs),
                )
                .await
                .into_result(&format!("volume {volume_id} to restore"))?;
        }
        self.start().await
    }

    async fn remove_backup(&self, backup_id: &str, keep_physical: bool) -> Result<()> {
        let mut backups = self.get(&BACKUPS)?;
        let Some(snapshots) = backups.remove(backup_id) else {
            return Err(EngineError::UnknownBackup {
                backup_id: backup_id.to_string(),
            }
            .into());
        };

        if !keep_physical {
            let provider = self.ctx.provider()?;
            let policy = self.ctx.settings.retry_policy();
            for snapshot_id in snapshots.values() {
                let deleted = retry_transient(&policy, &format!("delete snapshot {snapshot_id}"), || {
                    provider.delete(KIND_SNAPSHOT, snapshot_id)
                })
                .await;
                match deleted {
                    Ok(()) => {}
                    Err(err) if err.is_disappeared() => {
                        debug!(resource = %self.name(), "snapshot {snapshot_id} already gone");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        self.set(&BACKUPS, &backups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::CreateOptions;
    use crate::testing::TestBed;

    fn vm_definition() -> Definition {
        Definition::new("web", "vm")
            .with_attr("region", json!("eu-1"))
            .with_attr("instance_type", json!("small"))
            .with_attr("image", json!("base-24"))
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");
        let ctx = bed.create_context(CreateOptions::default());

        vm.create(&vm_definition(), &ctx).await.expect("first create");
        let after_first = bed.cloud.mutations();
        assert_eq!(vm.handle().state(), ResourceState::Up);
        assert!(vm.as_machine().and_then(|m| m.public_address()).is_some());

        vm.create(&vm_definition(), &ctx).await.expect("second create");
        assert_eq!(bed.cloud.mutations(), after_first);
        assert_eq!(bed.cloud.count(KIND_VM), 1);
    }

    #[tokio::test]
    async fn test_check_option_queries_but_does_not_mutate() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");
        vm.create(&vm_definition(), &bed.create_context(CreateOptions::default()))
            .await
            .expect("create");
        let mutations = bed.cloud.mutations();

        let checking = bed.create_context(CreateOptions {
            check: true,
            ..CreateOptions::default()
        });
        vm.create(&vm_definition(), &checking).await.expect("recheck");
        assert_eq!(bed.cloud.mutations(), mutations);
    }

    #[tokio::test]
    async fn test_persisted_token_prevents_duplicate_creation() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");

        // A previous run sent the create call and died before recording the id.
        let token = String::from("token-from-crashed-run");
        vm.handle()
            .attrs()
            .set(&super::super::object::CLIENT_TOKEN, &Some(token.clone()))
            .expect("seed token");
        let spec = json!({ "name": "web", "region": "eu-1" });
        bed.cloud
            .create_direct(KIND_VM, &spec, &token)
            .expect("first object");

        vm.create(&vm_definition(), &bed.create_context(CreateOptions::default()))
            .await
            .expect("retry");

        assert_eq!(bed.cloud.count(KIND_VM), 1);
        assert!(vm.handle().attrs().get(&super::super::object::CLIENT_TOKEN).expect("token").is_none());
    }

    #[tokio::test]
    async fn test_id_without_settings_converges_without_mutations() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");

        // A run that recorded the id and nothing else.
        let spec = json!({
            "name": "web",
            "region": "eu-1",
            "instance_type": "small",
            "image": "base-24",
            "tags": {},
        });
        let object = bed
            .cloud
            .create_direct(KIND_VM, &spec, "earlier-run")
            .expect("object");
        vm.handle().set_provider_id(Some(&object.id)).expect("seed id");

        let rebooting = bed.create_context(CreateOptions {
            allow_reboot: true,
            ..CreateOptions::default()
        });
        vm.create(&vm_definition(), &rebooting).await.expect("recover");
        assert_eq!(bed.cloud.mutations(), 0);
        assert!(bed.cloud.log().is_empty());
        assert!(vm.handle().definition_hash().is_some());
        assert_eq!(vm.handle().state(), ResourceState::Up);

        let moved = vm_definition().with_attr("region", json!("us-2"));
        let err = vm.create(&moved, &rebooting).await.expect_err("region change");
        assert!(matches!(
            err,
            DeployError::Provider(ProviderError::PreconditionViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_region_is_immutable() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");
        let ctx = bed.create_context(CreateOptions::default());
        vm.create(&vm_definition(), &ctx).await.expect("create");

        let moved = vm_definition().with_attr("region", json!("us-2"));
        let err = vm.create(&moved, &ctx).await.expect_err("region change");
        assert!(matches!(
            err,
            DeployError::Provider(ProviderError::PreconditionViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_instance_type_change_needs_allow_reboot() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");
        vm.create(&vm_definition(), &bed.create_context(CreateOptions::default()))
            .await
            .expect("create");
        let id = vm.handle().provider_id().expect("id");

        let bigger = vm_definition().with_attr("instance_type", json!("large"));
        vm.create(&bigger, &bed.create_context(CreateOptions::default()))
            .await
            .expect("warns and continues");
        assert_eq!(bed.cloud.attr(KIND_VM, &id, "instance_type"), Some(json!("small")));

        let allowed = bed.create_context(CreateOptions {
            allow_reboot: true,
            ..CreateOptions::default()
        });
        vm.create(&bigger, &allowed).await.expect("resize");
        assert_eq!(bed.cloud.attr(KIND_VM, &id, "instance_type"), Some(json!("large")));
        assert_eq!(vm.handle().state(), ResourceState::Up);
    }

    #[tokio::test]
    async fn test_check_detects_out_of_band_stop() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");
        vm.create(&vm_definition(), &bed.create_context(CreateOptions::default()))
            .await
            .expect("create");
        let id = vm.handle().provider_id().expect("id");

        bed.cloud.set_status(KIND_VM, &id, ObjectStatus::Stopped);
        let result = vm.check().await.expect("check");

        assert_eq!(result.state, ResourceState::Stopped);
        assert!(!result.drift.is_empty());
        assert_eq!(vm.handle().state(), ResourceState::Stopped);
    }

    #[tokio::test]
    async fn test_disappeared_vm_requires_allow_recreate() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");
        vm.create(&vm_definition(), &bed.create_context(CreateOptions::default()))
            .await
            .expect("create");
        let id = vm.handle().provider_id().expect("id");
        bed.cloud.remove(KIND_VM, &id);

        let checking = bed.create_context(CreateOptions {
            check: true,
            ..CreateOptions::default()
        });
        let err = vm.create(&vm_definition(), &checking).await.expect_err("gone");
        assert!(err.is_disappeared());

        let recreating = bed.create_context(CreateOptions {
            check: true,
            allow_recreate: true,
            ..CreateOptions::default()
        });
        vm.create(&vm_definition(), &recreating).await.expect("recreated");
        assert_ne!(vm.handle().provider_id(), Some(id));
        assert_eq!(bed.cloud.count(KIND_VM), 1);
    }

    #[tokio::test]
    async fn test_stop_escalates_when_ignored() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");
        vm.create(&vm_definition(), &bed.create_context(CreateOptions::default()))
            .await
            .expect("create");

        bed.cloud.ignore_clean_stops();
        vm.stop().await.expect("stops eventually");

        assert_eq!(vm.handle().state(), ResourceState::Stopped);
        assert!(bed.cloud.forced_stops() >= 1);
    }

    #[tokio::test]
    async fn test_declined_destroy_keeps_record() {
        let bed = TestBed::with_confirm(false);
        let vm = bed.resource("web", "vm");
        vm.create(&vm_definition(), &bed.create_context(CreateOptions::default()))
            .await
            .expect("create");

        assert!(!vm.destroy(false).await.expect("declined"));
        assert_eq!(bed.cloud.count(KIND_VM), 1);
        assert!(vm.handle().provider_id().is_some());
    }

    #[tokio::test]
    async fn test_backup_restore_and_remove() {
        let bed = TestBed::new();
        let data = bed.resource("data", "volume");
        let vm = bed.resource("web", "vm");
        let ctx = bed.create_context(CreateOptions::default());

        data.create(
            &Definition::new("data", "volume")
                .with_attr("region", json!("eu-1"))
                .with_attr("size_gb", json!(10)),
            &ctx,
        )
        .await
        .expect("volume");
        let with_volume = vm_definition().with_attr(
            "volumes",
            json!([{ "volume": "data", "device": "/dev/xvdf" }]),
        );
        vm.create(&with_volume, &ctx).await.expect("vm");

        let machine = vm.as_machine().expect("machine");
        machine.backup("20240101000000", &[]).await.expect("backup");
        machine.backup("20240101000000", &[]).await.expect("rerun is a no-op");
        assert_eq!(bed.cloud.count(KIND_SNAPSHOT), 1);

        let backups = machine.get_backups().await.expect("list");
        assert_eq!(backups["20240101000000"].status, BackupStatus::Complete);

        machine.restore("20240101000000", &[]).await.expect("restore");
        assert_eq!(vm.handle().state(), ResourceState::Up);

        machine
            .remove_backup("20240101000000", false)
            .await
            .expect("remove");
        assert_eq!(bed.cloud.count(KIND_SNAPSHOT), 0);
        assert!(machine.get_backups().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_after_activation_detaches_unreferenced_volumes() {
        let bed = TestBed::new();
        let data = bed.resource("data", "volume");
        let vm = bed.resource("web", "vm");
        let ctx = bed.create_context(CreateOptions::default());
        data.create(
            &Definition::new("data", "volume")
                .with_attr("region", json!("eu-1"))
                .with_attr("size_gb", json!(10)),
            &ctx,
        )
        .await
        .expect("volume");
        let with_volume = vm_definition().with_attr(
            "volumes",
            json!([{ "volume": "data", "device": "/dev/xvdf" }]),
        );
        vm.create(&with_volume, &ctx).await.expect("vm");
        let volume_id = data.handle().provider_id().expect("volume id");
        assert_eq!(
            bed.cloud.status(KIND_VOLUME, &volume_id),
            Some(ObjectStatus::InUse)
        );

        vm.after_activation(&vm_definition()).await.expect("cleanup");
        assert_eq!(
            bed.cloud.status(KIND_VOLUME, &volume_id),
            Some(ObjectStatus::Available)
        );
    }

    #[test]
    fn test_implicit_dependencies() {
        let bed = TestBed::new();
        let vm = bed.resource("web", "vm");
        let defn = vm_definition()
            .with_attr("keypair", json!("kp"))
            .with_attr("security_groups", json!(["sg"]))
            .with_attr("volumes", json!([{ "volume": "data", "device": "/dev/xvdf" }]));
        assert_eq!(vm.implicit_dependencies(&defn), vec!["kp", "sg", "data"]);
    }
}
