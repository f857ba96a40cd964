//! The resource state machine.
//!
//! Every resource type implements [`Resource`]: `create` converges the
//! persisted state toward a [`Definition`] and must be safe to repeat,
//! `destroy` tears the provider object down, `check` reconciles the
//! persisted state with what the provider reports. Machines additionally
//! implement [`Machine`] (reachability and backups).
//!
//! Concrete types are looked up by type tag in a [`ResourceRegistry`].

mod definition;
mod handle;
pub mod kinds;
mod registry;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::Settings;
use crate::confirm::Confirm;
use crate::error::{DeployError, EngineError, Result};
use crate::provider::{ProviderApi, Providers};
use crate::remote::{RemoteExecutor, SshTarget};

pub use definition::Definition;
pub use handle::ResourceHandle;
pub use registry::{ResourceFactory, ResourceRegistry};

/// Baseline lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Not created, or gone.
    #[default]
    Missing,
    /// Being created or started.
    Starting,
    /// Running and usable.
    Up,
    /// Being stopped.
    Stopping,
    /// Stopped.
    Stopped,
    /// Could not be determined.
    Unknown,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Missing => "missing",
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Flags controlling `create`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Query the provider before deciding there is nothing to do.
    pub check: bool,
    /// Allow changes that require a reboot or stop/start.
    pub allow_reboot: bool,
    /// Allow recreating objects that disappeared out-of-band.
    pub allow_recreate: bool,
    /// Reboot machines after activation even if not required.
    pub force_reboot: bool,
}

/// Inputs to one `create` call besides the definition.
#[derive(Clone)]
pub struct CreateContext {
    /// Flags from the operator.
    pub options: CreateOptions,
    /// Every resource of the deployment by name.
    pub peers: Arc<BTreeMap<String, Arc<dyn Resource>>>,
}

impl CreateContext {
    /// Looks up another resource of the deployment.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a resource of the deployment.
    pub fn peer(&self, name: &str) -> Result<&Arc<dyn Resource>> {
        self.peers.get(name).ok_or_else(|| {
            EngineError::MissingDefinition {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Provider id of another resource, which must already be created.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown or not created yet.
    pub fn peer_provider_id(&self, name: &str) -> Result<String> {
        self.peer(name)?.handle().provider_id().ok_or_else(|| {
            DeployError::internal(format!("dependency '{name}' has not been created"))
        })
    }
}

/// Outcome of a `check` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    /// Whether the provider object exists; `None` if unknown.
    pub exists: Option<bool>,
    /// State after reconciliation.
    pub state: ResourceState,
    /// Differences between persisted and observed state.
    pub drift: Vec<String>,
}

/// Default SSH login for machines that do not specify one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshDefaults {
    /// Login user.
    pub user: String,
    /// Port.
    pub port: u16,
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            user: String::from("root"),
            port: 22,
        }
    }
}

/// Collaborators handed to a resource type's factory.
#[derive(Clone)]
pub struct ResourceContext {
    /// Persisted identity.
    pub handle: ResourceHandle,
    /// Provider backends.
    pub providers: Providers,
    /// Remote execution on machines.
    pub remote: Arc<dyn RemoteExecutor>,
    /// Confirmation prompts.
    pub confirm: Arc<dyn Confirm>,
    /// Settings.
    pub settings: Arc<Settings>,
    /// SSH login defaults.
    pub ssh: SshDefaults,
}

impl ResourceContext {
    /// Provider this resource was created with.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is not configured.
    pub fn provider(&self) -> Result<Arc<dyn ProviderApi>> {
        self.providers
            .get(&self.handle.provider_name(), self.handle.name())
    }
}

/// Status of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Every snapshot exists and is complete.
    Complete,
    /// Some machine or device has no snapshot for this backup.
    Incomplete,
    /// Some snapshot is still being taken.
    Running,
    /// Some snapshot no longer exists on the provider.
    Unavailable,
}

impl BackupStatus {
    /// Combines two statuses of the same backup.
    ///
    /// "running" wins over "incomplete", which wins over "unavailable";
    /// the result is "complete" only if both are.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        if self.rank() >= other.rank() { self } else { other }
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Complete => 0,
            Self::Unavailable => 1,
            Self::Incomplete => 2,
            Self::Running => 3,
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::Incomplete => "incomplete",
            Self::Running => "running",
            Self::Unavailable => "unavailable",
        };
        write!(f, "{s}")
    }
}

/// One machine's part of a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineBackup {
    /// Snapshot id per device.
    pub devices: BTreeMap<String, String>,
    /// Status of this machine's snapshots.
    pub status: BackupStatus,
}

/// A piece of infrastructure.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Persisted identity and common attributes.
    fn handle(&self) -> &ResourceHandle;

    /// Name.
    fn name(&self) -> &str {
        self.handle().name()
    }

    /// Machine view, for types that are machines.
    fn as_machine(&self) -> Option<&dyn Machine> {
        None
    }

    /// Dependencies implied by the settings (a volume's machine, a record's
    /// target), in addition to the explicit `depends_on`.
    fn implicit_dependencies(&self, _defn: &Definition) -> Vec<String> {
        Vec::new()
    }

    /// Resources whose create must finish before this one's create starts.
    fn create_after(&self, all: &[Arc<dyn Resource>], defn: &Definition) -> BTreeSet<String> {
        let mut wanted: BTreeSet<String> = defn.depends_on.iter().cloned().collect();
        wanted.extend(self.implicit_dependencies(defn));
        all.iter()
            .map(|r| r.name().to_string())
            .filter(|name| wanted.contains(name) && name != self.name())
            .collect()
    }

    /// Resources that may start being destroyed only once this one is:
    /// everything it was recorded as depending on.
    fn destroy_before(&self, all: &[Arc<dyn Resource>]) -> BTreeSet<String> {
        let depends_on = self.handle().depends_on();
        all.iter()
            .map(|r| r.name().to_string())
            .filter(|name| name != self.name() && depends_on.contains(name))
            .collect()
    }

    /// Converges toward `defn`; a repeat call without changes or drift
    /// makes no provider mutation.
    async fn create(&self, defn: &Definition, ctx: &CreateContext) -> Result<()>;

    /// Tears down the provider object. Returns whether the local record may
    /// be deleted.
    async fn destroy(&self, wipe: bool) -> Result<bool>;

    /// Reconciles persisted state with the provider.
    async fn check(&self) -> Result<CheckResult>;

    /// Starts a stopped resource.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stops a running resource.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Cleanup once the new configuration is live.
    async fn after_activation(&self, _defn: &Definition) -> Result<()> {
        Ok(())
    }

    /// Facts handed to the build collaborator.
    fn facts(&self) -> Value {
        let handle = self.handle();
        json!({
            "type": handle.type_tag(),
            "index": handle.index(),
            "provider_id": handle.provider_id(),
        })
    }
}

/// A resource reachable over SSH.
#[async_trait]
pub trait Machine: Resource {
    /// Public address, if any.
    fn public_address(&self) -> Option<String>;

    /// Private address, if any.
    fn private_address(&self) -> Option<String> {
        None
    }

    /// SSH login settings.
    fn ssh_login(&self) -> SshDefaults;

    /// Where to reach the machine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unreachable`] if the machine has no address.
    fn ssh_target(&self) -> Result<SshTarget> {
        let host = self
            .public_address()
            .or_else(|| self.private_address())
            .ok_or_else(|| EngineError::Unreachable {
                machine: self.name().to_string(),
            })?;
        let login = self.ssh_login();
        Ok(SshTarget {
            machine: self.name().to_string(),
            host,
            port: login.port,
            user: login.user,
        })
    }

    /// Whether this machine type can take backups.
    fn supports_backup(&self) -> bool {
        false
    }

    /// Snapshots the machine's devices (all when `devices` is empty).
    async fn backup(&self, _backup_id: &str, _devices: &[String]) -> Result<()> {
        Err(self.unsupported("backup"))
    }

    /// Backups known for this machine.
    async fn get_backups(&self) -> Result<BTreeMap<String, MachineBackup>> {
        Ok(BTreeMap::new())
    }

    /// Restores devices from a backup (all when `devices` is empty).
    async fn restore(&self, _backup_id: &str, _devices: &[String]) -> Result<()> {
        Err(self.unsupported("restore"))
    }

    /// Forgets a backup, deleting its snapshots unless `keep_physical`.
    async fn remove_backup(&self, _backup_id: &str, _keep_physical: bool) -> Result<()> {
        Err(self.unsupported("remove-backup"))
    }

    /// Error for an operation this type does not support.
    fn unsupported(&self, operation: &str) -> DeployError {
        EngineError::Unsupported {
            operation: operation.to_string(),
            type_tag: self.handle().type_tag().to_string(),
            name: self.name().to_string(),
        }
        .into()
    }
}

/// Machine facts (index, addresses, type) for the build collaborator.
#[must_use]
pub fn machine_facts(machine: &dyn Machine) -> Value {
    let mut facts = machine.facts();
    if let Value::Object(map) = &mut facts {
        map.insert(String::from("public_address"), json!(machine.public_address()));
        map.insert(String::from("private_address"), json!(machine.private_address()));
    }
    facts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_names() {
        let encoded = serde_json::to_string(&ResourceState::Stopping).expect("encodes");
        assert_eq!(encoded, "\"stopping\"");
        assert_eq!(ResourceState::default(), ResourceState::Missing);
        assert_eq!(ResourceState::Up.to_string(), "up");
    }

    #[test]
    fn test_backup_status_display() {
        assert_eq!(BackupStatus::Incomplete.to_string(), "incomplete");
    }

    #[test]
    fn test_backup_status_precedence() {
        use BackupStatus::{Complete, Incomplete, Running, Unavailable};
        assert_eq!(Complete.merge(Complete), Complete);
        assert_eq!(Complete.merge(Incomplete), Incomplete);
        assert_eq!(Incomplete.merge(Running), Running);
        assert_eq!(Running.merge(Incomplete), Running);
        assert_eq!(Unavailable.merge(Incomplete), Incomplete);
        assert_eq!(Complete.merge(Unavailable), Unavailable);
    }
}
