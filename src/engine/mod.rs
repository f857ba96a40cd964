//! Orchestration engine.
//!
//! A [`Deployment`] owns the persisted resources of one deployment and the
//! definitions of the current evaluation, and drives the whole-deployment
//! workflows: deploy, destroy, rollback, lifecycle and backups. Every
//! workflow is idempotent; re-running it after a failure is the recovery
//! path.

mod backup;
mod deploy;
mod destroy;
mod generations;
mod lifecycle;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::build::Builder;
use crate::config::{DefinitionCompiler, Settings};
use crate::confirm::Confirm;
use crate::error::{EngineError, Result, StateError};
use crate::provider::Providers;
use crate::remote::RemoteExecutor;
use crate::resource::{
    Definition, Resource, ResourceContext, ResourceHandle, ResourceRegistry, ResourceState,
    SshDefaults,
};
use crate::state::{Attrs, DeploymentLock, Field, ResourceRow, Scope, StateDb};

pub use backup::{NetworkBackup, merge_backups, new_backup_id};
pub use deploy::DeployOptions;
pub use generations::Generation;
pub use lifecycle::CheckReport;

/// Human-readable deployment name.
pub const NAME: Field<Option<String>> = Field::optional("name");
/// Free-form description.
pub const DESCRIPTION: Field<Option<String>> = Field::optional("description");
/// Network file the definitions are compiled from.
pub const SPEC_PATH: Field<Option<String>> = Field::optional("spec_path");
/// Whether every generation is kept for rollback.
pub const ROLLBACK_ENABLED: Field<bool> = Field::with_default("rollback_enabled", rollback_default);

const fn rollback_default() -> bool {
    true
}

/// Everything a deployment talks to besides its state.
#[derive(Clone)]
pub struct Collaborators {
    /// Resource types.
    pub registry: ResourceRegistry,
    /// Provider backends.
    pub providers: Providers,
    /// Produces the definitions.
    pub compiler: Arc<dyn DefinitionCompiler>,
    /// Builds machine artifacts; machines are not activated without one.
    pub builder: Option<Arc<dyn Builder>>,
    /// Remote execution on machines.
    pub remote: Arc<dyn RemoteExecutor>,
    /// Confirmation prompts.
    pub confirm: Arc<dyn Confirm>,
    /// Settings.
    pub settings: Arc<Settings>,
    /// SSH login defaults.
    pub ssh: SshDefaults,
    /// Directory for lock and facts files; locks are process-local when
    /// unset.
    pub state_dir: Option<PathBuf>,
}

/// Resource name filter shared by every workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Only these names, when not empty.
    pub include: Vec<String>,
    /// Never these names.
    pub exclude: Vec<String>,
}

impl Filter {
    /// Creates a filter.
    #[must_use]
    pub const fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// Whether the workflow should act on `name`.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|n| n == name))
            && !self.exclude.iter().any(|n| n == name)
    }
}

/// One row of `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    /// Name.
    pub name: String,
    /// Type tag.
    pub type_tag: String,
    /// Lifecycle state.
    pub state: ResourceState,
    /// Absent from the current definitions.
    pub obsolete: bool,
    /// Address slot.
    pub index: Option<u32>,
    /// Provider-assigned id.
    pub provider_id: Option<String>,
    /// Public address of a machine.
    pub public_address: Option<String>,
    /// Private address of a machine.
    pub private_address: Option<String>,
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentSummary {
    /// Deployment id.
    pub uuid: String,
    /// Name, if set.
    pub name: Option<String>,
    /// Description, if set.
    pub description: Option<String>,
    /// Network file.
    pub spec_path: Option<String>,
    /// Number of resources.
    pub resources: usize,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
}

/// A deployment and its resources.
pub struct Deployment {
    uuid: String,
    db: StateDb,
    attrs: Attrs,
    env: Collaborators,
    definitions: BTreeMap<String, Definition>,
    resources: BTreeMap<String, Arc<dyn Resource>>,
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("uuid", &self.uuid)
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Deployment {
    /// Creates a new deployment.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn create(
        db: StateDb,
        env: Collaborators,
        name: Option<&str>,
        description: Option<&str>,
        spec_path: Option<&Path>,
    ) -> Result<Self> {
        let uuid = db.transaction(|| {
            let uuid = db.create_deployment(None)?;
            let attrs = Attrs::new(db.clone(), Scope::Deployment(uuid.clone()));
            attrs.set(&NAME, &name.map(str::to_string))?;
            attrs.set(&DESCRIPTION, &description.map(str::to_string))?;
            attrs.set(
                &SPEC_PATH,
                &spec_path.map(|p| p.to_string_lossy().to_string()),
            )?;
            Ok(uuid)
        })?;
        info!(deployment = %uuid, "Created deployment {}", name.unwrap_or("(unnamed)"));
        Self::open(db, &uuid, env)
    }

    /// Opens an existing deployment and instantiates its resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the deployment does not exist or a resource has
    /// an unregistered type.
    pub fn open(db: StateDb, uuid: &str, env: Collaborators) -> Result<Self> {
        if !db.has_deployment(uuid) {
            return Err(StateError::DeploymentNotFound {
                id: uuid.to_string(),
            }
            .into());
        }
        let mut deployment = Self {
            uuid: uuid.to_string(),
            attrs: Attrs::new(db.clone(), Scope::Deployment(uuid.to_string())),
            db,
            env,
            definitions: BTreeMap::new(),
            resources: BTreeMap::new(),
        };
        for (id, row) in deployment.db.resources(uuid) {
            let resource = deployment.instantiate(id, &row)?;
            deployment.resources.insert(row.name.clone(), resource);
        }
        debug!(deployment = %uuid, "Loaded {} resource(s)", deployment.resources.len());
        Ok(deployment)
    }

    fn instantiate(&self, id: u64, row: &ResourceRow) -> Result<Arc<dyn Resource>> {
        self.env.registry.instantiate(ResourceContext {
            handle: ResourceHandle::new(self.db.clone(), id, row),
            providers: self.env.providers.clone(),
            remote: Arc::clone(&self.env.remote),
            confirm: Arc::clone(&self.env.confirm),
            settings: Arc::clone(&self.env.settings),
            ssh: self.env.ssh.clone(),
        })
    }

    /// Deployment id.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Deployment name, if set.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.attrs.get(&NAME).ok().flatten()
    }

    /// Description, if set.
    #[must_use]
    pub fn description(&self) -> Option<String> {
        self.attrs.get(&DESCRIPTION).ok().flatten()
    }

    /// Network file, if recorded.
    #[must_use]
    pub fn spec_path(&self) -> Option<PathBuf> {
        self.attrs.get(&SPEC_PATH).ok().flatten().map(PathBuf::from)
    }

    /// Whether every generation is kept.
    #[must_use]
    pub fn rollback_enabled(&self) -> bool {
        self.attrs.get(&ROLLBACK_ENABLED).unwrap_or(true)
    }

    /// Sets whether every generation is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_rollback_enabled(&self, enabled: bool) -> Result<()> {
        self.attrs.set(&ROLLBACK_ENABLED, &enabled)
    }

    /// Deployment attributes.
    #[must_use]
    pub const fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// Definitions of the last evaluation.
    #[must_use]
    pub const fn definitions(&self) -> &BTreeMap<String, Definition> {
        &self.definitions
    }

    /// Resources by name.
    #[must_use]
    pub const fn resources(&self) -> &BTreeMap<String, Arc<dyn Resource>> {
        &self.resources
    }

    /// One resource.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&Arc<dyn Resource>> {
        self.resources.get(name)
    }

    fn active(&self) -> impl Iterator<Item = &Arc<dyn Resource>> {
        self.resources.values().filter(|r| !r.handle().obsolete())
    }

    fn active_machines(&self, filter: &Filter) -> Vec<Arc<dyn Resource>> {
        self.active()
            .filter(|r| r.as_machine().is_some() && filter.matches(r.name()))
            .cloned()
            .collect()
    }

    /// Acquires the deployment lock.
    ///
    /// # Errors
    ///
    /// Returns an error if another workflow holds it.
    pub fn lock(&self) -> Result<DeploymentLock> {
        DeploymentLock::acquire(self.env.state_dir.as_deref(), &self.uuid)
    }

    /// Removes a stale lock file. Returns whether there was one.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    pub fn unlock(&self) -> Result<bool> {
        match &self.env.state_dir {
            Some(dir) => DeploymentLock::force_unlock(dir, &self.uuid),
            None => Ok(false),
        }
    }

    /// Replaces the definitions with a fresh compilation.
    ///
    /// # Errors
    ///
    /// Any compiler failure is returned unchanged.
    pub fn evaluate(&mut self) -> Result<()> {
        let definitions = self.env.compiler.compile(&self.uuid)?;
        self.definitions = definitions
            .into_iter()
            .map(|defn| (defn.name.clone(), defn))
            .collect();
        debug!(deployment = %self.uuid, "Evaluated {} definition(s)", self.definitions.len());
        Ok(())
    }

    /// Evaluates, records new resources, and flags resources without a
    /// definition as obsolete. With `kill_obsolete`, obsolete resources
    /// matching `filter` are destroyed right away.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation fails or a definition changes the type
    /// of an existing resource.
    pub async fn evaluate_active(&mut self, filter: &Filter, kill_obsolete: bool) -> Result<()> {
        self.evaluate()?;

        let db = self.db.clone();
        let created = db.transaction(|| {
            for (name, resource) in &self.resources {
                let handle = resource.handle();
                let obsolete = !self.definitions.contains_key(name);
                if handle.obsolete() != obsolete {
                    if obsolete {
                        warn!(resource = %name, "No longer defined; marked obsolete");
                    } else {
                        info!(resource = %name, "Defined again; no longer obsolete");
                    }
                    handle.set_obsolete(obsolete)?;
                }
            }

            let mut created = Vec::new();
            for defn in self.definitions.values() {
                match self.resources.get(&defn.name) {
                    Some(resource) if resource.handle().type_tag() != defn.type_tag => {
                        return Err(EngineError::TypeChanged {
                            name: defn.name.clone(),
                            from: resource.handle().type_tag().to_string(),
                            to: defn.type_tag.clone(),
                        }
                        .into());
                    }
                    Some(_) => {}
                    None => {
                        let id = db.insert_resource(&self.uuid, &defn.name, &defn.type_tag)?;
                        let row = ResourceRow {
                            deployment: self.uuid.clone(),
                            name: defn.name.clone(),
                            type_tag: defn.type_tag.clone(),
                        };
                        let resource = self.instantiate(id, &row)?;
                        resource.handle().set_provider_name(defn.provider.as_deref())?;
                        debug!(resource = %defn.name, "Recorded new {} resource", defn.type_tag);
                        created.push(resource);
                    }
                }
            }
            Ok(created)
        })?;
        for resource in created {
            self.resources.insert(resource.name().to_string(), resource);
        }

        if kill_obsolete {
            let obsolete: BTreeSet<String> = self
                .resources
                .values()
                .filter(|r| r.handle().obsolete() && filter.matches(r.name()))
                .map(|r| r.name().to_string())
                .collect();
            if !obsolete.is_empty() {
                info!(deployment = %self.uuid, "Destroying {} obsolete resource(s)", obsolete.len());
                self.destroy_selected(&obsolete, false).await?;
            }
        }
        Ok(())
    }

    /// Gives every active resource without an index the next free one.
    /// Indices are never reused, even after a resource is deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn assign_indices(&self) -> Result<()> {
        let mut next = self.attrs.get(&NEXT_INDEX)?.max(
            self.resources
                .values()
                .filter_map(|r| r.handle().index())
                .map(|i| i + 1)
                .max()
                .unwrap_or(0),
        );
        self.db.transaction(|| {
            for resource in self.active().filter(|r| r.handle().index().is_none()) {
                debug!(resource = %resource.name(), "Assigned index {next}");
                resource.handle().set_index(next)?;
                next += 1;
            }
            self.attrs.set(&NEXT_INDEX, &next)
        })
    }

    /// Resources with their state, for display.
    #[must_use]
    pub fn info(&self) -> Vec<ResourceInfo> {
        self.resources
            .values()
            .map(|r| {
                let handle = r.handle();
                let machine = r.as_machine();
                ResourceInfo {
                    name: r.name().to_string(),
                    type_tag: handle.type_tag().to_string(),
                    state: handle.state(),
                    obsolete: handle.obsolete(),
                    index: handle.index(),
                    provider_id: handle.provider_id(),
                    public_address: machine.and_then(|m| m.public_address()),
                    private_address: machine.and_then(|m| m.private_address()),
                }
            })
            .collect()
    }

    /// Deletes the deployment. Without `force` it must hold no resources;
    /// with `force` the remaining records are dropped without destroying
    /// anything on the providers.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::DeploymentNotEmpty`] if resources remain and
    /// `force` is not set.
    pub fn delete(self, force: bool) -> Result<()> {
        let _lock = self.lock()?;
        self.db.transaction(|| {
            if force {
                for resource in self.resources.values() {
                    warn!(resource = %resource.name(), "Forgetting resource without destroying it");
                    self.db.delete_resource(resource.handle().id())?;
                }
            }
            self.db.delete_deployment(&self.uuid)
        })?;
        info!(deployment = %self.uuid, "Deleted deployment");
        Ok(())
    }
}

/// Next index to hand out.
const NEXT_INDEX: Field<u32> = Field::with_default("next_index", u32::default);

/// Finds a deployment by uuid, name, or unique uuid prefix.
///
/// # Errors
///
/// Returns [`StateError::DeploymentNotFound`] or
/// [`StateError::AmbiguousDeployment`].
pub fn find_deployment(db: &StateDb, query: &str) -> Result<String> {
    let ids = db.deployment_ids();
    if ids.iter().any(|id| id == query) {
        return Ok(query.to_string());
    }

    let named: Vec<&String> = ids
        .iter()
        .filter(|id| {
            Attrs::new(db.clone(), Scope::Deployment((*id).clone()))
                .get(&NAME)
                .ok()
                .flatten()
                .as_deref()
                == Some(query)
        })
        .collect();
    let candidates = if named.is_empty() {
        ids.iter().filter(|id| id.starts_with(query)).collect()
    } else {
        named
    };

    match candidates.as_slice() {
        [only] => Ok((*only).clone()),
        [] => Err(StateError::DeploymentNotFound {
            id: query.to_string(),
        }
        .into()),
        _ => Err(StateError::AmbiguousDeployment {
            id: query.to_string(),
        }
        .into()),
    }
}

/// Summaries of every deployment.
#[must_use]
pub fn list_deployments(db: &StateDb) -> Vec<DeploymentSummary> {
    db.deployment_ids()
        .into_iter()
        .map(|uuid| {
            let attrs = Attrs::new(db.clone(), Scope::Deployment(uuid.clone()));
            let created_at = db.read(|tables| tables.deployments.get(&uuid).map(|d| d.created_at));
            DeploymentSummary {
                name: attrs.get(&NAME).ok().flatten(),
                description: attrs.get(&DESCRIPTION).ok().flatten(),
                spec_path: attrs.get(&SPEC_PATH).ok().flatten(),
                resources: db.resources(&uuid).len(),
                created_at,
                uuid,
            }
        })
        .collect()
}
