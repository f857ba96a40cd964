//! In-process fakes for the provider, remote and build collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::build::{BuildOutput, Builder, MachineArtifact};
use crate::config::{DefinitionCompiler, Settings};
use crate::confirm::{Confirm, TerminalConfirm};
use crate::engine::{Collaborators, Deployment};
use crate::error::{ProviderError, Result};
use crate::provider::{
    DEFAULT_PROVIDER, KIND_VM, ObjectStatus, ProviderApi, ProviderObject, Providers,
};
use crate::remote::{CommandOutput, RemoteExecutor, SshTarget};
use crate::resource::{
    CreateContext, CreateOptions, Definition, Resource, ResourceContext, ResourceHandle,
    ResourceRegistry, SshDefaults,
};
use crate::state::{ResourceRow, StateDb};

#[derive(Default)]
struct CloudState {
    objects: BTreeMap<(String, String), ProviderObject>,
    tokens: BTreeMap<(String, String), String>,
    next_id: u64,
    mutations: u64,
    ignore_clean_stops: bool,
    forced_stops: u64,
    failing_kinds: BTreeSet<String>,
    log: Vec<String>,
}

/// In-memory provider counting every mutating call.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of create, modify, delete and action calls so far.
    pub fn mutations(&self) -> u64 {
        self.state.lock().mutations
    }

    /// Objects of `kind` that currently exist.
    pub fn count(&self, kind: &str) -> usize {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(k, _)| k == kind)
            .count()
    }

    /// Mutating calls in order, as `"<call> <kind>"`.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Creates an object as a previous process would have, bypassing the
    /// mutation count.
    pub fn create_direct(&self, kind: &str, spec: &Value, token: &str) -> Result<ProviderObject> {
        Ok(self.state.lock().create(kind, spec, token))
    }

    pub fn attr(&self, kind: &str, id: &str, key: &str) -> Option<Value> {
        self.state
            .lock()
            .objects
            .get(&(kind.to_string(), id.to_string()))
            .and_then(|o| o.attrs.get(key).cloned())
    }

    pub fn status(&self, kind: &str, id: &str) -> Option<ObjectStatus> {
        self.state
            .lock()
            .objects
            .get(&(kind.to_string(), id.to_string()))
            .map(|o| o.status)
    }

    pub fn set_status(&self, kind: &str, id: &str, status: ObjectStatus) {
        if let Some(object) = self
            .state
            .lock()
            .objects
            .get_mut(&(kind.to_string(), id.to_string()))
        {
            object.status = status;
        }
    }

    /// Deletes an object out-of-band.
    pub fn remove(&self, kind: &str, id: &str) {
        self.state
            .lock()
            .objects
            .remove(&(kind.to_string(), id.to_string()));
    }

    /// Makes VMs ignore stop requests that are not forced.
    pub fn ignore_clean_stops(&self) {
        self.state.lock().ignore_clean_stops = true;
    }

    pub fn forced_stops(&self) -> u64 {
        self.state.lock().forced_stops
    }

    /// Makes every create of `kind` fail.
    pub fn fail_creates(&self, kind: &str) {
        self.state.lock().failing_kinds.insert(kind.to_string());
    }

    fn missing(kind: &str, id: &str) -> ProviderError {
        ProviderError::disappeared(kind, id)
    }
}

impl CloudState {
    fn create(&mut self, kind: &str, spec: &Value, token: &str) -> ProviderObject {
        let key = (kind.to_string(), token.to_string());
        if let Some(id) = self.tokens.get(&key) {
            if let Some(object) = self.objects.get(&(kind.to_string(), id.clone())) {
                return object.clone();
            }
        }

        self.next_id += 1;
        let n = self.next_id;
        let id = format!("{kind}-{n}");
        let status = if kind == KIND_VM {
            ObjectStatus::Running
        } else {
            ObjectStatus::Available
        };
        let mut object = ProviderObject::new(&id, status);
        if let Value::Object(fields) = spec {
            object
                .attrs
                .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if kind == KIND_VM {
            object
                .attrs
                .insert(String::from("public_ip"), json!(format!("198.51.100.{n}")));
            object
                .attrs
                .insert(String::from("private_ip"), json!(format!("10.0.0.{n}")));
        }
        object
            .attrs
            .insert(String::from("fingerprint"), json!(format!("fp-{n}")));
        self.tokens.insert(key, id.clone());
        self.objects.insert((kind.to_string(), id), object.clone());
        object
    }

    fn record(&mut self, call: &str, kind: &str) {
        self.mutations += 1;
        self.log.push(format!("{call} {kind}"));
    }
}

#[async_trait]
impl ProviderApi for FakeCloud {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, kind: &str, spec: &Value, client_token: &str) -> Result<ProviderObject> {
        let mut state = self.state.lock();
        state.record("create", kind);
        if state.failing_kinds.contains(kind) {
            return Err(ProviderError::Api {
                status: 400,
                code: String::from("InvalidParameter"),
                message: format!("refusing to create {kind}"),
            }
            .into());
        }
        Ok(state.create(kind, spec, client_token))
    }

    async fn describe(&self, kind: &str, id: &str) -> Result<Option<ProviderObject>> {
        Ok(self
            .state
            .lock()
            .objects
            .get(&(kind.to_string(), id.to_string()))
            .cloned())
    }

    async fn modify(&self, kind: &str, id: &str, changes: &Value) -> Result<ProviderObject> {
        let mut state = self.state.lock();
        state.record("modify", kind);
        let object = state
            .objects
            .get_mut(&(kind.to_string(), id.to_string()))
            .ok_or_else(|| Self::missing(kind, id))?;
        if let Value::Object(fields) = changes {
            object
                .attrs
                .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(object.clone())
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("delete", kind);
        state
            .objects
            .remove(&(kind.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::missing(kind, id).into())
    }

    async fn action(
        &self,
        kind: &str,
        id: &str,
        action: &str,
        params: &Value,
    ) -> Result<ProviderObject> {
        let mut state = self.state.lock();
        state.record(action, kind);
        let force = params.get("force").and_then(Value::as_bool).unwrap_or(false);
        let ignore_clean_stops = state.ignore_clean_stops;
        if action == "stop" && force {
            state.forced_stops += 1;
        }
        let object = state
            .objects
            .get_mut(&(kind.to_string(), id.to_string()))
            .ok_or_else(|| Self::missing(kind, id))?;
        match action {
            "stop" if force || !ignore_clean_stops => object.status = ObjectStatus::Stopped,
            "start" => object.status = ObjectStatus::Running,
            "attach" | "restore" => object.status = ObjectStatus::InUse,
            "detach" => object.status = ObjectStatus::Available,
            _ => {}
        }
        Ok(object.clone())
    }
}

/// Remote executor that succeeds without touching the network.
pub struct FakeRemote {
    result: Mutex<CommandOutput>,
    commands: Mutex<Vec<(String, String)>>,
    copies: Mutex<Vec<(String, PathBuf)>>,
    reboots: Mutex<Vec<String>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            result: Mutex::new(CommandOutput::default()),
            commands: Mutex::new(Vec::new()),
            copies: Mutex::new(Vec::new()),
            reboots: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRemote {
    /// Output returned by every later `run_command`.
    pub fn set_command_result(&self, output: CommandOutput) {
        *self.result.lock() = output;
    }

    /// Commands run so far as `(machine, command)`.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().clone()
    }

    /// Artifacts copied so far as `(machine, path)`.
    pub fn copies(&self) -> Vec<(String, PathBuf)> {
        self.copies.lock().clone()
    }

    pub fn reboots(&self) -> Vec<String> {
        self.reboots.lock().clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn run_command(&self, target: &SshTarget, command: &str) -> Result<CommandOutput> {
        self.commands
            .lock()
            .push((target.machine.clone(), command.to_string()));
        Ok(self.result.lock().clone())
    }

    async fn copy_closure_to(&self, target: &SshTarget, artifact: &Path) -> Result<String> {
        self.copies
            .lock()
            .push((target.machine.clone(), artifact.to_path_buf()));
        Ok(format!("/remote{}", artifact.display()))
    }

    async fn wait_for_ssh(&self, _target: &SshTarget, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn reboot(&self, target: &SshTarget) -> Result<()> {
        self.reboots.lock().push(target.machine.clone());
        Ok(())
    }
}

/// Builder producing one artifact per machine under `/builds/r<revision>`.
#[derive(Default)]
pub struct FakeBuilder {
    revision: Mutex<u64>,
    reboot_required: Mutex<bool>,
    builds: Mutex<u64>,
    facts: Mutex<Option<Value>>,
}

impl FakeBuilder {
    /// Changes the output of later builds.
    pub fn bump_revision(&self) {
        *self.revision.lock() += 1;
    }

    pub fn require_reboot(&self, required: bool) {
        *self.reboot_required.lock() = required;
    }

    pub fn builds(&self) -> u64 {
        *self.builds.lock()
    }

    /// Facts file contents of the last build.
    pub fn last_facts(&self) -> Option<Value> {
        self.facts.lock().clone()
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    async fn build(&self, machines: &[String], facts_path: &Path) -> Result<BuildOutput> {
        let raw = tokio::fs::read_to_string(facts_path).await?;
        *self.facts.lock() = serde_json::from_str(&raw).ok();
        *self.builds.lock() += 1;

        let path = PathBuf::from(format!("/builds/r{}", *self.revision.lock()));
        let reboot_required = *self.reboot_required.lock();
        let machines = machines
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    MachineArtifact {
                        path: path.join(name),
                        reboot_required,
                    },
                )
            })
            .collect();
        Ok(BuildOutput { path, machines })
    }
}

/// Compiler returning whatever definitions the test set last.
#[derive(Default)]
pub struct FakeCompiler {
    definitions: Mutex<Vec<Definition>>,
}

impl FakeCompiler {
    pub fn new(definitions: Vec<Definition>) -> Self {
        Self {
            definitions: Mutex::new(definitions),
        }
    }

    pub fn set(&self, definitions: Vec<Definition>) {
        *self.definitions.lock() = definitions;
    }
}

impl DefinitionCompiler for FakeCompiler {
    fn compile(&self, _deployment: &str) -> Result<Vec<Definition>> {
        Ok(self.definitions.lock().clone())
    }
}

/// A deployment in memory wired to the fakes, for exercising resource
/// types one by one.
pub struct TestBed {
    pub db: StateDb,
    pub deployment: String,
    pub cloud: Arc<FakeCloud>,
    pub remote: Arc<FakeRemote>,
    pub confirm: Arc<dyn Confirm>,
    pub settings: Arc<Settings>,
    pub registry: ResourceRegistry,
    peers: Mutex<BTreeMap<String, Arc<dyn Resource>>>,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_confirm(true)
    }

    /// A bed whose confirmation prompts always answer `answer`.
    pub fn with_confirm(answer: bool) -> Self {
        let db = StateDb::in_memory();
        let deployment = db
            .create_deployment(None)
            .unwrap_or_else(|e| panic!("in-memory deployment: {e}"));
        Self {
            db,
            deployment,
            cloud: Arc::new(FakeCloud::new()),
            remote: Arc::new(FakeRemote::default()),
            confirm: Arc::new(TerminalConfirm::new(Some(answer))),
            settings: Arc::new(Settings::for_tests()),
            registry: ResourceRegistry::with_builtin_kinds(),
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Providers with the fake cloud as the default one.
    pub fn providers(&self) -> Providers {
        let mut providers = Providers::new();
        let cloud: Arc<dyn ProviderApi> = Arc::clone(&self.cloud) as Arc<dyn ProviderApi>;
        providers.register(DEFAULT_PROVIDER, cloud);
        providers
    }

    /// Adds a resource record and instantiates it.
    pub fn resource(&self, name: &str, type_tag: &str) -> Arc<dyn Resource> {
        let id = self
            .db
            .insert_resource(&self.deployment, name, type_tag)
            .unwrap_or_else(|e| panic!("insert {name}: {e}"));
        let row = ResourceRow {
            deployment: self.deployment.clone(),
            name: name.to_string(),
            type_tag: type_tag.to_string(),
        };
        let ctx = ResourceContext {
            handle: ResourceHandle::new(self.db.clone(), id, &row),
            providers: self.providers(),
            remote: Arc::clone(&self.remote) as Arc<dyn RemoteExecutor>,
            confirm: Arc::clone(&self.confirm),
            settings: Arc::clone(&self.settings),
            ssh: SshDefaults::default(),
        };
        let resource = self
            .registry
            .instantiate(ctx)
            .unwrap_or_else(|e| panic!("instantiate {name}: {e}"));
        self.peers
            .lock()
            .insert(name.to_string(), Arc::clone(&resource));
        resource
    }

    /// Engine collaborators backed by the fakes.
    pub fn collaborators(
        &self,
        compiler: Arc<dyn DefinitionCompiler>,
        builder: Option<Arc<dyn Builder>>,
    ) -> Collaborators {
        Collaborators {
            registry: self.registry.clone(),
            providers: self.providers(),
            compiler,
            builder,
            remote: Arc::clone(&self.remote) as Arc<dyn RemoteExecutor>,
            confirm: Arc::clone(&self.confirm),
            settings: Arc::clone(&self.settings),
            ssh: SshDefaults::default(),
            state_dir: None,
        }
    }

    /// Opens the bed's deployment in the engine.
    pub fn deployment(
        &self,
        compiler: Arc<dyn DefinitionCompiler>,
        builder: Option<Arc<dyn Builder>>,
    ) -> Deployment {
        Deployment::open(
            self.db.clone(),
            &self.deployment,
            self.collaborators(compiler, builder),
        )
        .unwrap_or_else(|e| panic!("open deployment: {e}"))
    }

    /// Create context seeing every resource added so far.
    pub fn create_context(&self, options: CreateOptions) -> CreateContext {
        CreateContext {
            options,
            peers: Arc::new(self.peers.lock().clone()),
        }
    }
}
