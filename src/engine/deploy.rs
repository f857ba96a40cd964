//! The deploy workflow: create, build, copy, activate, clean up.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::build::{BuildOutput, MachineArtifact};
use crate::error::{DeployError, EngineError, Result};
use crate::remote::RemoteExecutor;
use crate::resource::{
    CreateContext, CreateOptions, Definition, Resource, ResourceState, machine_facts,
};
use crate::scheduler::{DependencyGraph, UNBOUNDED, run_tasks};

use super::{Deployment, Filter};

/// What `deploy` should do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOptions {
    /// Resources to act on.
    pub filter: Filter,
    /// Flags handed to every `create`.
    pub create: CreateOptions,
    /// Stop after the build.
    pub build_only: bool,
    /// Stop after creating resources.
    pub create_only: bool,
    /// Stop after copying artifacts.
    pub copy_only: bool,
    /// Evaluate and report, creating nothing.
    pub dry_run: bool,
    /// Destroy obsolete resources first.
    pub kill_obsolete: bool,
    /// Copy concurrency; the setting's default when unset.
    pub max_concurrent_copy: Option<usize>,
}

/// A machine about to receive an artifact.
pub(super) struct Staged {
    resource: Arc<dyn Resource>,
    artifact: MachineArtifact,
    remote_path: Option<String>,
}

impl Deployment {
    /// Converges the deployment to its definitions.
    ///
    /// # Errors
    ///
    /// Returns the first phase failure: a single error unchanged, or an
    /// aggregate naming every failed resource.
    pub async fn deploy(&mut self, options: &DeployOptions) -> Result<()> {
        let _lock = self.lock()?;
        info!(deployment = %self.uuid, "Deploying");

        self.evaluate_active(&options.filter, options.kill_obsolete)
            .await?;

        if options.dry_run {
            self.log_plan(&options.filter);
            return Ok(());
        }

        if !options.build_only {
            self.assign_indices()?;
            self.create_resources(options.create, &options.filter)
                .await?;
        }
        if options.create_only {
            return Ok(());
        }

        let Some(build) = self.build().await? else {
            return self.after_activation(&options.filter).await;
        };
        if options.build_only {
            info!(deployment = %self.uuid, "Build output: {}", build.path.display());
            return Ok(());
        }

        let concurrency = options
            .max_concurrent_copy
            .unwrap_or(self.env.settings.max_concurrent_copy);
        let staged = self
            .copy_artifacts(&build, &options.filter, concurrency, false)
            .await?;
        if options.copy_only {
            return Ok(());
        }

        self.activate(staged, options.create).await?;
        self.after_activation(&options.filter).await?;
        self.record_generation(&build)?;
        info!(deployment = %self.uuid, "Deployment finished");
        Ok(())
    }

    fn log_plan(&self, filter: &Filter) {
        for resource in self.active().filter(|r| filter.matches(r.name())) {
            if resource.handle().provider_id().is_none()
                && resource.handle().state() != ResourceState::Up
            {
                info!(resource = %resource.name(), "would create {}", resource.handle().type_tag());
            }
        }
        for resource in self.resources.values().filter(|r| r.handle().obsolete()) {
            info!(resource = %resource.name(), "obsolete");
        }
    }

    /// Creates every active resource in dependency order. A failed resource
    /// is reported and its transitive dependents are skipped; unrelated
    /// resources still run.
    ///
    /// # Errors
    ///
    /// Returns the failure when exactly one resource failed and nothing was
    /// skipped. Otherwise returns an aggregate naming every failed or skipped
    /// resource. A single root failure with dependents therefore surfaces as
    /// an aggregate: the root error plus one `DependencyFailed` per skipped
    /// dependent.
    pub async fn create_resources(&self, options: CreateOptions, filter: &Filter) -> Result<()> {
        let all: Vec<Arc<dyn Resource>> = self.resources.values().cloned().collect();
        let mut graph = DependencyGraph::new();
        let mut work = BTreeMap::new();

        self.db.transaction(|| {
            for resource in self.active() {
                let name = resource.name().to_string();
                let defn = self
                    .definitions
                    .get(&name)
                    .ok_or_else(|| EngineError::MissingDefinition { name: name.clone() })?;
                let after = resource.create_after(&all, defn);
                if filter.matches(&name) {
                    let depends_on: Vec<String> = after.iter().cloned().collect();
                    resource.handle().set_depends_on(&depends_on)?;
                }
                graph.add_node(name.clone(), after);
                work.insert(name, (Arc::clone(resource), defn.clone()));
            }
            Ok(())
        })?;

        let ctx = CreateContext {
            options,
            peers: Arc::new(self.resources.clone()),
        };
        let work = Arc::new(work);
        let filter = filter.clone();
        let report = graph
            .run(move |name| {
                let work = Arc::clone(&work);
                let ctx = ctx.clone();
                let selected = filter.matches(&name);
                async move {
                    match work.get(&name) {
                        Some((resource, defn)) if selected => resource.create(defn, &ctx).await,
                        _ => Ok(()),
                    }
                }
            })
            .await?;

        for name in report.skipped() {
            warn!(resource = %name, "Skipped because a dependency failed");
        }
        report.into_result()
    }

    /// Writes the machine facts and runs the build. Returns `None` when
    /// there is nothing to build.
    async fn build(&self) -> Result<Option<BuildOutput>> {
        let machines = self.active_machines(&Filter::default());
        if machines.is_empty() {
            debug!(deployment = %self.uuid, "No machines to build for");
            return Ok(None);
        }
        let Some(builder) = &self.env.builder else {
            warn!(deployment = %self.uuid, "No build command configured; skipping activation");
            return Ok(None);
        };

        let facts: serde_json::Map<String, Value> = machines
            .iter()
            .filter_map(|r| {
                r.as_machine()
                    .map(|m| (r.name().to_string(), machine_facts(m)))
            })
            .collect();
        let facts_path = self.facts_path();
        if let Some(parent) = facts_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encoded = serde_json::to_vec_pretty(&Value::Object(facts))
            .map_err(|e| DeployError::internal(format!("encoding machine facts: {e}")))?;
        tokio::fs::write(&facts_path, encoded).await?;

        let names: Vec<String> = machines.iter().map(|r| r.name().to_string()).collect();
        info!(deployment = %self.uuid, "Building {} machine(s)", names.len());
        let output = builder.build(&names, &facts_path).await?;
        for name in &names {
            if !output.machines.contains_key(name) {
                return Err(EngineError::MissingArtifact {
                    machine: name.clone(),
                    path: output.path.display().to_string(),
                }
                .into());
            }
        }
        Ok(Some(output))
    }

    fn facts_path(&self) -> PathBuf {
        self.env
            .state_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("{}.facts.json", self.uuid))
    }

    /// Copies artifacts to the selected machines, at most `concurrency` at
    /// a time. Machines already running their artifact are skipped unless
    /// `force` is set.
    pub(super) async fn copy_artifacts(
        &self,
        build: &BuildOutput,
        filter: &Filter,
        concurrency: usize,
        force: bool,
    ) -> Result<Vec<Staged>> {
        let mut tasks = Vec::new();
        for (name, artifact) in &build.machines {
            let Some(resource) = self.resources.get(name) else {
                warn!(resource = %name, "Build has an artifact for an unknown machine");
                continue;
            };
            if resource.as_machine().is_none() || !filter.matches(name) {
                continue;
            }
            let path = artifact.path.to_string_lossy().to_string();
            if !force && resource.handle().artifact().as_deref() == Some(path.as_str()) {
                debug!(resource = %name, "Already running {path}");
                continue;
            }
            tasks.push((
                name.clone(),
                Staged {
                    resource: Arc::clone(resource),
                    artifact: artifact.clone(),
                    remote_path: None,
                },
            ));
        }
        if tasks.is_empty() {
            info!(deployment = %self.uuid, "Every machine is up to date");
            return Ok(Vec::new());
        }

        let remote = Arc::clone(&self.env.remote);
        let workers = i64::try_from(concurrency).unwrap_or(UNBOUNDED);
        run_tasks(workers, tasks, move |staged| {
            copy_one(Arc::clone(&remote), staged)
        })
        .await
    }

    /// Switches every staged machine to its new artifact.
    pub(super) async fn activate(&self, staged: Vec<Staged>, options: CreateOptions) -> Result<()> {
        if staged.is_empty() {
            return Ok(());
        }
        let remote = Arc::clone(&self.env.remote);
        let ssh_timeout = self.env.settings.duration(self.env.settings.ssh_timeout_secs);
        let tasks = staged
            .into_iter()
            .map(|s| (s.resource.name().to_string(), s))
            .collect();
        run_tasks(UNBOUNDED, tasks, move |staged| {
            activate_one(Arc::clone(&remote), staged, options, ssh_timeout)
        })
        .await?;
        Ok(())
    }

    /// Runs every selected active resource's cleanup for the configuration
    /// that is now live.
    async fn after_activation(&self, filter: &Filter) -> Result<()> {
        let tasks: Vec<(String, (Arc<dyn Resource>, Definition))> = self
            .active()
            .filter(|r| filter.matches(r.name()))
            .filter_map(|r| {
                self.definitions
                    .get(r.name())
                    .map(|defn| (r.name().to_string(), (Arc::clone(r), defn.clone())))
            })
            .collect();
        run_tasks(UNBOUNDED, tasks, |(resource, defn)| async move {
            resource.after_activation(&defn).await
        })
        .await?;
        Ok(())
    }
}

async fn copy_one(remote: Arc<dyn RemoteExecutor>, mut staged: Staged) -> Result<Staged> {
    let name = staged.resource.name().to_string();
    let machine = staged
        .resource
        .as_machine()
        .ok_or_else(|| DeployError::internal(format!("'{name}' is not a machine")))?;
    let target = machine.ssh_target()?;
    info!(resource = %name, "Copying {}", staged.artifact.path.display());
    staged.remote_path = Some(remote.copy_closure_to(&target, &staged.artifact.path).await?);
    Ok(staged)
}

async fn activate_one(
    remote: Arc<dyn RemoteExecutor>,
    staged: Staged,
    options: CreateOptions,
    ssh_timeout: Duration,
) -> Result<()> {
    let name = staged.resource.name().to_string();
    let machine = staged
        .resource
        .as_machine()
        .ok_or_else(|| DeployError::internal(format!("'{name}' is not a machine")))?;
    let target = machine.ssh_target()?;
    let remote_path = staged
        .remote_path
        .ok_or_else(|| DeployError::internal(format!("nothing was copied to '{name}'")))?;

    let reboot = options.force_reboot || (staged.artifact.reboot_required && options.allow_reboot);
    if staged.artifact.reboot_required && !reboot {
        warn!(resource = %name, "New configuration needs a reboot to take full effect (use --allow-reboot)");
    }
    let mode = if reboot { "boot" } else { "switch" };
    let command = format!("{remote_path}/activate {mode}");

    info!(resource = %name, "Activating ({mode})");
    let output = remote.run_command(&target, &command).await?;
    if !output.success() {
        return Err(EngineError::RemoteCommandFailed {
            machine: name,
            command,
            status: output.exit_code,
        }
        .into());
    }

    if reboot {
        info!(resource = %name, "Rebooting");
        remote.reboot(&target).await?;
        if !remote.wait_for_ssh(&target, ssh_timeout).await? {
            return Err(DeployError::timeout(
                format!("'{name}' to come back after reboot"),
                ssh_timeout.as_secs(),
            ));
        }
    }

    let path = staged.artifact.path.to_string_lossy().to_string();
    staged.resource.handle().set_artifact(Some(&path))?;
    info!(resource = %name, "Activated {path}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::MockBuilder;
    use crate::config::DefinitionCompiler;
    use crate::error::StateError;
    use crate::provider::{KIND_KEYPAIR, KIND_VM, KIND_VOLUME};
    use crate::state::DeploymentLock;
    use crate::testing::{FakeBuilder, FakeCompiler, TestBed};
    use serde_json::json;

    fn host(name: &str, ip: &str) -> Definition {
        Definition::new(name, "none").with_attr("host", json!(ip))
    }

    fn network() -> Vec<Definition> {
        vec![
            Definition::new("key", "keypair").with_attr("public_key", json!("ssh-ed25519 AAAA")),
            Definition::new("web", "vm")
                .with_attr("region", json!("eu-1"))
                .with_attr("instance_type", json!("small"))
                .with_attr("image", json!("base-24"))
                .with_attr("keypair", json!("key")),
            Definition::new("data", "volume")
                .with_attr("region", json!("eu-1"))
                .with_attr("size_gb", json!(10)),
        ]
    }

    fn setup(
        definitions: Vec<Definition>,
    ) -> (TestBed, Arc<FakeCompiler>, Arc<FakeBuilder>, Deployment) {
        let bed = TestBed::new();
        let compiler = Arc::new(FakeCompiler::new(definitions));
        let builder = Arc::new(FakeBuilder::default());
        let deployment = bed.deployment(
            Arc::clone(&compiler) as Arc<dyn DefinitionCompiler>,
            Some(Arc::clone(&builder) as Arc<dyn crate::build::Builder>),
        );
        (bed, compiler, builder, deployment)
    }

    #[tokio::test]
    async fn test_dependencies_are_created_first() {
        let (bed, _, _, mut deployment) = setup(network());
        deployment
            .deploy(&DeployOptions::default())
            .await
            .expect("deploy");

        let log = bed.cloud.log();
        let key = log.iter().position(|c| c == "create keypair").expect("key created");
        let vm = log.iter().position(|c| c == "create vm").expect("vm created");
        assert!(key < vm);
        assert_eq!(
            deployment.resource("web").expect("web").handle().depends_on(),
            vec![String::from("key")]
        );
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let (bed, _, _, mut deployment) = setup(network());
        bed.cloud.fail_creates(KIND_KEYPAIR);

        let err = deployment
            .deploy(&DeployOptions::default())
            .await
            .expect_err("key fails");

        let DeployError::Aggregate(aggregate) = &err else {
            panic!("expected an aggregate, got {err}");
        };
        assert_eq!(aggregate.task_names(), vec!["key", "web"]);
        assert!(matches!(
            aggregate.failures[1].1,
            DeployError::Engine(EngineError::DependencyFailed { ref dependency, .. }) if dependency == "key"
        ));
        assert_eq!(bed.cloud.count(KIND_VM), 0);
        assert_eq!(bed.cloud.count(KIND_VOLUME), 1);
    }

    #[tokio::test]
    async fn test_redeploy_is_a_no_op() {
        let (bed, _, builder, mut deployment) = setup(network());
        deployment
            .deploy(&DeployOptions::default())
            .await
            .expect("first deploy");
        let mutations = bed.cloud.mutations();
        assert_eq!(bed.remote.copies().len(), 1);

        deployment
            .deploy(&DeployOptions::default())
            .await
            .expect("second deploy");
        assert_eq!(bed.cloud.mutations(), mutations);
        assert_eq!(bed.remote.copies().len(), 1);
        assert_eq!(builder.builds(), 2);
        assert_eq!(deployment.generations().expect("generations").len(), 1);
    }

    #[tokio::test]
    async fn test_changed_build_is_copied_and_activated() {
        let (bed, _, builder, mut deployment) =
            setup(vec![host("a", "192.0.2.1"), host("b", "192.0.2.2")]);
        deployment
            .deploy(&DeployOptions::default())
            .await
            .expect("deploy");
        builder.bump_revision();
        deployment
            .deploy(&DeployOptions::default())
            .await
            .expect("redeploy");

        assert_eq!(bed.remote.copies().len(), 4);
        let switches = bed
            .remote
            .commands()
            .iter()
            .filter(|(_, c)| c.ends_with("activate switch"))
            .count();
        assert_eq!(switches, 4);
        assert_eq!(
            deployment.resource("a").expect("a").handle().artifact().as_deref(),
            Some("/builds/r1/a")
        );
        assert_eq!(deployment.generations().expect("generations").len(), 2);
    }

    #[tokio::test]
    async fn test_reboot_only_when_allowed() {
        let (bed, _, builder, mut deployment) = setup(vec![host("a", "192.0.2.1")]);
        builder.require_reboot(true);
        deployment
            .deploy(&DeployOptions::default())
            .await
            .expect("live switch");
        assert!(bed.remote.reboots().is_empty());

        builder.bump_revision();
        let options = DeployOptions {
            create: CreateOptions {
                allow_reboot: true,
                ..CreateOptions::default()
            },
            ..DeployOptions::default()
        };
        deployment.deploy(&options).await.expect("reboot");
        assert_eq!(bed.remote.reboots(), vec![String::from("a")]);
        assert!(
            bed.remote
                .commands()
                .iter()
                .any(|(_, c)| c.ends_with("activate boot"))
        );
    }

    #[tokio::test]
    async fn test_phase_flags_stop_early() {
        let (bed, _, builder, mut deployment) = setup(vec![host("a", "192.0.2.1")]);

        let dry = DeployOptions {
            dry_run: true,
            ..DeployOptions::default()
        };
        deployment.deploy(&dry).await.expect("dry run");
        assert_eq!(builder.builds(), 0);

        let create_only = DeployOptions {
            create_only: true,
            ..DeployOptions::default()
        };
        deployment.deploy(&create_only).await.expect("create only");
        assert_eq!(builder.builds(), 0);

        let build_only = DeployOptions {
            build_only: true,
            ..DeployOptions::default()
        };
        deployment.deploy(&build_only).await.expect("build only");
        assert_eq!(builder.builds(), 1);
        assert!(bed.remote.copies().is_empty());

        let copy_only = DeployOptions {
            copy_only: true,
            ..DeployOptions::default()
        };
        deployment.deploy(&copy_only).await.expect("copy only");
        assert_eq!(bed.remote.copies().len(), 1);
        assert!(bed.remote.commands().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_creates_nothing() {
        let (bed, _, _, mut deployment) = setup(network());
        let dry = DeployOptions {
            dry_run: true,
            ..DeployOptions::default()
        };
        deployment.deploy(&dry).await.expect("dry run");
        assert_eq!(bed.cloud.mutations(), 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_fatal() {
        let bed = TestBed::new();
        let compiler: Arc<dyn DefinitionCompiler> =
            Arc::new(FakeCompiler::new(vec![host("a", "192.0.2.1")]));
        let mut builder = MockBuilder::new();
        builder.expect_build().returning(|_, _| {
            Ok(BuildOutput {
                path: PathBuf::from("/builds/empty"),
                machines: BTreeMap::new(),
            })
        });
        let mut deployment = bed.deployment(compiler, Some(Arc::new(builder)));

        let err = deployment
            .deploy(&DeployOptions::default())
            .await
            .expect_err("no artifact");
        assert!(matches!(
            err,
            DeployError::Engine(EngineError::MissingArtifact { ref machine, .. }) if machine == "a"
        ));
    }

    #[tokio::test]
    async fn test_filter_leaves_other_resources_alone() {
        let (bed, _, _, mut deployment) =
            setup(vec![host("a", "192.0.2.1"), host("b", "192.0.2.2")]);
        let options = DeployOptions {
            filter: Filter::new(vec![String::from("a")], Vec::new()),
            ..DeployOptions::default()
        };
        deployment.deploy(&options).await.expect("deploy a");

        let copied: Vec<String> = bed.remote.copies().into_iter().map(|(m, _)| m).collect();
        assert_eq!(copied, vec![String::from("a")]);
        assert!(deployment.resource("b").expect("b").handle().artifact().is_none());
    }

    #[tokio::test]
    async fn test_facts_describe_machines() {
        let (_, _, builder, mut deployment) = setup(vec![host("a", "192.0.2.1")]);
        deployment
            .deploy(&DeployOptions::default())
            .await
            .expect("deploy");
        let facts = builder.last_facts().expect("facts written");
        assert_eq!(facts["a"]["public_address"], json!("192.0.2.1"));
        assert_eq!(facts["a"]["index"], json!(0));
    }

    #[tokio::test]
    async fn test_deploy_refuses_while_locked() {
        let (bed, _, _, mut deployment) = setup(vec![host("a", "192.0.2.1")]);
        let _held = DeploymentLock::acquire(None, &bed.deployment).expect("lock");

        let err = tokio_test::assert_err!(deployment.deploy(&DeployOptions::default()).await);
        assert!(matches!(err, DeployError::State(StateError::LockedByOther { .. })));
    }
}
