//! Check, start and stop.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::resource::{CheckResult, Resource};
use crate::scheduler::{UNBOUNDED, run_tasks};

use super::{Deployment, Filter};

/// Outcome of checking one resource.
#[derive(Debug)]
pub struct CheckReport {
    /// Resource name.
    pub name: String,
    /// What the check found, or why it could not tell.
    pub outcome: Result<CheckResult>,
}

impl CheckReport {
    /// Whether the check found drift or failed.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        self.outcome.as_ref().map_or(true, |r| !r.drift.is_empty())
    }
}

impl Deployment {
    /// Reconciles every selected resource with its provider. A failed
    /// check is reported, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if the checks could not be scheduled.
    pub async fn check(&self, filter: &Filter) -> Result<Vec<CheckReport>> {
        let tasks: Vec<(String, Arc<dyn Resource>)> = self
            .resources
            .values()
            .filter(|r| filter.matches(r.name()))
            .map(|r| (r.name().to_string(), Arc::clone(r)))
            .collect();
        run_tasks(UNBOUNDED, tasks, |resource| async move {
            let outcome = resource.check().await;
            match &outcome {
                Ok(result) if !result.drift.is_empty() => {
                    warn!(resource = %resource.name(), "drift: {}", result.drift.join(", "));
                }
                Ok(_) => {}
                Err(err) => warn!(resource = %resource.name(), "check failed: {err}"),
            }
            Ok(CheckReport {
                name: resource.name().to_string(),
                outcome,
            })
        })
        .await
    }

    /// Starts the selected machines.
    ///
    /// # Errors
    ///
    /// Returns the failure, or an aggregate of every failed machine.
    pub async fn start(&self, filter: &Filter) -> Result<()> {
        let _lock = self.lock()?;
        let tasks = self.machine_tasks(filter);
        info!(deployment = %self.uuid, "Starting {} machine(s)", tasks.len());
        run_tasks(UNBOUNDED, tasks, |resource| async move { resource.start().await }).await?;
        Ok(())
    }

    /// Stops the selected machines.
    ///
    /// # Errors
    ///
    /// Returns the failure, or an aggregate of every failed machine.
    pub async fn stop(&self, filter: &Filter) -> Result<()> {
        let _lock = self.lock()?;
        let tasks = self.machine_tasks(filter);
        info!(deployment = %self.uuid, "Stopping {} machine(s)", tasks.len());
        run_tasks(UNBOUNDED, tasks, |resource| async move { resource.stop().await }).await?;
        Ok(())
    }

    fn machine_tasks(&self, filter: &Filter) -> Vec<(String, Arc<dyn Resource>)> {
        self.active_machines(filter)
            .into_iter()
            .map(|r| (r.name().to_string(), r))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::Builder;
    use crate::config::DefinitionCompiler;
    use crate::engine::DeployOptions;
    use crate::provider::{KIND_VM, ObjectStatus};
    use crate::remote::CommandOutput;
    use crate::resource::{Definition, ResourceState};
    use crate::testing::{FakeBuilder, FakeCompiler, TestBed};
    use serde_json::json;

    fn vm(name: &str) -> Definition {
        Definition::new(name, "vm")
            .with_attr("region", json!("eu-1"))
            .with_attr("instance_type", json!("small"))
            .with_attr("image", json!("base-24"))
    }

    async fn deployed(bed: &TestBed, definitions: Vec<Definition>) -> Deployment {
        let compiler: Arc<dyn DefinitionCompiler> = Arc::new(FakeCompiler::new(definitions));
        let builder: Arc<dyn Builder> = Arc::new(FakeBuilder::default());
        let mut deployment = bed.deployment(compiler, Some(builder));
        deployment
            .deploy(&DeployOptions::default())
            .await
            .expect("deploy");
        deployment
    }

    #[tokio::test]
    async fn test_stop_then_start() {
        let bed = TestBed::new();
        let deployment = deployed(&bed, vec![vm("a"), vm("b")]).await;

        deployment.stop(&Filter::default()).await.expect("stop");
        for name in ["a", "b"] {
            let resource = deployment.resource(name).expect("resource");
            assert_eq!(resource.handle().state(), ResourceState::Stopped);
        }

        deployment
            .start(&Filter::new(vec![String::from("a")], Vec::new()))
            .await
            .expect("start a");
        let a = deployment.resource("a").expect("a");
        let b = deployment.resource("b").expect("b");
        assert_eq!(a.handle().state(), ResourceState::Up);
        assert_eq!(b.handle().state(), ResourceState::Stopped);
    }

    #[tokio::test]
    async fn test_check_reports_drift_per_resource() {
        let bed = TestBed::new();
        let deployment = deployed(&bed, vec![vm("a"), vm("b")]).await;
        let id = deployment
            .resource("a")
            .expect("a")
            .handle()
            .provider_id()
            .expect("created");
        bed.cloud.set_status(KIND_VM, &id, ObjectStatus::Stopped);

        let reports = tokio_test::assert_ok!(deployment.check(&Filter::default()).await);

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].name, "a");
        assert!(reports[0].needs_attention());
        assert!(!reports[1].needs_attention());
        let result = reports[0].outcome.as_ref().expect("checked");
        assert_eq!(result.state, ResourceState::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_reported_not_fatal() {
        let bed = TestBed::new();
        let deployment = deployed(
            &bed,
            vec![Definition::new("h", "none").with_attr("host", json!("192.0.2.9"))],
        )
        .await;
        bed.remote.set_command_result(CommandOutput {
            exit_code: 255,
            stdout: String::new(),
            stderr: String::from("unreachable"),
        });

        let reports = deployment.check(&Filter::default()).await.expect("check");

        assert_eq!(reports.len(), 1);
        let result = reports[0].outcome.as_ref().expect("checked");
        assert_eq!(result.state, ResourceState::Unknown);
        assert!(reports[0].needs_attention());
    }
}
