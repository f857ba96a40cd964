//! Pre-existing hosts reached over SSH, with nothing to create on a provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::state::Field;

use super::super::{
    CheckResult, CreateContext, Definition, Machine, Resource, ResourceContext, ResourceHandle,
    ResourceState, SshDefaults,
};

const HOST: Field<Option<String>> = Field::optional("host");
const PRIVATE_HOST: Field<Option<String>> = Field::optional("private_host");
const SSH_USER: Field<Option<String>> = Field::optional("ssh_user");
const SSH_PORT: Field<Option<u16>> = Field::optional("ssh_port");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NoneSettings {
    host: String,
    #[serde(default)]
    private_host: Option<String>,
    #[serde(default)]
    ssh_user: Option<String>,
    #[serde(default)]
    ssh_port: Option<u16>,
}

/// A machine managed elsewhere; only its address is recorded.
pub struct NoneMachine {
    ctx: ResourceContext,
}

impl NoneMachine {
    /// Creates the resource.
    #[must_use]
    pub const fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Resource for NoneMachine {
    fn handle(&self) -> &ResourceHandle {
        &self.ctx.handle
    }

    fn as_machine(&self) -> Option<&dyn Machine> {
        Some(self)
    }

    async fn create(&self, defn: &Definition, _ctx: &CreateContext) -> Result<()> {
        let settings: NoneSettings = defn.parse()?;
        let attrs = self.ctx.handle.attrs();
        self.ctx.handle.db().transaction(|| {
            let previous = attrs.get(&HOST)?;
            if previous.as_ref().is_some_and(|host| *host != settings.host) {
                warn!(resource = %self.name(), "host changed to {}", settings.host);
            }
            attrs.set(&HOST, &Some(settings.host.clone()))?;
            attrs.set(&PRIVATE_HOST, &settings.private_host)?;
            attrs.set(&SSH_USER, &settings.ssh_user)?;
            attrs.set(&SSH_PORT, &settings.ssh_port)?;
            self.ctx.handle.set_state(ResourceState::Up)
        })
    }

    async fn destroy(&self, _wipe: bool) -> Result<bool> {
        debug!(resource = %self.name(), "nothing to destroy for an unmanaged host");
        Ok(true)
    }

    async fn check(&self) -> Result<CheckResult> {
        let before = self.ctx.handle.state();
        let state = match self.ssh_target() {
            Ok(target) => match self.ctx.remote.run_command(&target, "true").await {
                Ok(output) if output.success() => ResourceState::Up,
                _ => ResourceState::Unknown,
            },
            Err(_) => ResourceState::Missing,
        };

        let mut drift = Vec::new();
        if state != before {
            warn!(resource = %self.name(), "state changed from {before} to {state}");
            drift.push(format!("state {before} -> {state}"));
            self.ctx.handle.set_state(state)?;
        }
        Ok(CheckResult {
            exists: None,
            state,
            drift,
        })
    }

    fn facts(&self) -> Value {
        let handle = self.handle();
        serde_json::json!({
            "type": handle.type_tag(),
            "index": handle.index(),
        })
    }
}

impl Machine for NoneMachine {
    fn public_address(&self) -> Option<String> {
        self.ctx.handle.attrs().get(&HOST).ok().flatten()
    }

    fn private_address(&self) -> Option<String> {
        self.ctx.handle.attrs().get(&PRIVATE_HOST).ok().flatten()
    }

    fn ssh_login(&self) -> SshDefaults {
        let attrs = self.ctx.handle.attrs();
        SshDefaults {
            user: attrs
                .get(&SSH_USER)
                .ok()
                .flatten()
                .unwrap_or_else(|| self.ctx.ssh.user.clone()),
            port: attrs.get(&SSH_PORT).ok().flatten().unwrap_or(self.ctx.ssh.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CommandOutput;
    use crate::resource::{CreateOptions, machine_facts};
    use crate::testing::TestBed;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_records_login() {
        let bed = TestBed::new();
        let host = bed.resource("db", "none");
        let defn = Definition::new("db", "none")
            .with_attr("host", json!("192.0.2.10"))
            .with_attr("ssh_port", json!(2222));

        host.create(&defn, &bed.create_context(CreateOptions::default()))
            .await
            .expect("create");

        let machine = host.as_machine().expect("machine");
        let target = machine.ssh_target().expect("reachable");
        assert_eq!(target.host, "192.0.2.10");
        assert_eq!(target.port, 2222);
        assert_eq!(target.user, "root");
        assert_eq!(host.handle().state(), ResourceState::Up);
        assert_eq!(machine_facts(machine)["public_address"], json!("192.0.2.10"));
    }

    #[tokio::test]
    async fn test_check_runs_over_ssh() {
        let bed = TestBed::new();
        let host = bed.resource("db", "none");
        host.create(
            &Definition::new("db", "none").with_attr("host", json!("192.0.2.10")),
            &bed.create_context(CreateOptions::default()),
        )
        .await
        .expect("create");

        bed.remote.set_command_result(CommandOutput {
            exit_code: 255,
            stdout: String::new(),
            stderr: String::from("connection refused"),
        });
        let result = host.check().await.expect("check");
        assert_eq!(result.state, ResourceState::Unknown);
        assert_eq!(result.drift.len(), 1);
    }
}
