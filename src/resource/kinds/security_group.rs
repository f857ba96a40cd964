//! Security groups.
//!
//! A rule's `source` is either a CIDR block or the name of a machine of the
//! same deployment, which resolves to that machine's public address and makes
//! the group depend on it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::DefinitionHasher;
use crate::error::{EngineError, Result};
use crate::provider::KIND_SECURITY_GROUP;
use crate::state::Field;

use super::super::{
    CheckResult, CreateContext, Definition, Resource, ResourceContext, ResourceHandle,
    ResourceState,
};
use super::object::ObjectOps;

const REGION: Field<Option<String>> = Field::optional("region");
const RULES: Field<Vec<Rule>> = Field::with_default("rules", Vec::new);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SecurityGroupSettings {
    region: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    rules: Vec<RuleSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RuleSettings {
    #[serde(default = "default_protocol")]
    protocol: String,
    from_port: u16,
    #[serde(default)]
    to_port: Option<u16>,
    source: String,
}

fn default_protocol() -> String {
    String::from("tcp")
}

impl RuleSettings {
    fn source_machine(&self) -> Option<&str> {
        (!self.source.contains('/')).then_some(self.source.as_str())
    }
}

/// A rule with its source resolved to a CIDR block.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Rule {
    protocol: String,
    from_port: u16,
    to_port: u16,
    cidr: String,
}

/// A provider-side firewall attached to machines.
pub struct SecurityGroupResource {
    ctx: ResourceContext,
}

impl SecurityGroupResource {
    /// Creates the resource.
    #[must_use]
    pub const fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }

    fn ops(&self) -> ObjectOps<'_> {
        ObjectOps::new(&self.ctx, KIND_SECURITY_GROUP)
    }

    fn resolve(settings: &SecurityGroupSettings, ctx: &CreateContext) -> Result<Vec<Rule>> {
        let mut rules = settings
            .rules
            .iter()
            .map(|rule| {
                let cidr = match rule.source_machine() {
                    None => rule.source.clone(),
                    Some(name) => {
                        let address = ctx
                            .peer(name)?
                            .as_machine()
                            .and_then(|machine| machine.public_address())
                            .ok_or_else(|| EngineError::Unreachable {
                                machine: name.to_string(),
                            })?;
                        format!("{address}/32")
                    }
                };
                Ok(Rule {
                    protocol: rule.protocol.clone(),
                    from_port: rule.from_port,
                    to_port: rule.to_port.unwrap_or(rule.from_port),
                    cidr,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        rules.sort();
        rules.dedup();
        Ok(rules)
    }
}

#[async_trait]
impl Resource for SecurityGroupResource {
    fn handle(&self) -> &ResourceHandle {
        &self.ctx.handle
    }

    fn implicit_dependencies(&self, defn: &Definition) -> Vec<String> {
        defn.parse::<SecurityGroupSettings>()
            .map(|settings| {
                settings
                    .rules
                    .iter()
                    .filter_map(RuleSettings::source_machine)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn create(&self, defn: &Definition, ctx: &CreateContext) -> Result<()> {
        let settings: SecurityGroupSettings = defn.parse()?;
        let hash = DefinitionHasher::new().hash_definition(defn);
        let ops = self.ops();
        let attrs = self.ctx.handle.attrs();

        if let Some(object) = ops.recover(&[(&REGION, "region")]).await? {
            if let Some(recorded) = object.attrs.get("rules") {
                let mut recorded: Vec<Rule> =
                    serde_json::from_value(recorded.clone()).unwrap_or_default();
                recorded.sort();
                attrs.set(&RULES, &recorded)?;
            }
        }
        ops.ensure_immutable(&REGION, &settings.region)?;
        ops.refresh(&ctx.options).await?;
        let rules = Self::resolve(&settings, ctx)?;
        // Machine addresses can change without the definition changing.
        if ops.is_converged(&hash) && attrs.get(&RULES)? == rules {
            debug!(resource = %self.name(), "up to date");
            return Ok(());
        }

        let spec = json!({
            "name": format!("{}-{}", self.ctx.handle.deployment(), self.name()),
            "region": settings.region,
            "description": settings.description,
            "rules": rules,
        });
        let (id, created) = ops
            .ensure_created(&spec, || {
                attrs.set(&REGION, &Some(settings.region.clone()))?;
                attrs.set(&RULES, &rules)
            })
            .await?;
        if !created && attrs.get(&RULES)? != rules {
            info!(resource = %self.name(), "updating {} rules", rules.len());
            ops.modify(&id, &json!({ "rules": rules })).await?;
            attrs.set(&RULES, &rules)?;
        }

        self.ctx.handle.db().transaction(|| {
            self.ctx.handle.set_state(ResourceState::Up)?;
            self.ctx.handle.set_definition_hash(Some(&hash))
        })
    }

    async fn destroy(&self, _wipe: bool) -> Result<bool> {
        self.ops().delete().await?;
        self.ops().forget()?;
        self.ctx.handle.attrs().set(&RULES, &Vec::new())?;
        Ok(true)
    }

    async fn check(&self) -> Result<CheckResult> {
        let (mut result, object) = self.ops().check().await?;
        if let Some(rules) = object.as_ref().and_then(|o| o.attrs.get("rules")) {
            let mut observed: Vec<Rule> = serde_json::from_value(rules.clone()).unwrap_or_default();
            observed.sort();
            if observed != self.ctx.handle.attrs().get(&RULES)? {
                warn!(resource = %self.name(), "rules were changed out-of-band");
                result.drift.push(String::from("rules changed"));
                // Forces the next deploy to push the declared rules again.
                self.ctx.handle.set_definition_hash(None)?;
                self.ctx.handle.attrs().set(&RULES, &observed)?;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::CreateOptions;
    use crate::testing::TestBed;

    fn group(rules: serde_json::Value) -> Definition {
        Definition::new("web-sg", "security-group")
            .with_attr("region", json!("eu-1"))
            .with_attr("rules", rules)
    }

    #[test]
    fn test_machine_sources_are_dependencies() {
        let bed = TestBed::new();
        let sg = bed.resource("web-sg", "security-group");
        let defn = group(json!([
            { "from_port": 22, "source": "0.0.0.0/0" },
            { "from_port": 5432, "source": "db" },
        ]));
        assert_eq!(sg.implicit_dependencies(&defn), vec!["db"]);
    }

    #[tokio::test]
    async fn test_rule_change_is_modified_in_place() {
        let bed = TestBed::new();
        let sg = bed.resource("web-sg", "security-group");
        let ctx = bed.create_context(CreateOptions::default());

        sg.create(&group(json!([{ "from_port": 22, "source": "0.0.0.0/0" }])), &ctx)
            .await
            .expect("create");
        let id = sg.handle().provider_id().expect("id");

        sg.create(
            &group(json!([{ "from_port": 443, "source": "10.0.0.0/8" }])),
            &ctx,
        )
        .await
        .expect("update");

        assert_eq!(sg.handle().provider_id(), Some(id.clone()));
        let rules = bed
            .cloud
            .attr(KIND_SECURITY_GROUP, &id, "rules")
            .expect("rules");
        assert_eq!(rules[0]["from_port"], json!(443));
        assert_eq!(rules[0]["cidr"], json!("10.0.0.0/8"));
    }

    #[tokio::test]
    async fn test_id_without_settings_is_recovered_from_provider() {
        let bed = TestBed::new();
        let sg = bed.resource("web-sg", "security-group");
        let spec = json!({
            "name": "web-sg",
            "region": "eu-1",
            "rules": [{ "protocol": "tcp", "from_port": 22, "to_port": 22, "cidr": "0.0.0.0/0" }],
        });
        let object = bed
            .cloud
            .create_direct(KIND_SECURITY_GROUP, &spec, "earlier-run")
            .expect("object");
        sg.handle().set_provider_id(Some(&object.id)).expect("seed id");
        let ctx = bed.create_context(CreateOptions::default());

        sg.create(&group(json!([{ "from_port": 22, "source": "0.0.0.0/0" }])), &ctx)
            .await
            .expect("recover");
        assert_eq!(bed.cloud.mutations(), 0);
        assert!(sg.handle().definition_hash().is_some());

        let moved = group(json!([])).with_attr("region", json!("us-2"));
        let err = sg.create(&moved, &ctx).await.expect_err("immutable");
        assert!(matches!(
            err,
            crate::error::DeployError::Provider(
                crate::error::ProviderError::PreconditionViolation { .. }
            )
        ));
    }

    #[tokio::test]
    async fn test_machine_source_resolves_to_address() {
        let bed = TestBed::new();
        let db = bed.resource("db", "none");
        let sg = bed.resource("web-sg", "security-group");
        let ctx = bed.create_context(CreateOptions::default());

        db.create(
            &Definition::new("db", "none").with_attr("host", json!("192.0.2.7")),
            &ctx,
        )
        .await
        .expect("host");
        sg.create(&group(json!([{ "from_port": 5432, "source": "db" }])), &ctx)
            .await
            .expect("create");

        let id = sg.handle().provider_id().expect("id");
        let rules = bed
            .cloud
            .attr(KIND_SECURITY_GROUP, &id, "rules")
            .expect("rules");
        assert_eq!(rules[0]["cidr"], json!("192.0.2.7/32"));
    }
}
