//! DNS records, optionally pointing at a machine of the deployment.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::DefinitionHasher;
use crate::error::{ConfigError, EngineError, Result};
use crate::provider::KIND_DNS_RECORD;
use crate::state::Field;

use super::super::{
    CheckResult, CreateContext, Definition, Resource, ResourceContext, ResourceHandle,
    ResourceState,
};
use super::object::ObjectOps;

const FQDN: Field<Option<String>> = Field::optional("fqdn");
const VALUES: Field<Vec<String>> = Field::with_default("values", Vec::new);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DnsRecordSettings {
    zone: String,
    record_name: String,
    #[serde(default = "default_record_type")]
    record_type: String,
    #[serde(default = "default_ttl")]
    ttl: u32,
    /// Machine whose public address the record points at.
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    values: Vec<String>,
}

fn default_record_type() -> String {
    String::from("A")
}

const fn default_ttl() -> u32 {
    300
}

impl DnsRecordSettings {
    fn fqdn(&self) -> String {
        format!("{}.{}", self.record_name, self.zone.trim_end_matches('.'))
    }
}

/// A record in a hosted zone.
pub struct DnsRecordResource {
    ctx: ResourceContext,
}

impl DnsRecordResource {
    /// Creates the resource.
    #[must_use]
    pub const fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }

    fn ops(&self) -> ObjectOps<'_> {
        ObjectOps::new(&self.ctx, KIND_DNS_RECORD)
    }

    fn resolve(&self, settings: &DnsRecordSettings, ctx: &CreateContext) -> Result<Vec<String>> {
        let mut values = settings.values.clone();
        if let Some(target) = &settings.target {
            let address = ctx
                .peer(target)?
                .as_machine()
                .and_then(|machine| machine.public_address())
                .ok_or_else(|| EngineError::Unreachable {
                    machine: target.clone(),
                })?;
            values.push(address);
        }
        if values.is_empty() {
            return Err(ConfigError::validation(
                "a DNS record needs a target or values",
                format!("resources.{}", self.name()),
            )
            .into());
        }
        values.sort();
        values.dedup();
        Ok(values)
    }
}

#[async_trait]
impl Resource for DnsRecordResource {
    fn handle(&self) -> &ResourceHandle {
        &self.ctx.handle
    }

    fn implicit_dependencies(&self, defn: &Definition) -> Vec<String> {
        defn.parse::<DnsRecordSettings>()
            .ok()
            .and_then(|settings| settings.target)
            .into_iter()
            .collect()
    }

    async fn create(&self, defn: &Definition, ctx: &CreateContext) -> Result<()> {
        let settings: DnsRecordSettings = defn.parse()?;
        let hash = DefinitionHasher::new().hash_definition(defn);
        let ops = self.ops();
        let attrs = self.ctx.handle.attrs();
        let fqdn = settings.fqdn();

        let recovered = ops.recover(&[(&FQDN, "name")]).await?;
        if let Some(recorded) = recovered.as_ref().and_then(|o| o.attrs.get("values")) {
            let mut recorded: Vec<String> =
                serde_json::from_value(recorded.clone()).unwrap_or_default();
            recorded.sort();
            attrs.set(&VALUES, &recorded)?;
        }
        ops.refresh(&ctx.options).await?;
        let values = self.resolve(&settings, ctx)?;
        if ops.is_converged(&hash) && attrs.get(&VALUES)? == values {
            debug!(resource = %self.name(), "up to date");
            return Ok(());
        }

        // A renamed record is a different record.
        if self.ctx.handle.provider_id().is_some()
            && attrs.get(&FQDN)?.as_deref() != Some(fqdn.as_str())
        {
            info!(resource = %self.name(), "record renamed to {fqdn}; replacing it");
            ops.delete().await?;
            ops.forget()?;
        }

        let spec = json!({
            "zone": settings.zone,
            "name": fqdn,
            "type": settings.record_type,
            "ttl": settings.ttl,
            "values": values,
        });
        let (id, created) = ops
            .ensure_created(&spec, || {
                attrs.set(&FQDN, &Some(fqdn.clone()))?;
                attrs.set(&VALUES, &values)
            })
            .await?;
        // A recovered record that already matches needs no upsert.
        let in_sync = recovered.as_ref().is_some_and(|object| {
            object.attr_str("type") == Some(settings.record_type.as_str())
                && object.attr_u64("ttl") == Some(u64::from(settings.ttl))
        }) && attrs.get(&VALUES)? == values;
        if !created && !in_sync {
            info!(resource = %self.name(), "upserting {fqdn} -> {}", values.join(", "));
            ops.modify(
                &id,
                &json!({ "type": settings.record_type, "ttl": settings.ttl, "values": values }),
            )
            .await?;
            attrs.set(&VALUES, &values)?;
        }

        self.ctx.handle.db().transaction(|| {
            self.ctx.handle.set_state(ResourceState::Up)?;
            self.ctx.handle.set_definition_hash(Some(&hash))
        })
    }

    async fn destroy(&self, _wipe: bool) -> Result<bool> {
        self.ops().delete().await?;
        self.ops().forget()?;
        let attrs = self.ctx.handle.attrs();
        attrs.set(&FQDN, &None)?;
        attrs.set(&VALUES, &Vec::new())?;
        Ok(true)
    }

    async fn check(&self) -> Result<CheckResult> {
        let (mut result, object) = self.ops().check().await?;
        if let Some(values) = object.as_ref().and_then(|o| o.attrs.get("values")) {
            let mut observed: Vec<String> = serde_json::from_value(values.clone()).unwrap_or_default();
            observed.sort();
            if observed != self.ctx.handle.attrs().get(&VALUES)? {
                warn!(resource = %self.name(), "record values changed out-of-band");
                result.drift.push(String::from("values changed"));
                self.ctx.handle.set_definition_hash(None)?;
                self.ctx.handle.attrs().set(&VALUES, &observed)?;
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

    fn record(target: &str) -> Definition {
        Definition::new("www", "dns-record")
            .with_attr("zone", json!("example.org."))
            .with_attr("record_name", json!("www"))
            .with_attr("target", json!(target))
    }

    #[tokio::test]
    async fn test_record_follows_machine_address() {
        let bed = TestBed::new();
        let web = bed.resource("web", "none");
        let www = bed.resource("www", "dns-record");
        let ctx = bed.create_context(CreateOptions::default());

        let host = |ip: &str| Definition::new("web", "none").with_attr("host", json!(ip));
        web.create(&host("192.0.2.1"), &ctx).await.expect("host");
        www.create(&record("web"), &ctx).await.expect("record");
        let id = www.handle().provider_id().expect("id");
        assert_eq!(
            bed.cloud.attr(KIND_DNS_RECORD, &id, "name"),
            Some(json!("www.example.org"))
        );

        let mutations = bed.cloud.mutations();
        www.create(&record("web"), &ctx).await.expect("no-op");
        assert_eq!(bed.cloud.mutations(), mutations);

        web.create(&host("192.0.2.2"), &ctx).await.expect("host moved");
        www.create(&record("web"), &ctx).await.expect("upsert");
        assert_eq!(
            bed.cloud.attr(KIND_DNS_RECORD, &id, "values"),
            Some(json!(["192.0.2.2"]))
        );
    }

    #[tokio::test]
    async fn test_id_without_settings_is_recovered_from_provider() {
        let bed = TestBed::new();
        let web = bed.resource("web", "none");
        let www = bed.resource("www", "dns-record");
        let ctx = bed.create_context(CreateOptions::default());
        web.create(
            &Definition::new("web", "none").with_attr("host", json!("192.0.2.1")),
            &ctx,
        )
        .await
        .expect("host");

        let spec = json!({
            "zone": "example.org.",
            "name": "www.example.org",
            "type": "A",
            "ttl": 300,
            "values": ["192.0.2.1"],
        });
        let object = bed
            .cloud
            .create_direct(KIND_DNS_RECORD, &spec, "earlier-run")
            .expect("object");
        www.handle().set_provider_id(Some(&object.id)).expect("seed id");

        www.create(&record("web"), &ctx).await.expect("recover");

        assert_eq!(bed.cloud.mutations(), 0);
        assert_eq!(www.handle().provider_id(), Some(object.id));
        assert!(www.handle().definition_hash().is_some());
    }

    #[tokio::test]
    async fn test_record_without_values_is_rejected() {
        let bed = TestBed::new();
        let www = bed.resource("www", "dns-record");
        let defn = Definition::new("www", "dns-record")
            .with_attr("zone", json!("example.org"))
            .with_attr("record_name", json!("www"));
        let err = www
            .create(&defn, &bed.create_context(CreateOptions::default()))
            .await
            .expect_err("nothing to point at");
        assert!(matches!(err, crate::error::DeployError::Config(_)));
    }
}
