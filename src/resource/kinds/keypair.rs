//! SSH key pairs registered with a provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::DefinitionHasher;
use crate::error::Result;
use crate::provider::KIND_KEYPAIR;
use crate::state::Field;

use super::super::{
    CheckResult, CreateContext, Definition, Resource, ResourceContext, ResourceHandle,
    ResourceState,
};
use super::object::ObjectOps;

const PUBLIC_KEY: Field<Option<String>> = Field::optional("public_key");
const FINGERPRINT: Field<Option<String>> = Field::optional("fingerprint");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KeyPairSettings {
    public_key: String,
    #[serde(default)]
    region: Option<String>,
}

/// A public key machines are created with.
pub struct KeyPairResource {
    ctx: ResourceContext,
}

impl KeyPairResource {
    /// Creates the resource.
    #[must_use]
    pub const fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }

    fn ops(&self) -> ObjectOps<'_> {
        ObjectOps::new(&self.ctx, KIND_KEYPAIR)
    }
}

#[async_trait]
impl Resource for KeyPairResource {
    fn handle(&self) -> &ResourceHandle {
        &self.ctx.handle
    }

    async fn create(&self, defn: &Definition, ctx: &CreateContext) -> Result<()> {
        let settings: KeyPairSettings = defn.parse()?;
        let hash = DefinitionHasher::new().hash_definition(defn);
        let ops = self.ops();
        let attrs = self.ctx.handle.attrs();

        ops.recover(&[(&PUBLIC_KEY, "public_key")]).await?;
        ops.refresh(&ctx.options).await?;
        if ops.is_converged(&hash) {
            debug!(resource = %self.name(), "up to date");
            return Ok(());
        }

        // Providers cannot change the key material of a registered pair.
        let recorded = attrs.get(&PUBLIC_KEY)?;
        if self.ctx.handle.provider_id().is_some()
            && recorded.as_deref() != Some(settings.public_key.as_str())
        {
            info!(resource = %self.name(), "public key changed; replacing the key pair");
            ops.delete().await?;
            ops.forget()?;
        }

        let spec = json!({
            "name": format!("{}-{}", self.ctx.handle.deployment(), self.name()),
            "public_key": settings.public_key,
            "region": settings.region,
        });
        ops.ensure_created(&spec, || {
            attrs.set(&PUBLIC_KEY, &Some(settings.public_key.clone()))
        })
        .await?;

        self.ctx.handle.db().transaction(|| {
            self.ctx.handle.set_state(ResourceState::Up)?;
            self.ctx.handle.set_definition_hash(Some(&hash))
        })
    }

    async fn destroy(&self, _wipe: bool) -> Result<bool> {
        self.ops().delete().await?;
        self.ops().forget()?;
        self.ctx.handle.attrs().set(&PUBLIC_KEY, &None)?;
        Ok(true)
    }

    async fn check(&self) -> Result<CheckResult> {
        let (mut result, object) = self.ops().check().await?;
        if let Some(object) = object {
            let observed = object.attr_str("fingerprint").map(str::to_string);
            let recorded = self.ctx.handle.attrs().get(&FINGERPRINT)?;
            if recorded.is_some() && observed.is_some() && recorded != observed {
                warn!(resource = %self.name(), "key pair was replaced out-of-band");
                result.drift.push(String::from("fingerprint changed"));
            }
            if observed.is_some() {
                self.ctx.handle.attrs().set(&FINGERPRINT, &observed)?;
            }
        }
        Ok(result)
    }
}
