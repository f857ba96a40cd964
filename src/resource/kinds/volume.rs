//! Block volumes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::DefinitionHasher;
use crate::error::Result;
use crate::provider::{KIND_VOLUME, ObjectStatus};
use crate::state::Field;

use super::super::{
    CheckResult, CreateContext, Definition, Resource, ResourceContext, ResourceHandle,
    ResourceState,
};
use super::object::ObjectOps;

const REGION: Field<Option<String>> = Field::optional("region");
const SIZE_GB: Field<Option<u64>> = Field::optional("size_gb");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VolumeSettings {
    region: String,
    size_gb: u64,
    #[serde(default)]
    volume_type: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

/// A block volume, attached to machines through their `volumes` setting.
pub struct VolumeResource {
    ctx: ResourceContext,
}

impl VolumeResource {
    /// Creates the resource.
    #[must_use]
    pub const fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }

    fn ops(&self) -> ObjectOps<'_> {
        ObjectOps::new(&self.ctx, KIND_VOLUME)
    }

    async fn resize(&self, id: &str, wanted: u64) -> Result<()> {
        let attrs = self.ctx.handle.attrs();
        let Some(current) = attrs.get(&SIZE_GB)? else {
            return attrs.set(&SIZE_GB, &Some(wanted));
        };
        if wanted == current {
            return Ok(());
        }
        if wanted < current {
            warn!(
                resource = %self.name(),
                "volumes cannot shrink; keeping {current} GiB instead of {wanted} GiB"
            );
            return Ok(());
        }

        info!(resource = %self.name(), "growing from {current} GiB to {wanted} GiB");
        self.ops().modify(id, &json!({ "size_gb": wanted })).await?;
        attrs.set(&SIZE_GB, &Some(wanted))
    }
}

#[async_trait]
impl Resource for VolumeResource {
    fn handle(&self) -> &ResourceHandle {
        &self.ctx.handle
    }

    async fn create(&self, defn: &Definition, ctx: &CreateContext) -> Result<()> {
        let settings: VolumeSettings = defn.parse()?;
        let hash = DefinitionHasher::new().hash_definition(defn);
        let ops = self.ops();

        if let Some(object) = ops.recover(&[(&REGION, "region")]).await? {
            let attrs = self.ctx.handle.attrs();
            if !attrs.is_set(&SIZE_GB) {
                attrs.set(&SIZE_GB, &object.attr_u64("size_gb"))?;
            }
        }
        ops.ensure_immutable(&REGION, &settings.region)?;
        ops.refresh(&ctx.options).await?;
        if ops.is_converged(&hash) {
            debug!(resource = %self.name(), "up to date");
            return Ok(());
        }

        let spec = json!({
            "name": format!("{}-{}", self.ctx.handle.deployment(), self.name()),
            "region": settings.region,
            "size_gb": settings.size_gb,
            "volume_type": settings.volume_type,
            "tags": settings.tags,
        });
        let attrs = self.ctx.handle.attrs();
        let (id, _) = ops
            .ensure_created(&spec, || {
                attrs.set(&REGION, &Some(settings.region.clone()))?;
                attrs.set(&SIZE_GB, &Some(settings.size_gb))?;
                self.ctx.handle.set_state(ResourceState::Starting)
            })
            .await?;

        ops.wait_for_status(
            &id,
            &[ObjectStatus::Available, ObjectStatus::InUse],
            Some(self.ctx.settings.create_timeout_secs),
        )
        .await
        .into_result(&format!("volume '{}' to become available", self.name()))?;
        self.ctx.handle.set_state(ResourceState::Up)?;

        self.resize(&id, settings.size_gb).await?;
        self.ctx.handle.set_definition_hash(Some(&hash))
    }

    async fn destroy(&self, wipe: bool) -> Result<bool> {
        let Some(id) = self.ctx.handle.provider_id() else {
            return Ok(true);
        };
        let question = if wipe {
            format!("are you sure you want to destroy volume '{}' ({id}) and its data?", self.name())
        } else {
            format!("are you sure you want to destroy volume '{}' ({id})?", self.name())
        };
        if !self.ctx.confirm.confirm(&question) {
            return Ok(false);
        }

        self.ops().delete().await?;
        self.ops().forget()?;
        Ok(true)
    }

    async fn check(&self) -> Result<CheckResult> {
        let (mut result, object) = self.ops().check().await?;
        if let Some(object) = object {
            let recorded = self.ctx.handle.attrs().get(&SIZE_GB)?;
            let observed = object.attr_u64("size_gb");
            if observed.is_some() && recorded != observed {
                warn!(resource = %self.name(), "size changed out-of-band");
                result.drift.push(String::from("size_gb changed"));
                self.ctx.handle.attrs().set(&SIZE_GB, &observed)?;
            }
        }
        Ok(result)
    }
}
