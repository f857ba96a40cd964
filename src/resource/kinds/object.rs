//! Provider object lifecycle shared by the cloud-backed types.
//!
//! Creation follows the client-token pattern: a random token is persisted
//! before the non-idempotent create call and cleared only in the same
//! transaction that records the provider-assigned id. A process that dies in
//! between reuses the token on the next run, and the provider returns the
//! object from the first call instead of creating a second one.

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ProviderError, Result};
use crate::poll::{PollOutcome, retry_transient};
use crate::provider::{ObjectStatus, ProviderObject};
use crate::state::Field;

use super::super::{CheckResult, CreateOptions, ResourceContext, ResourceHandle, ResourceState};
use super::state_for;

/// Idempotency token of a create call in flight.
pub const CLIENT_TOKEN: Field<Option<String>> = Field::optional("client_token");

/// Lifecycle operations on the provider object behind one resource.
pub struct ObjectOps<'a> {
    ctx: &'a ResourceContext,
    kind: &'static str,
}

impl<'a> ObjectOps<'a> {
    /// Binds the operations to the resource in `ctx` and an object kind.
    #[must_use]
    pub const fn new(ctx: &'a ResourceContext, kind: &'static str) -> Self {
        Self { ctx, kind }
    }

    fn handle(&self) -> &ResourceHandle {
        &self.ctx.handle
    }

    /// Returns the client token, generating and persisting one if needed.
    fn client_token(&self) -> Result<String> {
        let attrs = self.handle().attrs();
        self.handle().db().transaction(|| {
            if let Some(token) = attrs.get(&CLIENT_TOKEN)? {
                return Ok(token);
            }
            let token = Uuid::new_v4().to_string();
            attrs.set(&CLIENT_TOKEN, &Some(token.clone()))?;
            Ok(token)
        })
    }

    /// Creates the object unless its id is already recorded.
    ///
    /// `record` persists the creation-time settings; it runs in the
    /// transaction that records the id, so a record never holds an id
    /// without them. Returns the object id and whether a create call was
    /// made.
    ///
    /// # Errors
    ///
    /// Returns the provider's error; the client token stays persisted so a
    /// retry is deduplicated.
    pub async fn ensure_created(
        &self,
        spec: &Value,
        record: impl FnOnce() -> Result<()>,
    ) -> Result<(String, bool)> {
        if let Some(id) = self.handle().provider_id() {
            return Ok((id, false));
        }

        let token = self.client_token()?;
        let name = self.handle().name();
        info!(resource = %name, "creating {}", self.kind);

        let provider = self.ctx.provider()?;
        let policy = self.ctx.settings.retry_policy();
        let object = retry_transient(&policy, &format!("create {} '{name}'", self.kind), || {
            provider.create(self.kind, spec, &token)
        })
        .await?;

        // The id must be durable before the token is dropped.
        let handle = self.handle();
        handle.db().transaction(|| {
            handle.set_provider_id(Some(&object.id))?;
            handle.set_creation_time(Some(Utc::now()))?;
            record()?;
            handle.attrs().set(&CLIENT_TOKEN, &None)
        })?;

        info!(resource = %name, "created {} {}", self.kind, object.id);
        Ok((object.id, true))
    }

    /// Fills creation-time settings missing from a record that has an id.
    ///
    /// Each `(field, key)` pair names a persisted field and the provider
    /// attribute it was created from. Records written before settings and id
    /// were stored together can hold an id alone; the provider's description
    /// fills the gaps. Returns that description when one was fetched.
    ///
    /// # Errors
    ///
    /// Returns the provider's error or a state write error.
    pub async fn recover(
        &self,
        fields: &[(&Field<Option<String>>, &str)],
    ) -> Result<Option<ProviderObject>> {
        let handle = self.handle();
        let Some(id) = handle.provider_id() else {
            return Ok(None);
        };
        let attrs = handle.attrs();
        if fields.iter().all(|&(field, _)| attrs.is_set(field)) {
            return Ok(None);
        }
        let Some(object) = self.describe(&id).await? else {
            return Ok(None);
        };

        warn!(resource = %handle.name(), "recovering settings of {} {id} from the provider", self.kind);
        handle.db().transaction(|| {
            for &(field, key) in fields {
                if attrs.is_set(field) {
                    continue;
                }
                if let Some(value) = object.attr_str(key) {
                    attrs.set(field, &Some(value.to_string()))?;
                }
            }
            Ok(())
        })?;
        Ok(Some(object))
    }

    /// Whether the object is up and last converged to the definition hashed
    /// as `hash`.
    #[must_use]
    pub fn is_converged(&self, hash: &str) -> bool {
        let handle = self.handle();
        handle.provider_id().is_some()
            && handle.state() == ResourceState::Up
            && handle.definition_hash().as_deref() == Some(hash)
    }

    /// Fails if an immutable setting differs from the recorded one.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::PreconditionViolation`] on a change.
    pub fn ensure_immutable(
        &self,
        field: &Field<Option<String>>,
        wanted: &str,
    ) -> Result<()> {
        if self.handle().provider_id().is_none() {
            return Ok(());
        }
        match self.handle().attrs().get(field)? {
            Some(recorded) if recorded != wanted => Err(ProviderError::PreconditionViolation {
                resource: self.handle().name().to_string(),
                attribute: field.key().to_string(),
                message: format!("recorded as '{recorded}', definition asks for '{wanted}'"),
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Re-checks an existing object before converging it.
    ///
    /// Nothing is queried when the object is up and `check` is not set. An
    /// object that vanished is forgotten when `allow_recreate` is set and is
    /// an error otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Disappeared`] or the provider's error.
    pub async fn refresh(&self, options: &CreateOptions) -> Result<()> {
        let handle = self.handle();
        let Some(id) = handle.provider_id() else {
            return Ok(());
        };
        if !options.check && handle.state() == ResourceState::Up {
            return Ok(());
        }

        let (result, _) = self.check().await?;
        if result.exists == Some(false) {
            if !options.allow_recreate {
                return Err(ProviderError::disappeared(self.kind, id).into());
            }
            warn!(resource = %handle.name(), "{} {id} disappeared; recreating it", self.kind);
            self.forget()?;
        }
        Ok(())
    }

    /// Drops the recorded object id and everything derived from it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn forget(&self) -> Result<()> {
        let handle = self.handle();
        handle.db().transaction(|| {
            handle.set_provider_id(None)?;
            handle.set_state(ResourceState::Missing)?;
            handle.set_definition_hash(None)?;
            handle.set_creation_time(None)
        })
    }

    /// Describes the object; `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns the provider's error once retries are exhausted.
    pub async fn describe(&self, id: &str) -> Result<Option<ProviderObject>> {
        let provider = self.ctx.provider()?;
        let policy = self.ctx.settings.retry_policy();
        retry_transient(&policy, &format!("describe {} {id}", self.kind), || {
            provider.describe(self.kind, id)
        })
        .await
    }

    /// Changes mutable attributes of the object.
    ///
    /// # Errors
    ///
    /// Returns the provider's error once retries are exhausted.
    pub async fn modify(&self, id: &str, changes: &Value) -> Result<ProviderObject> {
        let provider = self.ctx.provider()?;
        let policy = self.ctx.settings.retry_policy();
        retry_transient(&policy, &format!("modify {} {id}", self.kind), || {
            provider.modify(self.kind, id, changes)
        })
        .await
    }

    /// Runs a named action on the object.
    ///
    /// # Errors
    ///
    /// Returns the provider's error once retries are exhausted.
    pub async fn action(&self, id: &str, action: &str, params: &Value) -> Result<ProviderObject> {
        let provider = self.ctx.provider()?;
        let policy = self.ctx.settings.retry_policy();
        retry_transient(&policy, &format!("{action} {} {id}", self.kind), || {
            provider.action(self.kind, id, action, params)
        })
        .await
    }

    /// Polls until the object reaches one of `wanted`.
    ///
    /// The object vanishing while waiting is fatal.
    pub async fn wait_for_status(
        &self,
        id: &str,
        wanted: &[ObjectStatus],
        timeout_secs: Option<u64>,
    ) -> PollOutcome<ProviderObject> {
        let poller = timeout_secs.map_or_else(
            || self.ctx.settings.unbounded_poller(),
            |secs| self.ctx.settings.poller(secs),
        );
        poller.until(|| self.fetch_status(id, wanted)).await
    }

    async fn fetch_status(&self, id: &str, wanted: &[ObjectStatus]) -> Result<Option<ProviderObject>> {
        match self.describe(id).await? {
            Some(object) if wanted.contains(&object.status) => Ok(Some(object)),
            Some(_) => Ok(None),
            None => Err(ProviderError::disappeared(self.kind, id).into()),
        }
    }

    /// Reconciles the persisted state with the provider.
    ///
    /// The state may move backward (up to stopped, anything to missing) when
    /// the object changed out-of-band; every such change is reported as
    /// drift.
    ///
    /// # Errors
    ///
    /// Returns the provider's error once retries are exhausted.
    pub async fn check(&self) -> Result<(CheckResult, Option<ProviderObject>)> {
        let handle = self.handle();
        let before = handle.state();
        let Some(id) = handle.provider_id() else {
            if before != ResourceState::Missing {
                handle.set_state(ResourceState::Missing)?;
            }
            return Ok((
                CheckResult {
                    exists: Some(false),
                    state: ResourceState::Missing,
                    drift: Vec::new(),
                },
                None,
            ));
        };

        let object = self.describe(&id).await?;
        let state = object
            .as_ref()
            .map_or(ResourceState::Missing, |o| state_for(o.status));

        let mut drift = Vec::new();
        if object.is_none() {
            warn!(resource = %handle.name(), "{} {id} no longer exists", self.kind);
            drift.push(format!("{} {id} disappeared", self.kind));
        }
        if state != before {
            if object.is_some() {
                warn!(resource = %handle.name(), "state changed from {before} to {state}");
            }
            drift.push(format!("state {before} -> {state}"));
            handle.set_state(state)?;
        }

        Ok((
            CheckResult {
                exists: Some(object.is_some()),
                state,
                drift,
            },
            object,
        ))
    }

    /// Deletes the object and forgets its id.
    ///
    /// An object that is already gone counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns the provider's error for anything but absence.
    pub async fn delete(&self) -> Result<()> {
        let Some(id) = self.handle().provider_id() else {
            return Ok(());
        };
        let name = self.handle().name();
        info!(resource = %name, "deleting {} {id}", self.kind);

        let provider = self.ctx.provider()?;
        let policy = self.ctx.settings.retry_policy();
        let deleted = retry_transient(&policy, &format!("delete {} {id}", self.kind), || {
            provider.delete(self.kind, &id)
        })
        .await;

        match deleted {
            Ok(()) => {
                let gone = self
                    .ctx
                    .settings
                    .poller(self.ctx.settings.create_timeout_secs)
                    .until_true(|| async {
                        self.describe(&id)
                            .await
                            .map(|object| object.is_none_or(|object| object.status.is_gone()))
                    })
                    .await
                    .succeeded()?;
                if !gone {
                    warn!(resource = %name, "{} {id} is still being deleted", self.kind);
                }
            }
            Err(err) if err.is_disappeared() => {
                warn!(resource = %name, "{} {id} was already gone", self.kind);
            }
            Err(err) => return Err(err),
        }

        self.handle().set_provider_id(None)
    }
}
