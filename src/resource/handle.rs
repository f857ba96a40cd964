//! Persisted identity and common attributes of a resource.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::Result;
use crate::provider::DEFAULT_PROVIDER;
use crate::state::{Attrs, Field, ResourceRow, Scope, StateDb};

use super::ResourceState;

/// Lifecycle state.
pub const STATE: Field<ResourceState> = Field::with_default("state", ResourceState::default);
/// Set while the resource is absent from the current definitions.
pub const OBSOLETE: Field<bool> = Field::with_default("obsolete", bool::default);
/// Deterministic address slot, assigned once.
pub const INDEX: Field<Option<u32>> = Field::optional("index");
/// When the provider object was created.
pub const CREATION_TIME: Field<Option<DateTime<Utc>>> = Field::optional("creation_time");
/// Provider name the resource was created with.
pub const PROVIDER: Field<Option<String>> = Field::optional("provider");
/// Provider-assigned object id.
pub const PROVIDER_ID: Field<Option<String>> = Field::optional("provider_id");
/// Hash of the definition last converged to.
pub const DEFINITION_HASH: Field<Option<String>> = Field::optional("definition_hash");
/// Names this resource was created after, kept to order destruction.
pub const DEPENDS_ON: Field<Vec<String>> = Field::with_default("depends_on", Vec::new);
/// Build artifact last activated on a machine.
pub const ARTIFACT: Field<Option<String>> = Field::optional("artifact");

/// A resource row bound to its attributes.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: u64,
    name: String,
    type_tag: String,
    deployment: String,
    attrs: Attrs,
}

impl ResourceHandle {
    /// Binds a resource row.
    #[must_use]
    pub fn new(db: StateDb, id: u64, row: &ResourceRow) -> Self {
        Self {
            id,
            name: row.name.clone(),
            type_tag: row.type_tag.clone(),
            deployment: row.deployment.clone(),
            attrs: Attrs::new(db, Scope::Resource(id)),
        }
    }

    /// Stable id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Name, unique within the deployment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type tag.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Owning deployment.
    #[must_use]
    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    /// Attribute accessor.
    #[must_use]
    pub const fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// State handle.
    #[must_use]
    pub const fn db(&self) -> &StateDb {
        self.attrs.db()
    }

    /// Reads a field that has a default, logging and falling back to
    /// `fallback` if the stored value does not decode.
    fn read_or<T: serde::de::DeserializeOwned>(&self, field: &Field<T>, fallback: T) -> T {
        self.attrs.get(field).unwrap_or_else(|err| {
            warn!(resource = %self.name, "{err}");
            fallback
        })
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ResourceState {
        self.read_or(&STATE, ResourceState::Unknown)
    }

    /// Records a lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_state(&self, state: ResourceState) -> Result<()> {
        self.attrs.set(&STATE, &state)
    }

    /// Obsolete flag.
    #[must_use]
    pub fn obsolete(&self) -> bool {
        self.read_or(&OBSOLETE, false)
    }

    /// Sets the obsolete flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_obsolete(&self, obsolete: bool) -> Result<()> {
        self.attrs.set(&OBSOLETE, &obsolete)
    }

    /// Assigned index.
    #[must_use]
    pub fn index(&self) -> Option<u32> {
        self.read_or(&INDEX, None)
    }

    /// Assigns an index.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_index(&self, index: u32) -> Result<()> {
        self.attrs.set(&INDEX, &Some(index))
    }

    /// Provider name, falling back to the default provider.
    #[must_use]
    pub fn provider_name(&self) -> String {
        self.read_or(&PROVIDER, None)
            .unwrap_or_else(|| String::from(DEFAULT_PROVIDER))
    }

    /// Records the provider name.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_provider_name(&self, provider: Option<&str>) -> Result<()> {
        self.attrs.set(&PROVIDER, &provider.map(str::to_string))
    }

    /// Provider-assigned id, if created.
    #[must_use]
    pub fn provider_id(&self) -> Option<String> {
        self.read_or(&PROVIDER_ID, None)
    }

    /// Records or clears the provider-assigned id.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_provider_id(&self, id: Option<&str>) -> Result<()> {
        self.attrs.set(&PROVIDER_ID, &id.map(str::to_string))
    }

    /// Creation time of the provider object.
    #[must_use]
    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.read_or(&CREATION_TIME, None)
    }

    /// Records the creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_creation_time(&self, time: Option<DateTime<Utc>>) -> Result<()> {
        self.attrs.set(&CREATION_TIME, &time)
    }

    /// Hash of the definition last converged to.
    #[must_use]
    pub fn definition_hash(&self) -> Option<String> {
        self.read_or(&DEFINITION_HASH, None)
    }

    /// Records the converged definition hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_definition_hash(&self, hash: Option<&str>) -> Result<()> {
        self.attrs.set(&DEFINITION_HASH, &hash.map(str::to_string))
    }

    /// Names this resource depends on.
    #[must_use]
    pub fn depends_on(&self) -> Vec<String> {
        self.read_or(&DEPENDS_ON, Vec::new())
    }

    /// Records the dependency names.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_depends_on(&self, names: &[String]) -> Result<()> {
        self.attrs.set(&DEPENDS_ON, &names.to_vec())
    }

    /// Build artifact last activated.
    #[must_use]
    pub fn artifact(&self) -> Option<String> {
        self.read_or(&ARTIFACT, None)
    }

    /// Records the activated build artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_artifact(&self, artifact: Option<&str>) -> Result<()> {
        self.attrs.set(&ARTIFACT, &artifact.map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ResourceHandle {
        let db = StateDb::in_memory();
        let deployment = db.create_deployment(None).expect("deployment");
        let id = db.insert_resource(&deployment, "web", "vm").expect("resource");
        let row = ResourceRow {
            deployment,
            name: String::from("web"),
            type_tag: String::from("vm"),
        };
        ResourceHandle::new(db, id, &row)
    }

    #[test]
    fn test_new_resource_is_missing_and_active() {
        let handle = handle();
        assert_eq!(handle.state(), ResourceState::Missing);
        assert!(!handle.obsolete());
        assert_eq!(handle.index(), None);
        assert_eq!(handle.provider_name(), DEFAULT_PROVIDER);
        assert!(handle.db().attrs(handle.attrs().scope()).is_empty());
    }

    #[test]
    fn test_common_fields_persist() {
        let handle = handle();
        handle.set_state(ResourceState::Up).expect("state");
        handle.set_index(3).expect("index");
        handle.set_provider_id(Some("i-1")).expect("id");
        handle
            .set_depends_on(&[String::from("kp")])
            .expect("deps");

        assert_eq!(handle.state(), ResourceState::Up);
        assert_eq!(handle.index(), Some(3));
        assert_eq!(handle.provider_id().as_deref(), Some("i-1"));
        assert_eq!(handle.depends_on(), vec![String::from("kp")]);

        handle.set_provider_id(None).expect("clear");
        assert!(handle.provider_id().is_none());
    }
}
