//! Provider backends.
//!
//! Resources reach their provider through the [`Providers`] registry, keyed
//! by the provider name used in resource definitions.

mod api;
mod http;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use api::{
    KIND_DNS_RECORD, KIND_KEYPAIR, KIND_SECURITY_GROUP, KIND_SNAPSHOT, KIND_VM, KIND_VOLUME,
    ObjectStatus, ProviderApi, ProviderObject,
};
#[cfg(test)]
pub use api::MockProviderApi;
pub use http::RestProvider;

use crate::error::{ConfigError, Result};

/// Name used when a definition does not name a provider.
pub const DEFAULT_PROVIDER: &str = "default";

/// Configured providers by name.
#[derive(Clone, Default)]
pub struct Providers {
    providers: BTreeMap<String, Arc<dyn ProviderApi>>,
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}

impl Providers {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ProviderApi>) {
        self.providers.insert(name.into(), provider);
    }

    /// Looks up the provider used by resource `resource`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProvider`] if no provider is registered
    /// under `name`.
    pub fn get(&self, name: &str, resource: &str) -> Result<Arc<dyn ProviderApi>> {
        self.providers.get(name).cloned().ok_or_else(|| {
            ConfigError::UnknownProvider {
                name: resource.to_string(),
                provider: name.to_string(),
            }
            .into()
        })
    }

    /// Returns true if a provider is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered provider names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}
