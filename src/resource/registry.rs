//! Type tag to implementation lookup.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ConfigError, Result};

use super::kinds;
use super::{Resource, ResourceContext};

/// Builds a resource of one type from its context.
pub type ResourceFactory = fn(ResourceContext) -> Arc<dyn Resource>;

/// Registered resource types.
///
/// Adding a backend means registering one more factory here.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    factories: BTreeMap<String, ResourceFactory>,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in type.
    #[must_use]
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        kinds::register_all(&mut registry);
        registry
    }

    /// Registers `factory` for `type_tag`, replacing any previous one.
    pub fn register(&mut self, type_tag: impl Into<String>, factory: ResourceFactory) {
        self.factories.insert(type_tag.into(), factory);
    }

    /// Returns true if `type_tag` is registered.
    #[must_use]
    pub fn contains(&self, type_tag: &str) -> bool {
        self.factories.contains_key(type_tag)
    }

    /// Registered type tags.
    pub fn type_tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds the resource described by `ctx.handle`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownResourceType`] if the type tag is not
    /// registered.
    pub fn instantiate(&self, ctx: ResourceContext) -> Result<Arc<dyn Resource>> {
        let factory = self
            .factories
            .get(ctx.handle.type_tag())
            .ok_or_else(|| ConfigError::UnknownResourceType {
                name: ctx.handle.name().to_string(),
                type_tag: ctx.handle.type_tag().to_string(),
            })?;
        Ok(factory(ctx))
    }
}
