//! Typed attribute fields.
//!
//! Every resource type declares its persisted attributes as [`Field`]
//! constants: a key, a default, and a value type with a serde codec.
//! [`Attrs`] binds the fields to one owner (a deployment or a
//! resource) in the [`StateDb`].
//!
//! Storing a value equal to the field's default deletes the row, so the
//! state only holds attributes that differ from their defaults.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

use crate::error::{Result, StateError};

use super::db::StateDb;
use super::schema::Scope;

/// A typed, persisted attribute.
pub struct Field<T> {
    key: &'static str,
    default: fn() -> T,
}

// Manual impls so that `T` need not be `Clone`/`Copy`.
impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field").field("key", &self.key).finish()
    }
}

const fn none<T>() -> Option<T> {
    None
}

impl<T> Field<T> {
    /// A field that reads as `default()` until set.
    #[must_use]
    pub const fn with_default(key: &'static str, default: fn() -> T) -> Self {
        Self { key, default }
    }

    /// Storage key.
    #[must_use]
    pub const fn key(&self) -> &'static str {
        self.key
    }
}

impl<T> Field<Option<T>> {
    /// A field that reads as `None` until set.
    #[must_use]
    pub const fn optional(key: &'static str) -> Self {
        Self {
            key,
            default: none::<T>,
        }
    }
}

/// Attribute accessor bound to one owner.
#[derive(Clone, Debug)]
pub struct Attrs {
    db: StateDb,
    scope: Scope,
}

impl Attrs {
    /// Binds an accessor to `scope`.
    #[must_use]
    pub const fn new(db: StateDb, scope: Scope) -> Self {
        Self { db, scope }
    }

    /// Owner of the attributes.
    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Underlying state handle.
    #[must_use]
    pub const fn db(&self) -> &StateDb {
        &self.db
    }

    /// Reads a field, falling back to its default.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the stored value does not decode.
    pub fn get<T: DeserializeOwned>(&self, field: &Field<T>) -> Result<T> {
        match self.db.get_attr(&self.scope, field.key) {
            Some(raw) => self.decode(field.key, &raw),
            None => Ok((field.default)()),
        }
    }

    /// Stores a field; a value equal to the default deletes the row.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded or the state cannot be
    /// written.
    pub fn set<T: Serialize + PartialEq>(&self, field: &Field<T>, value: &T) -> Result<()> {
        if (field.default)() == *value {
            return self.db.set_attr(&self.scope, field.key, None);
        }
        let raw = encode(field.key, value)?;
        self.db.set_attr(&self.scope, field.key, Some(raw))
    }

    /// Returns true if the field has a stored row.
    #[must_use]
    pub fn is_set<T>(&self, field: &Field<T>) -> bool {
        self.db.get_attr(&self.scope, field.key).is_some()
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &str) -> Result<T> {
        serde_json::from_str(raw).map_err(|e| {
            StateError::serialization(format!(
                "Attribute '{key}' of {} does not decode: {e}",
                self.scope
            ))
            .into()
        })
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        StateError::serialization(format!("Attribute '{key}' does not encode: {e}")).into()
    })
}
