//! Provider API abstraction.
//!
//! Every backend speaks the same small vocabulary: objects of a `kind`
//! ("vm", "volume", "snapshot", ...) are created, described, modified,
//! deleted, and driven through named actions ("start", "stop", "attach").
//! Resource types translate their definitions into this vocabulary; vendor
//! specifics live behind [`ProviderApi`] implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Object kind for virtual machines.
pub const KIND_VM: &str = "vm";
/// Object kind for block volumes.
pub const KIND_VOLUME: &str = "volume";
/// Object kind for volume snapshots.
pub const KIND_SNAPSHOT: &str = "snapshot";
/// Object kind for SSH key pairs.
pub const KIND_KEYPAIR: &str = "keypair";
/// Object kind for security groups.
pub const KIND_SECURITY_GROUP: &str = "security-group";
/// Object kind for DNS records.
pub const KIND_DNS_RECORD: &str = "dns-record";

/// Lifecycle status reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectStatus {
    /// Being created.
    Pending,
    /// Running (machines).
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped (machines).
    Stopped,
    /// Ready for use (volumes, snapshots, records).
    Available,
    /// Attached to a machine (volumes).
    InUse,
    /// Being deleted.
    Deleting,
    /// Gone, but still reported for a while.
    Deleted,
    /// Anything this build does not know about.
    #[default]
    #[serde(other)]
    Unknown,
}

impl ObjectStatus {
    /// Returns true for statuses of an object that is being or has been
    /// removed.
    #[must_use]
    pub const fn is_gone(self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }
}

impl std::fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// An object as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderObject {
    /// Provider-assigned id.
    pub id: String,
    /// Current status.
    #[serde(default)]
    pub status: ObjectStatus,
    /// Kind-specific attributes (addresses, size, region...).
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

impl ProviderObject {
    /// Creates an object with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, status: ObjectStatus) -> Self {
        Self {
            id: id.into(),
            status,
            attrs: BTreeMap::new(),
        }
    }

    /// Reads a string attribute.
    #[must_use]
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    /// Reads an integer attribute.
    #[must_use]
    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attrs.get(key).and_then(Value::as_u64)
    }
}

/// One backend's API.
///
/// Implementations classify failures: allow-listed retryable errors as
/// [`ProviderError::Transient`](crate::error::ProviderError::Transient),
/// missing objects as `Disappeared` (or `None` from [`describe`]).
///
/// [`describe`]: ProviderApi::describe
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Creates an object.
    ///
    /// `client_token` makes the call idempotent: repeating it with the same
    /// token returns the object created by the first call.
    async fn create(&self, kind: &str, spec: &Value, client_token: &str) -> Result<ProviderObject>;

    /// Describes an object; `None` if it does not exist.
    async fn describe(&self, kind: &str, id: &str) -> Result<Option<ProviderObject>>;

    /// Changes mutable attributes of an object.
    async fn modify(&self, kind: &str, id: &str, changes: &Value) -> Result<ProviderObject>;

    /// Deletes an object.
    async fn delete(&self, kind: &str, id: &str) -> Result<()>;

    /// Runs a named action on an object.
    async fn action(&self, kind: &str, id: &str, action: &str, params: &Value)
    -> Result<ProviderObject>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_status_does_not_fail_decoding() {
        let object: ProviderObject = serde_json::from_value(json!({
            "id": "i-1",
            "status": "rebooting",
            "attrs": { "public_ip": "203.0.113.7", "size_gb": 20 }
        }))
        .expect("decodes");

        assert_eq!(object.status, ObjectStatus::Unknown);
        assert_eq!(object.attr_str("public_ip"), Some("203.0.113.7"));
        assert_eq!(object.attr_u64("size_gb"), Some(20));
    }

    #[test]
    fn test_status_wire_names() {
        let status: ObjectStatus = serde_json::from_value(json!("in-use")).expect("decodes");
        assert_eq!(status, ObjectStatus::InUse);
        assert_eq!(status.to_string(), "in-use");
        assert!(ObjectStatus::Deleting.is_gone());
    }
}
