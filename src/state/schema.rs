//! Persisted table layout and schema migrations.
//!
//! The state is four logical tables: deployments, per-deployment key/value
//! attributes, resources (id, deployment, name, type), and per-resource
//! key/value attributes. Attribute values are JSON-encoded strings so that a
//! table row never depends on the Rust type that wrote it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::StateError;

/// Current version of the table layout.
pub const SCHEMA_VERSION: u32 = 3;

/// All persisted tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tables {
    /// Layout version.
    pub schema_version: u32,
    /// Next resource id to hand out; ids are never reused.
    pub next_resource_id: u64,
    /// Deployments by uuid.
    pub deployments: BTreeMap<String, DeploymentRow>,
    /// Deployment attributes by uuid, then key.
    pub deployment_attrs: BTreeMap<String, BTreeMap<String, String>>,
    /// Resources by id.
    pub resources: BTreeMap<u64, ResourceRow>,
    /// Resource attributes by id, then key.
    pub resource_attrs: BTreeMap<u64, BTreeMap<String, String>>,
}

/// A deployment row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRow {
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
}

/// A resource row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRow {
    /// Owning deployment uuid.
    pub deployment: String,
    /// Name, unique within the deployment.
    pub name: String,
    /// Type tag selecting the implementation.
    #[serde(rename = "type")]
    pub type_tag: String,
}

/// Owner of a set of attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Attributes of a deployment.
    Deployment(String),
    /// Attributes of a resource.
    Resource(u64),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment(uuid) => write!(f, "deployment {uuid}"),
            Self::Resource(id) => write!(f, "resource #{id}"),
        }
    }
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            next_resource_id: 1,
            deployments: BTreeMap::new(),
            deployment_attrs: BTreeMap::new(),
            resources: BTreeMap::new(),
            resource_attrs: BTreeMap::new(),
        }
    }
}

impl Tables {
    /// Creates empty tables at the current schema version.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a deployment row.
    pub fn insert_deployment(&mut self, uuid: &str, created_at: DateTime<Utc>) {
        self.deployments
            .insert(uuid.to_string(), DeploymentRow { created_at });
    }

    /// Removes a deployment row and its attributes.
    pub fn remove_deployment(&mut self, uuid: &str) -> bool {
        self.deployment_attrs.remove(uuid);
        self.deployments.remove(uuid).is_some()
    }

    /// Adds a resource row and returns its freshly allocated id.
    pub fn insert_resource(&mut self, deployment: &str, name: &str, type_tag: &str) -> u64 {
        let id = self.next_resource_id;
        self.next_resource_id += 1;
        self.resources.insert(
            id,
            ResourceRow {
                deployment: deployment.to_string(),
                name: name.to_string(),
                type_tag: type_tag.to_string(),
            },
        );
        id
    }

    /// Removes a resource row and its attributes.
    pub fn remove_resource(&mut self, id: u64) -> bool {
        self.resource_attrs.remove(&id);
        self.resources.remove(&id).is_some()
    }

    /// Resource rows of one deployment, by ascending id.
    pub fn resources_of<'a>(
        &'a self,
        deployment: &'a str,
    ) -> impl Iterator<Item = (u64, &'a ResourceRow)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, row)| row.deployment == deployment)
            .map(|(id, row)| (*id, row))
    }

    /// Reads one attribute.
    #[must_use]
    pub fn attr(&self, scope: &Scope, key: &str) -> Option<&String> {
        match scope {
            Scope::Deployment(uuid) => self.deployment_attrs.get(uuid)?.get(key),
            Scope::Resource(id) => self.resource_attrs.get(id)?.get(key),
        }
    }

    /// All attributes of one owner.
    #[must_use]
    pub fn attrs(&self, scope: &Scope) -> BTreeMap<String, String> {
        let table = match scope {
            Scope::Deployment(uuid) => self.deployment_attrs.get(uuid),
            Scope::Resource(id) => self.resource_attrs.get(id),
        };
        table.cloned().unwrap_or_default()
    }

    /// Writes one attribute; `None` deletes the row.
    pub fn set_attr(&mut self, scope: &Scope, key: &str, value: Option<String>) {
        let table = match scope {
            Scope::Deployment(uuid) => self.deployment_attrs.entry(uuid.clone()).or_default(),
            Scope::Resource(id) => self.resource_attrs.entry(*id).or_default(),
        };
        match value {
            Some(value) => {
                table.insert(key.to_string(), value);
            }
            None => {
                table.remove(key);
            }
        }

        let empty = table.is_empty();
        if empty {
            match scope {
                Scope::Deployment(uuid) => {
                    self.deployment_attrs.remove(uuid);
                }
                Scope::Resource(id) => {
                    self.resource_attrs.remove(id);
                }
            }
        }
    }
}

/// Upgrades a raw state document to the current layout.
///
/// Returns the tables and the version the document was written with.
///
/// # Errors
///
/// Returns an error if the document is newer than this build or malformed.
pub fn migrate(mut doc: Value) -> Result<(Tables, u32), StateError> {
    let found = doc
        .get("schema_version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| StateError::corrupted("missing schema_version"))?;

    if found > SCHEMA_VERSION {
        return Err(StateError::UnsupportedVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    if found < 2 {
        migrate_v1_to_v2(&mut doc)?;
    }
    if found < 3 {
        migrate_v2_to_v3(&mut doc)?;
    }
    if found < SCHEMA_VERSION {
        info!("Migrated state from schema version {found} to {SCHEMA_VERSION}");
    }

    doc["schema_version"] = Value::from(SCHEMA_VERSION);
    let tables = serde_json::from_value(doc)
        .map_err(|e| StateError::corrupted(format!("Failed to decode state tables: {e}")))?;
    Ok((tables, found))
}

/// Version 1 derived resource ids from the largest stored id.
fn migrate_v1_to_v2(doc: &mut Value) -> Result<(), StateError> {
    let resources = doc
        .get("resources")
        .and_then(Value::as_object)
        .ok_or_else(|| StateError::corrupted("missing resources table"))?;

    let mut max_id = 0u64;
    for key in resources.keys() {
        let id: u64 = key
            .parse()
            .map_err(|_| StateError::corrupted(format!("invalid resource id '{key}'")))?;
        max_id = max_id.max(id);
    }

    doc["next_resource_id"] = Value::from(max_id + 1);
    Ok(())
}

/// Version 2 deployment rows carried no creation time.
fn migrate_v2_to_v3(doc: &mut Value) -> Result<(), StateError> {
    let now = serde_json::to_value(Utc::now())
        .map_err(|e| StateError::serialization(e.to_string()))?;
    let deployments = doc
        .get_mut("deployments")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| StateError::corrupted("missing deployments table"))?;

    for row in deployments.values_mut() {
        if !row.is_object() {
            *row = Value::Object(serde_json::Map::new());
        }
        if row.get("created_at").is_none() {
            row["created_at"] = now.clone();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_ids_are_never_reused() {
        let mut tables = Tables::new();
        tables.insert_deployment("d1", Utc::now());
        let a = tables.insert_resource("d1", "a", "vm");
        let b = tables.insert_resource("d1", "b", "vm");
        assert!(tables.remove_resource(b));
        let c = tables.insert_resource("d1", "c", "vm");

        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(tables.resources_of("d1").count(), 2);
    }

    #[test]
    fn test_empty_attribute_tables_are_dropped() {
        let mut tables = Tables::new();
        let scope = Scope::Resource(7);
        tables.set_attr(&scope, "vm_id", Some(String::from("\"i-1\"")));
        assert_eq!(tables.attr(&scope, "vm_id").map(String::as_str), Some("\"i-1\""));

        tables.set_attr(&scope, "vm_id", None);
        assert!(tables.attr(&scope, "vm_id").is_none());
        assert!(tables.resource_attrs.is_empty());
    }

    #[test]
    fn test_migrate_from_v1() {
        let doc = json!({
            "schema_version": 1,
            "deployments": { "d1": {} },
            "deployment_attrs": { "d1": { "name": "\"web\"" } },
            "resources": {
                "4": { "deployment": "d1", "name": "a", "type": "vm" },
                "9": { "deployment": "d1", "name": "b", "type": "volume" }
            },
            "resource_attrs": {}
        });

        let (tables, found) = migrate(doc).expect("v1 migrates");
        assert_eq!(found, 1);
        assert_eq!(tables.schema_version, SCHEMA_VERSION);
        assert_eq!(tables.next_resource_id, 10);
        assert!(tables.deployments.contains_key("d1"));
        assert_eq!(tables.resources[&9].type_tag, "volume");
    }

    #[test]
    fn test_current_version_round_trips_through_migrate() {
        let mut tables = Tables::new();
        tables.insert_deployment("d1", Utc::now());
        tables.insert_resource("d1", "a", "vm");
        let doc = serde_json::to_value(&tables).expect("serializes");

        let (loaded, found) = migrate(doc).expect("current version loads");
        assert_eq!(found, SCHEMA_VERSION);
        assert_eq!(loaded, tables);
    }

    #[test]
    fn test_newer_versions_are_rejected() {
        let doc = json!({ "schema_version": SCHEMA_VERSION + 1 });
        assert!(matches!(
            migrate(doc),
            Err(StateError::UnsupportedVersion { .. })
        ));
    }
}
