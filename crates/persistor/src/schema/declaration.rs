//! Storage declarations.
//!
//! The storage declaration maps each template onto a table or collection and
//! describes how its relationships are keyed:
//!
//! ```json
//! {
//!   "Customer": {
//!     "documentOf": "pg/customer",
//!     "children": {
//!       "primaryAddresses": {
//!         "id": "customer_id",
//!         "fetch": true,
//!         "filter": {"property": "type", "value": "primary"},
//!         "pruneOrphans": true
//!       }
//!     },
//!     "parents": { "referredBy": {"id": "referred_id"} }
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::template::Template;

/// How one template is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDeclaration {
    /// Storage target, optionally prefixed with a backend hint (`pg/customer`).
    #[serde(default)]
    pub document_of: Option<String>,

    /// Relationships where this template holds the foreign key.
    #[serde(default)]
    pub parents: BTreeMap<String, ParentDeclaration>,

    /// Relationships where the target template holds the foreign key.
    #[serde(default)]
    pub children: BTreeMap<String, ChildDeclaration>,

    /// Saving an instance also saves everything reachable through its relationships.
    #[serde(default)]
    pub cascade_save: bool,
}

/// A to-one relationship declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentDeclaration {
    /// Foreign-key column on this template's storage.
    pub id: String,
    #[serde(default, deserialize_with = "fetch_flag")]
    pub fetch: bool,
}

/// A to-many relationship declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildDeclaration {
    /// Foreign-key column on the child's storage.
    pub id: String,
    #[serde(default, deserialize_with = "fetch_flag")]
    pub fetch: bool,
    #[serde(default)]
    pub filter: Option<RelationshipFilter>,
    #[serde(default)]
    pub prune_orphans: bool,
}

/// Restricts which children populate a to-many relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipFilter {
    /// Child property compared against `value`.
    pub property: String,
    pub value: Value,
}

/// A complete schema: property metadata plus storage declarations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub schema: BTreeMap<String, StorageDeclaration>,
}

/// Accepts `true`/`false`, null, or truthy strings such as `"yes"`.
fn fetch_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::Null => false,
        Value::String(s) => !matches!(s.to_ascii_lowercase().as_str(), "" | "no" | "false" | "0"),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => true,
    })
}

/// A parsed storage target such as `pg/customer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageTarget {
    /// Backend hint (`pg`, `mongo`), if present.
    pub backend: Option<String>,
    /// Table or collection name.
    pub name: String,
}

impl StorageTarget {
    /// Parses `backend/name` or a bare `name`.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('/') {
            Some((backend, name)) if !backend.is_empty() && !name.is_empty() => Self {
                backend: Some(backend.to_string()),
                name: name.to_string(),
            },
            _ => Self {
                backend: None,
                name: raw.trim_matches('/').to_string(),
            },
        }
    }
}
