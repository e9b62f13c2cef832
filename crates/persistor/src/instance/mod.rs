//! Instances and the object graph that owns them.
//!
//! Instances reference each other (a customer holds its addresses, each
//! address points back at the customer), so they live in an arena,
//! [`ObjectGraph`], and refer to one another through [`InstanceId`] handles.
//! Every fetch materializes new instances into the graph it is given; two
//! graphs (or two fetches) may therefore hold distinct copies of the same
//! stored record, reconciled only by the version check at write time.

pub mod graph;
pub mod tracking;

use std::collections::BTreeMap;

use serde_json::Value;

pub use graph::ObjectGraph;
pub use tracking::{InstanceState, Tracking};

/// Handle of an instance within one [`ObjectGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    /// Position in the owning graph.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A realized object of some template.
#[derive(Debug, Clone)]
pub struct Instance {
    pub(crate) template: String,
    pub(crate) id: Option<String>,
    pub(crate) tracking: Tracking,
    pub(crate) values: BTreeMap<String, Value>,
    pub(crate) references: BTreeMap<String, Option<InstanceId>>,
    /// Last stored foreign key per to-one relationship, kept while unfetched.
    pub(crate) foreign_keys: BTreeMap<String, Option<String>>,
    pub(crate) collections: BTreeMap<String, Vec<InstanceId>>,
    pub(crate) fetched: BTreeMap<String, bool>,
    /// Child identities last read or written per to-many relationship.
    pub(crate) snapshots: BTreeMap<String, Vec<String>>,
}

impl Instance {
    pub(crate) fn new(template: impl Into<String>, id: Option<String>, tracking: Tracking) -> Self {
        Self {
            template: template.into(),
            id,
            tracking,
            values: BTreeMap::new(),
            references: BTreeMap::new(),
            foreign_keys: BTreeMap::new(),
            collections: BTreeMap::new(),
            fetched: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        }
    }

    /// Concrete template name.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Identity, assigned at first successful insert.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn version(&self) -> i64 {
        self.tracking.version()
    }

    pub fn state(&self) -> InstanceState {
        self.tracking.state()
    }

    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_dirty(&self) -> bool {
        self.tracking.is_dirty()
    }

    /// Local flag set after a lost version check. See also `Persistor::is_stale`.
    pub fn is_stale(&self) -> bool {
        self.tracking.is_stale()
    }

    pub fn is_deleted(&self) -> bool {
        self.tracking.state() == InstanceState::Deleted
    }

    /// Whether a relationship has been resolved from storage (or assigned locally).
    pub fn is_fetched(&self, relationship: &str) -> bool {
        self.fetched.get(relationship).copied().unwrap_or(false)
    }

    /// Scalar value, `Null` when unset.
    pub fn value(&self, property: &str) -> &Value {
        self.values.get(property).unwrap_or(&Value::Null)
    }

    /// All scalar values.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Stored foreign key of a to-one relationship.
    pub fn foreign_key(&self, relationship: &str) -> Option<&str> {
        self.foreign_keys
            .get(relationship)
            .and_then(|k| k.as_deref())
    }
}
