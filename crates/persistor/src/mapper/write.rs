//! Write path: save-set expansion, ordering, row decomposition and execution.
//!
//! Nothing here mutates the graph. [`execute`] returns a [`WriteOutcome`]
//! describing what was written; the transaction manager applies it once the
//! backend transaction has committed, so a rollback leaves the graph exactly
//! as it was.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::core::{Connection, Row};
use crate::error::{BackendError, ConcurrencyError, StorageError, StorageResult, ValidationError};
use crate::instance::{InstanceId, ObjectGraph};
use crate::schema::{PropertyKind, TEMPLATE_COLUMN, VERSION_COLUMN};

/// Why a write phase stopped.
#[derive(Debug)]
pub(crate) struct WriteFailure {
    pub error: StorageError,
    /// The instance whose update lost the version check.
    pub conflicted: Option<InstanceId>,
}

impl From<BackendError> for WriteFailure {
    fn from(error: BackendError) -> Self {
        Self {
            error: error.into(),
            conflicted: None,
        }
    }
}

impl From<StorageError> for WriteFailure {
    fn from(error: StorageError) -> Self {
        Self {
            error,
            conflicted: None,
        }
    }
}

/// Everything a successful write phase did.
#[derive(Debug, Default)]
pub(crate) struct WriteOutcome {
    /// Identities assigned to inserted instances.
    pub assigned: HashMap<InstanceId, String>,
    /// Instances written, in write order.
    pub saved: Vec<InstanceId>,
    pub inserted: usize,
    pub updated: usize,
    /// Foreign keys written per saved instance and to-one relationship.
    foreign_keys: HashMap<InstanceId, BTreeMap<String, Option<String>>>,
    /// Explicitly deleted instances.
    pub deleted: Vec<InstanceId>,
    /// `(storage target, identity)` of rows removed as orphans.
    pub pruned: Vec<(String, String)>,
}

impl WriteOutcome {
    /// Applies the outcome to the graph after commit.
    pub(crate) fn apply(&self, graph: &mut ObjectGraph) -> StorageResult<()> {
        for (id, key) in &self.assigned {
            graph.instance_mut(*id)?.id = Some(key.clone());
        }

        for id in &self.saved {
            let instance = graph.instance_mut(*id)?;
            instance.tracking.commit_save();
            if let Some(keys) = self.foreign_keys.get(id) {
                instance.foreign_keys.extend(keys.clone());
            }
        }

        for id in &self.saved {
            let collections: Vec<(String, Vec<InstanceId>)> = {
                let instance = graph.instance(*id)?;
                instance
                    .collections
                    .iter()
                    .filter(|(name, _)| instance.is_fetched(name))
                    .map(|(name, members)| (name.clone(), members.clone()))
                    .collect()
            };
            for (name, members) in collections {
                let snapshot = members
                    .iter()
                    .filter_map(|m| graph.instance(*m).ok().and_then(|i| i.id().map(str::to_string)))
                    .collect();
                graph.instance_mut(*id)?.snapshots.insert(name, snapshot);
            }
        }

        for id in &self.deleted {
            graph.instance_mut(*id)?.tracking.deleted();
        }

        if !self.pruned.is_empty() {
            let registry = std::sync::Arc::clone(graph.registry());
            for id in graph.ids() {
                let matches = {
                    let instance = graph.instance(id)?;
                    let storage = registry.template(instance.template())?.storage_name();
                    instance.id().is_some_and(|key| {
                        self.pruned.iter().any(|(target, pruned)| target == storage && pruned == key)
                    })
                };
                if matches {
                    graph.instance_mut(id)?.tracking.deleted();
                }
            }
        }
        Ok(())
    }
}

/// Instances a save of `dirty` writes, in discovery order.
///
/// Unsaved instances reachable through resolved relationships are always
/// included; they have no stored row for anything else to point at.
pub(crate) fn save_set(
    graph: &ObjectGraph,
    dirty: &[InstanceId],
    deletes: &[InstanceId],
) -> StorageResult<Vec<InstanceId>> {
    let mut seen = HashSet::new();
    let mut set = Vec::new();
    let mut queue: VecDeque<(InstanceId, bool)> = dirty.iter().map(|d| (*d, true)).collect();

    while let Some((id, explicit)) = queue.pop_front() {
        if !seen.insert(id) || deletes.contains(&id) {
            continue;
        }
        let instance = graph.instance(id)?;
        if instance.is_deleted() {
            if explicit {
                return Err(ValidationError::Deleted {
                    template: instance.template().to_string(),
                    id: instance.id().unwrap_or_default().to_string(),
                }
                .into());
            }
            continue;
        }
        set.push(id);

        let schema = graph.schema_of(id)?;
        for property in schema.relationships() {
            if !instance.is_fetched(&property.name) {
                continue;
            }
            let related = graph
                .reference(id, &property.name)
                .into_iter()
                .chain(graph.collection(id, &property.name).iter().copied());
            for member in related {
                if graph.instance(member)?.is_new() {
                    queue.push_back((member, false));
                }
            }
        }
    }
    Ok(set)
}

/// Orders a save set so every unsaved parent is written before whatever
/// holds a foreign key to it. Instances caught in a cycle keep their
/// relative order at the end.
pub(crate) fn write_order(graph: &ObjectGraph, set: &[InstanceId]) -> StorageResult<Vec<InstanceId>> {
    let position: HashMap<InstanceId, usize> = set.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut prerequisites: Vec<HashSet<usize>> = vec![HashSet::new(); set.len()];

    for (index, id) in set.iter().enumerate() {
        let instance = graph.instance(*id)?;
        let schema = graph.schema_of(*id)?;
        for property in schema.relationships() {
            if !instance.is_fetched(&property.name) {
                continue;
            }
            match &property.kind {
                PropertyKind::ToOne { .. } => {
                    if let Some(parent) = graph.reference(*id, &property.name)
                        && let Some(p) = position.get(&parent)
                        && *p != index
                        && graph.instance(parent)?.is_new()
                    {
                        prerequisites[index].insert(*p);
                    }
                }
                PropertyKind::ToMany { .. } => {
                    if !instance.is_new() {
                        continue;
                    }
                    for child in graph.collection(*id, &property.name) {
                        if let Some(c) = position.get(child)
                            && *c != index
                        {
                            prerequisites[*c].insert(index);
                        }
                    }
                }
                PropertyKind::Scalar { .. } => {}
            }
        }
    }

    let mut done = vec![false; set.len()];
    let mut order = Vec::with_capacity(set.len());
    loop {
        let next = (0..set.len()).find(|i| !done[*i] && prerequisites[*i].iter().all(|p| done[*p]));
        match next {
            Some(i) => {
                done[i] = true;
                order.push(set[i]);
            }
            None => break,
        }
    }
    if order.len() < set.len() {
        tracing::debug!(
            cyclic = set.len() - order.len(),
            "Relationship cycle in save set, deferring foreign keys"
        );
        order.extend((0..set.len()).filter(|i| !done[*i]).map(|i| set[i]));
    }
    Ok(order)
}

/// Owner and relationship name of every to-many membership in the graph.
fn owners(graph: &ObjectGraph) -> StorageResult<HashMap<InstanceId, Vec<(InstanceId, String)>>> {
    let mut owners: HashMap<InstanceId, Vec<(InstanceId, String)>> = HashMap::new();
    for id in graph.ids() {
        let instance = graph.instance(id)?;
        if instance.is_deleted() {
            continue;
        }
        for (relationship, members) in &instance.collections {
            for member in members {
                owners.entry(*member).or_default().push((id, relationship.clone()));
            }
        }
    }
    Ok(owners)
}

/// Stored identity of an instance, including one assigned earlier in this write.
fn identity_of(graph: &ObjectGraph, assigned: &HashMap<InstanceId, String>, id: InstanceId) -> Option<String> {
    graph
        .instance(id)
        .ok()
        .and_then(|i| i.id().map(str::to_string))
        .or_else(|| assigned.get(&id).cloned())
}

struct Decomposed {
    row: Row,
    foreign_keys: BTreeMap<String, Option<String>>,
    /// A foreign key pointed at an instance not yet written.
    deferred: bool,
}

/// Builds the stored row of one instance.
fn decompose(
    graph: &ObjectGraph,
    owners: &HashMap<InstanceId, Vec<(InstanceId, String)>>,
    assigned: &HashMap<InstanceId, String>,
    id: InstanceId,
    version: i64,
) -> StorageResult<Decomposed> {
    let instance = graph.instance(id)?;
    let schema = graph.schema_of(id)?;
    let mut row = Row::new();
    let mut foreign_keys = BTreeMap::new();
    let mut deferred = false;

    row.insert(TEMPLATE_COLUMN.to_string(), Value::String(schema.name().to_string()));
    row.insert(VERSION_COLUMN.to_string(), Value::from(version));

    for property in schema.properties() {
        match &property.kind {
            PropertyKind::Scalar { .. } => {
                row.insert(property.name.clone(), instance.value(&property.name).clone());
            }
            PropertyKind::ToOne { foreign_key, .. } => {
                let key = if instance.is_fetched(&property.name) {
                    match graph.reference(id, &property.name) {
                        Some(target) => {
                            let key = identity_of(graph, assigned, target);
                            deferred |= key.is_none();
                            key
                        }
                        None => None,
                    }
                } else {
                    instance.foreign_key(&property.name).map(str::to_string)
                };
                row.insert(
                    foreign_key.clone(),
                    key.clone().map(Value::String).unwrap_or(Value::Null),
                );
                foreign_keys.insert(property.name.clone(), key);
            }
            PropertyKind::ToMany { .. } => {}
        }
    }

    for (owner, relationship) in owners.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
        let owner_schema = graph.schema_of(*owner)?;
        if let Some(PropertyKind::ToMany {
            foreign_key, filter, ..
        }) = owner_schema.property(relationship).map(|p| &p.kind)
        {
            let key = identity_of(graph, assigned, *owner);
            deferred |= key.is_none();
            row.insert(foreign_key.clone(), key.map(Value::String).unwrap_or(Value::Null));
            if let Some(filter) = filter {
                row.insert(filter.property.clone(), filter.value.clone());
            }
        }
    }

    Ok(Decomposed {
        row,
        foreign_keys,
        deferred,
    })
}

async fn conflict(
    conn: &mut dyn Connection,
    graph: &ObjectGraph,
    id: InstanceId,
    storage: &str,
    key: &str,
) -> WriteFailure {
    let (template, expected_version) = graph
        .instance(id)
        .map(|i| (i.template().to_string(), i.version()))
        .unwrap_or_default();
    let actual_version = conn.read_version(storage, key).await.ok().flatten();
    tracing::info!(
        template = %template,
        id = %key,
        expected_version,
        actual_version = ?actual_version,
        "Update lost the version check"
    );
    WriteFailure {
        error: ConcurrencyError::UpdateConflict {
            template,
            id: key.to_string(),
            expected_version,
            actual_version,
        }
        .into(),
        conflicted: Some(id),
    }
}

/// Writes `order` (see [`write_order`]) and `deletes` on `conn`.
///
/// `conn` must have an open transaction; committing or rolling back is the
/// caller's job.
pub(crate) async fn execute(
    graph: &ObjectGraph,
    conn: &mut dyn Connection,
    order: &[InstanceId],
    deletes: &[InstanceId],
) -> Result<WriteOutcome, WriteFailure> {
    let registry = std::sync::Arc::clone(graph.registry());
    let owners = owners(graph)?;
    let mut outcome = WriteOutcome::default();
    let mut deferred = Vec::new();

    for id in order {
        let instance = graph.instance(*id)?;
        let schema = registry.template(instance.template())?;
        let storage = schema.storage_name();
        let version = instance.version() + 1;
        let decomposed = decompose(graph, &owners, &outcome.assigned, *id, version)?;

        match instance.id() {
            None => {
                let key = conn.insert(storage, decomposed.row).await?;
                tracing::debug!(template = %schema.name(), id = %key, "Inserted");
                outcome.assigned.insert(*id, key);
                outcome.inserted += 1;
            }
            Some(key) => {
                let affected = conn
                    .update(storage, key, decomposed.row, instance.version())
                    .await?;
                if affected == 0 {
                    return Err(conflict(conn, graph, *id, storage, key).await);
                }
                tracing::debug!(template = %schema.name(), id = %key, version, "Updated");
                outcome.updated += 1;
            }
        }
        if decomposed.deferred {
            deferred.push(*id);
        }
        outcome.foreign_keys.insert(*id, decomposed.foreign_keys);
        outcome.saved.push(*id);

        if instance.is_new() {
            continue;
        }
        for property in schema.relationships() {
            let (target, prune) = match &property.kind {
                PropertyKind::ToMany {
                    target,
                    prune_orphans,
                    ..
                } => (target, *prune_orphans),
                _ => continue,
            };
            if !prune || !instance.is_fetched(&property.name) {
                continue;
            }
            let current: HashSet<String> = graph
                .collection(*id, &property.name)
                .iter()
                .filter_map(|m| identity_of(graph, &outcome.assigned, *m))
                .collect();
            let child_storage = registry.template(target)?.storage_name();
            for orphan in instance
                .snapshots
                .get(&property.name)
                .into_iter()
                .flatten()
                .filter(|k| !current.contains(*k))
            {
                conn.delete(child_storage, orphan).await?;
                tracing::debug!(
                    template = %schema.name(),
                    relationship = %property.name,
                    id = %orphan,
                    "Pruned orphan"
                );
                outcome.pruned.push((child_storage.to_string(), orphan.clone()));
            }
        }
    }

    for id in deferred {
        let instance = graph.instance(id)?;
        let schema = registry.template(instance.template())?;
        let version = instance.version() + 1;
        let key = identity_of(graph, &outcome.assigned, id).ok_or_else(|| BackendError::Internal {
            backend_name: "mapper".to_string(),
            message: format!("{} was written without an identity", id),
        })?;
        let decomposed = decompose(graph, &owners, &outcome.assigned, id, version)?;
        let affected = conn
            .update(schema.storage_name(), &key, decomposed.row, version)
            .await?;
        if affected == 0 {
            return Err(conflict(conn, graph, id, schema.storage_name(), &key).await);
        }
        outcome.foreign_keys.insert(id, decomposed.foreign_keys);
    }

    for id in deletes {
        let instance = graph.instance(*id)?;
        if let Some(key) = instance.id() {
            let storage = registry.template(instance.template())?.storage_name();
            conn.lock_row(storage, key).await?;
            if let Some(stored) = conn.read_version(storage, key).await?
                && stored != instance.version()
            {
                return Err(conflict(conn, graph, *id, storage, key).await);
            }
            let affected = conn.delete(storage, key).await?;
            tracing::debug!(template = %instance.template(), id = %key, affected, "Deleted");
        }
        outcome.deleted.push(*id);
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::schema::{ChildDeclaration, ParentDeclaration, ScalarKind, SchemaRegistry, StorageDeclaration, Template};

    fn registry() -> Arc<SchemaRegistry> {
        let mut customer = StorageDeclaration::default();
        customer.children.insert(
            "addresses".to_string(),
            ChildDeclaration {
                id: "customer_id".to_string(),
                fetch: true,
                filter: None,
                prune_orphans: true,
            },
        );
        let mut address = StorageDeclaration::default();
        address.parents.insert(
            "customer".to_string(),
            ParentDeclaration {
                id: "customer_id".to_string(),
                fetch: false,
            },
        );
        Arc::new(
            SchemaRegistry::builder()
                .template(
                    Template::new("Customer")
                        .scalar("name", ScalarKind::String)
                        .collection("addresses", "Address"),
                )
                .template(
                    Template::new("Address")
                        .scalar("city", ScalarKind::String)
                        .reference("customer", "Customer"),
                )
                .declare("Customer", customer)
                .declare("Address", address)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_save_set_includes_new_related_instances() {
        let mut graph = ObjectGraph::new(registry());
        let sam = graph.create("Customer").unwrap();
        let home = graph.create("Address").unwrap();
        let stray = graph.create("Address").unwrap();
        graph.push(sam, "addresses", home).unwrap();

        let set = save_set(&graph, &[sam], &[]).unwrap();
        assert_eq!(set, vec![sam, home]);
        assert!(!set.contains(&stray));
    }

    #[test]
    fn test_write_order_puts_parents_first() {
        let mut graph = ObjectGraph::new(registry());
        let sam = graph.create("Customer").unwrap();
        let home = graph.create("Address").unwrap();
        graph.push(sam, "addresses", home).unwrap();
        graph.set_reference(home, "customer", Some(sam)).unwrap();

        let order = write_order(&graph, &[home, sam]).unwrap();
        assert_eq!(order, vec![sam, home]);
    }

    #[test]
    fn test_decompose_stamps_owner_key_and_defers_unknown_parent() {
        let mut graph = ObjectGraph::new(registry());
        let sam = graph.create("Customer").unwrap();
        let home = graph.create("Address").unwrap();
        graph.set(home, "city", "New York").unwrap();
        graph.push(sam, "addresses", home).unwrap();

        let owners = owners(&graph).unwrap();
        let pending = decompose(&graph, &owners, &HashMap::new(), home, 1).unwrap();
        assert!(pending.deferred);
        assert_eq!(pending.row["customer_id"], Value::Null);

        let assigned = HashMap::from([(sam, "c-1".to_string())]);
        let ready = decompose(&graph, &owners, &assigned, home, 1).unwrap();
        assert!(!ready.deferred);
        assert_eq!(ready.row["customer_id"], Value::String("c-1".to_string()));
        assert_eq!(ready.row["city"], Value::String("New York".to_string()));
        assert_eq!(ready.row[VERSION_COLUMN], Value::from(1));
        assert_eq!(ready.row[TEMPLATE_COLUMN], Value::String("Address".to_string()));
    }
}
