//! Read path: rows to instances, then relationship resolution.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::core::{Connection, Row};
use crate::error::{BackendError, StorageResult, ValidationError};
use crate::instance::{Instance, InstanceId, ObjectGraph, Tracking};
use crate::query::{FilterExpr, NativePredicate, Pagination, QueryDialect, SortSpec, translate_expr};
use crate::schema::{PRIMARY_KEY, PropertyKind, SchemaRegistry, TEMPLATE_COLUMN, TemplateSchema, VERSION_COLUMN};

use super::fetch_spec::{FetchDirective, FetchSpec};

/// Stored identity rendered as a string key.
pub(crate) fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn version_of(row: &Row) -> i64 {
    match row.get(VERSION_COLUMN) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        _ => 0,
    }
}

/// One unit of resolution work: instances plus the spec to apply to them.
struct Pending {
    instances: Vec<InstanceId>,
    spec: FetchSpec,
    depth: usize,
}

/// Materializes rows and resolves relationships for one fetch operation.
///
/// Identity is scoped to the loader: within one operation each stored record
/// becomes exactly one instance, which keeps cyclic references finite.
pub(crate) struct Loader<'a> {
    graph: &'a mut ObjectGraph,
    conn: &'a mut dyn Connection,
    registry: Arc<SchemaRegistry>,
    dialect: QueryDialect,
    max_depth: usize,
    identity: HashMap<(String, String), InstanceId>,
}

impl<'a> Loader<'a> {
    pub(crate) fn new(
        graph: &'a mut ObjectGraph,
        conn: &'a mut dyn Connection,
        dialect: QueryDialect,
        max_depth: usize,
    ) -> Self {
        let registry = Arc::clone(graph.registry());
        Self {
            graph,
            conn,
            registry,
            dialect,
            max_depth,
            identity: HashMap::new(),
        }
    }

    /// Makes an existing instance visible to identity resolution.
    fn adopt(&mut self, id: InstanceId) -> StorageResult<()> {
        let instance = self.graph.instance(id)?;
        if let Some(key) = instance.id() {
            let target = self.registry.template(instance.template())?.storage_name().to_string();
            self.identity.insert((target, key.to_string()), id);
        }
        Ok(())
    }

    /// Runs a query against `template` and resolves the results per `spec`.
    pub(crate) async fn fetch(
        &mut self,
        template: &str,
        predicate: &NativePredicate,
        sort: &SortSpec,
        page: Pagination,
        spec: &FetchSpec,
    ) -> StorageResult<Vec<InstanceId>> {
        let registry = Arc::clone(&self.registry);
        let schema = registry.template(template)?;
        spec.validate(&registry, schema)?;

        let rows = self
            .conn
            .query(schema.storage_name(), predicate, sort, page)
            .await?;
        tracing::debug!(template = %template, rows = rows.len(), "Fetched rows");

        let mut roots = Vec::with_capacity(rows.len());
        for row in rows {
            roots.push(self.materialize(schema, row)?.0);
        }
        self.resolve(roots.clone(), spec.clone()).await?;
        Ok(roots)
    }

    /// Resolves relationships of an instance already in the graph.
    ///
    /// Stored records already present in the graph are reused.
    pub(crate) async fn resolve_from(&mut self, root: InstanceId, spec: &FetchSpec) -> StorageResult<()> {
        let registry = Arc::clone(&self.registry);
        spec.validate(&registry, registry.template(self.graph.instance(root)?.template())?)?;
        for id in self.graph.ids() {
            if !self.graph.instance(id)?.is_deleted() {
                self.adopt(id)?;
            }
        }
        self.adopt(root)?;
        self.resolve(vec![root], spec.clone()).await
    }

    /// Re-reads an instance's row, discarding local changes.
    ///
    /// Relationships that were resolved are resolved again. Returns `false`
    /// when the row no longer exists; the instance is then marked deleted.
    pub(crate) async fn refresh(&mut self, root: InstanceId) -> StorageResult<bool> {
        let registry = Arc::clone(&self.registry);
        let (schema, key) = {
            let instance = self.graph.instance(root)?;
            let schema = registry.template(instance.template())?;
            let key = instance
                .id()
                .ok_or_else(|| ValidationError::MissingIdentity {
                    template: schema.name().to_string(),
                })?
                .to_string();
            (schema, key)
        };

        let predicate = translate_expr(schema, FilterExpr::eq(PRIMARY_KEY, key.clone()), self.dialect)?;
        let row = self
            .conn
            .query(schema.storage_name(), &predicate, &SortSpec::default(), Pagination::default())
            .await?
            .into_iter()
            .next();

        let row = match row {
            Some(row) => row,
            None => {
                tracing::debug!(template = %schema.name(), id = %key, "Refreshed instance no longer exists");
                self.graph.instance_mut(root)?.tracking.deleted();
                return Ok(false);
            }
        };

        let mut again = FetchSpec::none();
        let instance = self.graph.instance_mut(root)?;
        instance.tracking.refreshed(version_of(&row));
        for property in schema.properties() {
            match &property.kind {
                PropertyKind::Scalar { kind } => {
                    let value = row.get(&property.name).cloned().unwrap_or(Value::Null);
                    if value.is_null() {
                        instance.values.remove(&property.name);
                    } else {
                        instance.values.insert(property.name.clone(), kind.decode(value));
                    }
                }
                PropertyKind::ToOne { foreign_key, .. } => {
                    let stored = row.get(foreign_key).and_then(key_string);
                    let was_fetched = instance.is_fetched(&property.name);
                    let current = instance
                        .references
                        .get(&property.name)
                        .copied()
                        .flatten();
                    let unchanged = instance.foreign_keys.get(&property.name).cloned().flatten() == stored
                        && current.is_some() == stored.is_some();
                    instance.foreign_keys.insert(property.name.clone(), stored);
                    if was_fetched && !unchanged {
                        instance.references.insert(property.name.clone(), None);
                        instance.fetched.insert(property.name.clone(), false);
                        again = again.with(property.name.clone(), FetchDirective::Shallow);
                    }
                }
                PropertyKind::ToMany { .. } => {
                    if instance.is_fetched(&property.name) {
                        instance.collections.insert(property.name.clone(), Vec::new());
                        instance.fetched.insert(property.name.clone(), false);
                        again = again.with(property.name.clone(), FetchDirective::Shallow);
                    }
                }
            }
        }

        self.adopt(root)?;
        self.resolve(vec![root], again).await?;
        Ok(true)
    }

    /// Turns a row into an instance, reusing one already materialized here.
    fn materialize(&mut self, base: &TemplateSchema, row: Row) -> StorageResult<(InstanceId, bool)> {
        let key = row
            .get(PRIMARY_KEY)
            .and_then(key_string)
            .ok_or_else(|| BackendError::Serialization {
                message: format!("row of {} without {}", base.storage_name(), PRIMARY_KEY),
            })?;
        let identity = (base.storage_name().to_string(), key.clone());
        if let Some(existing) = self.identity.get(&identity) {
            return Ok((*existing, false));
        }

        let discriminator = row.get(TEMPLATE_COLUMN).and_then(Value::as_str);
        let schema = self.registry.concrete(base, discriminator);
        let mut instance = Instance::new(schema.name(), Some(key), Tracking::loaded(version_of(&row)));
        for property in schema.properties() {
            match &property.kind {
                PropertyKind::Scalar { kind } => {
                    if let Some(value) = row.get(&property.name).filter(|v| !v.is_null()) {
                        instance.values.insert(property.name.clone(), kind.decode(value.clone()));
                    }
                }
                PropertyKind::ToOne { foreign_key, .. } => {
                    let stored = row.get(foreign_key).and_then(key_string);
                    instance.foreign_keys.insert(property.name.clone(), stored);
                    instance.references.insert(property.name.clone(), None);
                    instance.fetched.insert(property.name.clone(), false);
                }
                PropertyKind::ToMany { .. } => {
                    instance.fetched.insert(property.name.clone(), false);
                }
            }
        }

        let id = self.graph.insert(instance);
        self.identity.insert(identity, id);
        Ok((id, true))
    }

    /// Breadth-first relationship resolution.
    ///
    /// Freshly materialized instances get the nested spec (schema-eager
    /// relationships at minimum); instances reached again through an explicit
    /// nested directive get it too, so every nesting level is honored once.
    async fn resolve(&mut self, roots: Vec<InstanceId>, spec: FetchSpec) -> StorageResult<()> {
        let registry = Arc::clone(&self.registry);
        let mut queue = VecDeque::new();
        queue.push_back(Pending {
            instances: roots,
            spec,
            depth: 0,
        });

        while let Some(Pending { instances, spec, depth }) = queue.pop_front() {
            if instances.is_empty() {
                continue;
            }
            if depth >= self.max_depth {
                tracing::warn!(depth, "Fetch depth limit reached, leaving relationships unresolved");
                continue;
            }

            let mut by_template: BTreeMap<String, Vec<InstanceId>> = BTreeMap::new();
            for id in instances {
                let template = self.graph.instance(id)?.template().to_string();
                by_template.entry(template).or_default().push(id);
            }

            for (template, members) in by_template {
                let schema = registry.template(&template)?;
                for property in schema.relationships() {
                    let directive = spec.effective(schema, &property.name);
                    if directive == FetchDirective::Skip {
                        continue;
                    }

                    let unresolved: Vec<InstanceId> = members
                        .iter()
                        .copied()
                        .filter(|m| {
                            self.graph
                                .instance(*m)
                                .map(|i| !i.is_fetched(&property.name) && !i.is_new())
                                .unwrap_or(false)
                        })
                        .collect();

                    let fresh = match &property.kind {
                        PropertyKind::ToOne { target, .. } => {
                            self.resolve_to_one(&unresolved, &property.name, target).await?
                        }
                        PropertyKind::ToMany { .. } => {
                            self.resolve_to_many(schema, &unresolved, &property.name).await?
                        }
                        PropertyKind::Scalar { .. } => Vec::new(),
                    };

                    let next = if matches!(directive, FetchDirective::Nested(_)) {
                        self.related(&members, &property.name)
                    } else {
                        fresh
                    };
                    queue.push_back(Pending {
                        instances: next,
                        spec: directive.nested(),
                        depth: depth + 1,
                    });
                }
            }
        }
        Ok(())
    }

    /// Every instance reachable from `owners` through one relationship.
    fn related(&self, owners: &[InstanceId], relationship: &str) -> Vec<InstanceId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for owner in owners {
            let members = self
                .graph
                .reference(*owner, relationship)
                .into_iter()
                .chain(self.graph.collection(*owner, relationship).iter().copied());
            for member in members {
                if seen.insert(member) {
                    out.push(member);
                }
            }
        }
        out
    }

    /// Resolves a to-one relationship for `owners` with one query.
    ///
    /// Returns the instances materialized by this call.
    async fn resolve_to_one(
        &mut self,
        owners: &[InstanceId],
        relationship: &str,
        target: &str,
    ) -> StorageResult<Vec<InstanceId>> {
        if owners.is_empty() {
            return Ok(Vec::new());
        }
        let registry = Arc::clone(&self.registry);
        let target_schema = registry.template(target)?;
        let storage = target_schema.storage_name().to_string();

        let mut wanted = Vec::new();
        for owner in owners {
            if let Some(key) = self.graph.instance(*owner)?.foreign_key(relationship)
                && !self.identity.contains_key(&(storage.clone(), key.to_string()))
                && !wanted.contains(&Value::String(key.to_string()))
            {
                wanted.push(Value::String(key.to_string()));
            }
        }

        let mut fresh = Vec::new();
        if !wanted.is_empty() {
            let predicate = translate_expr(
                target_schema,
                FilterExpr::in_list(PRIMARY_KEY, wanted),
                self.dialect,
            )?;
            let rows = self
                .conn
                .query(&storage, &predicate, &SortSpec::default(), Pagination::default())
                .await?;
            for row in rows {
                let (id, is_fresh) = self.materialize(target_schema, row)?;
                if is_fresh {
                    fresh.push(id);
                }
            }
        }

        for owner in owners {
            let resolved = self
                .graph
                .instance(*owner)?
                .foreign_key(relationship)
                .and_then(|key| self.identity.get(&(storage.clone(), key.to_string())).copied());
            let instance = self.graph.instance_mut(*owner)?;
            instance.references.insert(relationship.to_string(), resolved);
            instance.fetched.insert(relationship.to_string(), true);
        }
        Ok(fresh)
    }

    /// Resolves a to-many relationship for `owners` with one query.
    ///
    /// Children that hold a to-one relationship over the same foreign key get
    /// it pointed back at their owner. Returns the instances materialized by
    /// this call.
    async fn resolve_to_many(
        &mut self,
        owner_schema: &TemplateSchema,
        owners: &[InstanceId],
        relationship: &str,
    ) -> StorageResult<Vec<InstanceId>> {
        if owners.is_empty() {
            return Ok(Vec::new());
        }
        let (target, foreign_key, filter) = match owner_schema.property(relationship).map(|p| &p.kind) {
            Some(PropertyKind::ToMany {
                target,
                foreign_key,
                filter,
                ..
            }) => (target.clone(), foreign_key.clone(), filter.clone()),
            _ => {
                return Err(ValidationError::UnknownRelationship {
                    template: owner_schema.name().to_string(),
                    relationship: relationship.to_string(),
                }
                .into());
            }
        };
        let registry = Arc::clone(&self.registry);
        let target_schema = registry.template(&target)?;

        let mut parent_keys = Vec::new();
        for owner in owners {
            if let Some(key) = self.graph.instance(*owner)?.id() {
                parent_keys.push(Value::String(key.to_string()));
            }
        }

        let mut expr = FilterExpr::in_list(foreign_key.clone(), parent_keys);
        if let Some(filter) = &filter {
            expr = expr.and(FilterExpr::eq(filter.property.clone(), filter.value.clone()));
        }
        let predicate = translate_expr(target_schema, expr, self.dialect)?;
        let rows = self
            .conn
            .query(
                target_schema.storage_name(),
                &predicate,
                &SortSpec::default(),
                Pagination::default(),
            )
            .await?;

        let mut grouped: HashMap<String, Vec<InstanceId>> = HashMap::new();
        let mut fresh = Vec::new();
        for row in rows {
            let parent = row.get(&foreign_key).and_then(key_string);
            let (child, is_fresh) = self.materialize(target_schema, row)?;
            if is_fresh {
                fresh.push(child);
            }
            if let Some(parent) = parent {
                grouped.entry(parent).or_default().push(child);
            }
        }

        for owner in owners {
            let key = self.graph.instance(*owner)?.id().map(str::to_string);
            let children = key.and_then(|k| grouped.remove(&k)).unwrap_or_default();
            let snapshot = children
                .iter()
                .filter_map(|c| self.graph.instance(*c).ok().and_then(|i| i.id().map(str::to_string)))
                .collect();

            for child in &children {
                self.link_back(*child, owner_schema, &foreign_key, *owner)?;
            }

            let instance = self.graph.instance_mut(*owner)?;
            instance.collections.insert(relationship.to_string(), children);
            instance.snapshots.insert(relationship.to_string(), snapshot);
            instance.fetched.insert(relationship.to_string(), true);
        }

        tracing::debug!(
            template = %owner_schema.name(),
            relationship = %relationship,
            owners = owners.len(),
            "Resolved to-many relationship"
        );
        Ok(fresh)
    }

    fn link_back(
        &mut self,
        child: InstanceId,
        owner_schema: &TemplateSchema,
        foreign_key: &str,
        owner: InstanceId,
    ) -> StorageResult<()> {
        let registry = Arc::clone(&self.registry);
        let child_schema = registry.template(self.graph.instance(child)?.template())?;
        let instance = self.graph.instance_mut(child)?;
        for property in child_schema.relationships() {
            if let PropertyKind::ToOne {
                target,
                foreign_key: fk,
                ..
            } = &property.kind
                && fk == foreign_key
                && owner_schema.is_a(target)
                && !instance.is_fetched(&property.name)
            {
                instance.references.insert(property.name.clone(), Some(owner));
                instance.fetched.insert(property.name.clone(), true);
            }
        }
        Ok(())
    }
}
