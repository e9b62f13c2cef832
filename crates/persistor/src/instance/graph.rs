//! Arena of instances for one unit of work.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{StorageResult, ValidationError};
use crate::schema::{PRIMARY_KEY, PropertyKind, SchemaRegistry, TEMPLATE_COLUMN, TemplateSchema, VERSION_COLUMN};

use super::{Instance, InstanceId, Tracking};

/// Owns the instances created or fetched by one task.
///
/// Property writes go through the graph so they can be checked against the
/// template's property metadata. Writes never mark an instance dirty; that is
/// the job of `Transaction::set_dirty`.
#[derive(Debug, Clone)]
pub struct ObjectGraph {
    registry: Arc<SchemaRegistry>,
    instances: Vec<Instance>,
}

impl ObjectGraph {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            instances: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Creates a new, unsaved instance of `template`.
    ///
    /// All relationships of a new instance count as fetched: there is nothing
    /// stored to resolve them from.
    pub fn create(&mut self, template: &str) -> StorageResult<InstanceId> {
        let schema = self.registry.template(template)?;
        let mut instance = Instance::new(template, None, Tracking::unsaved());
        for property in schema.relationships() {
            instance.fetched.insert(property.name.clone(), true);
            match property.kind {
                PropertyKind::ToOne { .. } => {
                    instance.references.insert(property.name.clone(), None);
                }
                PropertyKind::ToMany { .. } => {
                    instance.collections.insert(property.name.clone(), Vec::new());
                }
                PropertyKind::Scalar { .. } => {}
            }
        }
        Ok(self.insert(instance))
    }

    pub(crate) fn insert(&mut self, instance: Instance) -> InstanceId {
        self.instances.push(instance);
        InstanceId(self.instances.len() - 1)
    }

    pub fn instance(&self, id: InstanceId) -> StorageResult<&Instance> {
        self.instances.get(id.0).ok_or_else(|| {
            ValidationError::UnknownInstance { instance: id.0 }.into()
        })
    }

    pub(crate) fn instance_mut(&mut self, id: InstanceId) -> StorageResult<&mut Instance> {
        self.instances.get_mut(id.0).ok_or_else(|| {
            ValidationError::UnknownInstance { instance: id.0 }.into()
        })
    }

    /// Resolved schema of an instance's concrete template.
    pub fn schema_of(&self, id: InstanceId) -> StorageResult<&TemplateSchema> {
        self.registry.template(self.instance(id)?.template())
    }

    /// Handles of every instance in the graph.
    pub fn ids(&self) -> impl Iterator<Item = InstanceId> + use<> {
        (0..self.instances.len()).map(InstanceId)
    }

    /// First instance of `template` (or a subtype) with stored identity `id`.
    pub fn find(&self, template: &str, id: &str) -> Option<InstanceId> {
        self.instances
            .iter()
            .position(|i| {
                i.id.as_deref() == Some(id)
                    && self
                        .registry
                        .get(&i.template)
                        .is_some_and(|s| s.is_a(template))
            })
            .map(InstanceId)
    }

    /// Scalar value of a property, `Null` when unset.
    pub fn get(&self, id: InstanceId, property: &str) -> StorageResult<&Value> {
        Ok(self.instance(id)?.value(property))
    }

    /// Assigns a scalar property, checking its declared kind.
    pub fn set(&mut self, id: InstanceId, property: &str, value: impl Into<Value>) -> StorageResult<()> {
        let value = value.into();
        let registry = Arc::clone(&self.registry);
        let schema = registry.template(self.instance(id)?.template())?;
        match schema.property(property).map(|p| &p.kind) {
            Some(PropertyKind::Scalar { kind }) => {
                if !kind.accepts(&value) {
                    return Err(ValidationError::WrongKind {
                        template: schema.name().to_string(),
                        property: property.to_string(),
                        expected: kind.to_string(),
                        actual: value.to_string(),
                    }
                    .into());
                }
            }
            _ => {
                return Err(ValidationError::UnknownProperty {
                    template: schema.name().to_string(),
                    property: property.to_string(),
                }
                .into());
            }
        }
        self.instance_mut(id)?.values.insert(property.to_string(), value);
        Ok(())
    }

    /// Current target of a to-one relationship, if resolved.
    pub fn reference(&self, id: InstanceId, relationship: &str) -> Option<InstanceId> {
        self.instance(id)
            .ok()
            .and_then(|i| i.references.get(relationship).copied().flatten())
    }

    /// Points a to-one relationship at `target`, or clears it with `None`.
    ///
    /// The relationship counts as fetched afterwards, so a cleared reference
    /// is written as a null foreign key.
    pub fn set_reference(
        &mut self,
        id: InstanceId,
        relationship: &str,
        target: Option<InstanceId>,
    ) -> StorageResult<()> {
        let expected = self.relationship_target(id, relationship, false)?;
        if let Some(target) = target {
            self.check_target(target, &expected)?;
        }
        let instance = self.instance_mut(id)?;
        instance.references.insert(relationship.to_string(), target);
        instance.fetched.insert(relationship.to_string(), true);
        Ok(())
    }

    /// Members of a to-many relationship in order; empty when unresolved.
    pub fn collection(&self, id: InstanceId, relationship: &str) -> &[InstanceId] {
        self.instances
            .get(id.0)
            .and_then(|i| i.collections.get(relationship))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Appends `child` to a to-many relationship.
    pub fn push(&mut self, id: InstanceId, relationship: &str, child: InstanceId) -> StorageResult<()> {
        let expected = self.relationship_target(id, relationship, true)?;
        self.check_target(child, &expected)?;
        let members = self
            .instance_mut(id)?
            .collections
            .entry(relationship.to_string())
            .or_default();
        if !members.contains(&child) {
            members.push(child);
        }
        Ok(())
    }

    /// Replaces the members of a to-many relationship.
    pub fn set_collection(
        &mut self,
        id: InstanceId,
        relationship: &str,
        children: Vec<InstanceId>,
    ) -> StorageResult<()> {
        let expected = self.relationship_target(id, relationship, true)?;
        for child in &children {
            self.check_target(*child, &expected)?;
        }
        let instance = self.instance_mut(id)?;
        instance.collections.insert(relationship.to_string(), children);
        instance.fetched.insert(relationship.to_string(), true);
        Ok(())
    }

    /// Removes `child` from a to-many relationship, returning whether it was present.
    pub fn remove(&mut self, id: InstanceId, relationship: &str, child: InstanceId) -> StorageResult<bool> {
        self.relationship_target(id, relationship, true)?;
        let members = self
            .instance_mut(id)?
            .collections
            .entry(relationship.to_string())
            .or_default();
        let before = members.len();
        members.retain(|c| *c != child);
        Ok(members.len() != before)
    }

    fn relationship_target(&self, id: InstanceId, relationship: &str, many: bool) -> StorageResult<String> {
        let schema = self.schema_of(id)?;
        match schema.property(relationship).map(|p| &p.kind) {
            Some(PropertyKind::ToOne { target, .. }) if !many => Ok(target.clone()),
            Some(PropertyKind::ToMany { target, .. }) if many => Ok(target.clone()),
            _ => Err(ValidationError::UnknownRelationship {
                template: schema.name().to_string(),
                relationship: relationship.to_string(),
            }
            .into()),
        }
    }

    fn check_target(&self, target: InstanceId, expected: &str) -> StorageResult<()> {
        let schema = self.schema_of(target)?;
        if schema.is_a(expected) {
            Ok(())
        } else {
            Err(ValidationError::WrongKind {
                template: schema.name().to_string(),
                property: "(relationship member)".to_string(),
                expected: expected.to_string(),
                actual: schema.name().to_string(),
            }
            .into())
        }
    }

    /// Renders an instance and its resolved relationships as JSON.
    ///
    /// Instances already rendered higher up are emitted as `{"_ref": "<id>"}`.
    pub fn to_json(&self, id: InstanceId) -> StorageResult<Value> {
        let mut visiting = HashSet::new();
        self.render(id, &mut visiting)
    }

    fn render(&self, id: InstanceId, visiting: &mut HashSet<InstanceId>) -> StorageResult<Value> {
        let instance = self.instance(id)?;
        if !visiting.insert(id) {
            return Ok(serde_json::json!({ "_ref": instance.id.clone().unwrap_or_else(|| id.to_string()) }));
        }

        let mut object = Map::new();
        object.insert(TEMPLATE_COLUMN.to_string(), Value::String(instance.template.clone()));
        object.insert(
            PRIMARY_KEY.to_string(),
            instance.id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        object.insert(VERSION_COLUMN.to_string(), Value::from(instance.version()));

        let schema = self.schema_of(id)?;
        for property in schema.properties() {
            let rendered = match &property.kind {
                PropertyKind::Scalar { .. } => instance.value(&property.name).clone(),
                _ if !instance.is_fetched(&property.name) => continue,
                PropertyKind::ToOne { .. } => match self.reference(id, &property.name) {
                    Some(target) => self.render(target, visiting)?,
                    None => Value::Null,
                },
                PropertyKind::ToMany { .. } => Value::Array(
                    self.collection(id, &property.name)
                        .iter()
                        .map(|child| self.render(*child, visiting))
                        .collect::<StorageResult<_>>()?,
                ),
            };
            object.insert(property.name.clone(), rendered);
        }

        visiting.remove(&id);
        Ok(Value::Object(object))
    }
}
