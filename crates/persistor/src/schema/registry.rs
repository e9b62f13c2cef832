//! The schema registry.
//!
//! Built once at startup from [`Template`]s and [`StorageDeclaration`]s, then
//! shared read-only. Resolution merges inherited properties and declarations,
//! checks every relationship against a declared foreign key, and derives the
//! column layout of every storage target.

use std::collections::{BTreeMap, HashSet};

use crate::error::{StorageResult, ValidationError};

use super::declaration::{RelationshipFilter, SchemaDocument, StorageDeclaration, StorageTarget};
use super::template::{PropertyDefinition, PropertyType, ScalarKind, Template};

/// Primary-key column/field present on every storage target.
pub const PRIMARY_KEY: &str = "_id";

/// Optimistic-locking version column.
pub const VERSION_COLUMN: &str = "__version__";

/// Concrete-template discriminator column.
pub const TEMPLATE_COLUMN: &str = "_template";

/// A resolved property descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    /// A scalar column.
    Scalar { kind: ScalarKind },
    /// This template holds `foreign_key` pointing at `target`.
    ToOne {
        target: String,
        foreign_key: String,
        fetch_eager: bool,
    },
    /// `target` holds `foreign_key` pointing back at this template.
    ToMany {
        target: String,
        foreign_key: String,
        filter: Option<RelationshipFilter>,
        prune_orphans: bool,
        fetch_eager: bool,
    },
}

/// A named, resolved property.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub kind: PropertyKind,
}

impl Property {
    /// Target template of a relationship property.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            PropertyKind::Scalar { .. } => None,
            PropertyKind::ToOne { target, .. } | PropertyKind::ToMany { target, .. } => {
                Some(target)
            }
        }
    }

    /// Whether the relationship is resolved on every fetch.
    pub fn fetch_eager(&self) -> bool {
        match &self.kind {
            PropertyKind::Scalar { .. } => false,
            PropertyKind::ToOne { fetch_eager, .. } | PropertyKind::ToMany { fetch_eager, .. } => {
                *fetch_eager
            }
        }
    }

    /// True for to-one and to-many properties.
    pub fn is_relationship(&self) -> bool {
        !matches!(self.kind, PropertyKind::Scalar { .. })
    }
}

/// A template after schema resolution.
#[derive(Debug, Clone)]
pub struct TemplateSchema {
    name: String,
    ancestors: Vec<String>,
    target: StorageTarget,
    properties: Vec<Property>,
    cascade_save: bool,
    family: Vec<String>,
    shared_target: bool,
}

impl TemplateSchema {
    /// Template name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Immediate supertype, if any.
    pub fn supertype(&self) -> Option<&str> {
        self.ancestors.last().map(String::as_str)
    }

    /// Table or collection name.
    pub fn storage_name(&self) -> &str {
        &self.target.name
    }

    /// Parsed storage target including the backend hint.
    pub fn target(&self) -> &StorageTarget {
        &self.target
    }

    /// Ordered properties, inherited ones first.
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Relationship properties only.
    pub fn relationships(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter().filter(|p| p.is_relationship())
    }

    pub fn cascade_save(&self) -> bool {
        self.cascade_save
    }

    /// This template and every descendant stored in the same target.
    pub fn family(&self) -> &[String] {
        &self.family
    }

    /// True when several templates share this template's storage target.
    pub fn shares_target(&self) -> bool {
        self.shared_target
    }

    /// True if this template is `other` or inherits from it.
    pub fn is_a(&self, other: &str) -> bool {
        self.name == other || self.ancestors.iter().any(|a| a == other)
    }
}

/// What a storage column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    PrimaryKey,
    Version,
    Discriminator,
    Scalar(ScalarKind),
    ForeignKey,
}

/// One column of a storage target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageColumn {
    pub name: String,
    pub kind: ColumnKind,
}

/// Immutable registry of resolved templates and storage layouts.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    templates: BTreeMap<String, TemplateSchema>,
    targets: BTreeMap<String, Vec<StorageColumn>>,
}

impl SchemaRegistry {
    /// Starts an explicit registration sequence.
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Builds a registry from a complete schema document.
    pub fn from_document(document: SchemaDocument) -> StorageResult<Self> {
        let mut builder = Self::builder();
        for template in document.templates {
            builder = builder.template(template);
        }
        for (name, declaration) in document.schema {
            builder = builder.declare(name, declaration);
        }
        builder.build()
    }

    /// Parses and builds a registry from JSON text.
    pub fn from_json_str(text: &str) -> StorageResult<Self> {
        let document: SchemaDocument =
            serde_json::from_str(text).map_err(|e| ValidationError::InvalidSchema {
                message: e.to_string(),
            })?;
        Self::from_document(document)
    }

    /// Looks up a template, failing with a validation error if unknown.
    pub fn template(&self, name: &str) -> StorageResult<&TemplateSchema> {
        self.templates.get(name).ok_or_else(|| {
            ValidationError::UnknownTemplate {
                template: name.to_string(),
            }
            .into()
        })
    }

    pub fn get(&self, name: &str) -> Option<&TemplateSchema> {
        self.templates.get(name)
    }

    pub fn templates(&self) -> impl Iterator<Item = &TemplateSchema> {
        self.templates.values()
    }

    /// Names of every registered template.
    pub fn registered_templates(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    /// Every storage target with its column layout.
    pub fn storage_targets(&self) -> impl Iterator<Item = (&str, &[StorageColumn])> {
        self.targets
            .iter()
            .map(|(name, cols)| (name.as_str(), cols.as_slice()))
    }

    pub fn columns(&self, target: &str) -> Option<&[StorageColumn]> {
        self.targets.get(target).map(Vec::as_slice)
    }

    /// Table or collection backing `template`.
    pub fn table_name(&self, template: &str) -> StorageResult<&str> {
        Ok(self.template(template)?.storage_name())
    }

    /// Foreign-key column of a to-one relationship.
    pub fn parent_key(&self, template: &str, relationship: &str) -> StorageResult<&str> {
        match self.relationship(template, relationship)?.kind {
            PropertyKind::ToOne {
                ref foreign_key, ..
            } => Ok(foreign_key),
            _ => Err(unknown_relationship(template, relationship)),
        }
    }

    /// Foreign-key column (on the child) of a to-many relationship.
    pub fn child_key(&self, template: &str, relationship: &str) -> StorageResult<&str> {
        match self.relationship(template, relationship)?.kind {
            PropertyKind::ToMany {
                ref foreign_key, ..
            } => Ok(foreign_key),
            _ => Err(unknown_relationship(template, relationship)),
        }
    }

    pub fn primary_key(&self) -> &'static str {
        PRIMARY_KEY
    }

    /// Looks up a relationship property.
    pub fn relationship(&self, template: &str, relationship: &str) -> StorageResult<&Property> {
        self.template(template)?
            .property(relationship)
            .filter(|p| p.is_relationship())
            .ok_or_else(|| unknown_relationship(template, relationship))
    }

    /// Picks the concrete template for a row fetched through `base`.
    pub fn concrete<'a>(&'a self, base: &'a TemplateSchema, discriminator: Option<&str>) -> &'a TemplateSchema {
        discriminator
            .filter(|name| base.family().iter().any(|f| f == name))
            .and_then(|name| self.templates.get(name))
            .unwrap_or(base)
    }
}

fn unknown_relationship(template: &str, relationship: &str) -> crate::error::StorageError {
    ValidationError::UnknownRelationship {
        template: template.to_string(),
        relationship: relationship.to_string(),
    }
    .into()
}

fn invalid(message: impl Into<String>) -> crate::error::StorageError {
    ValidationError::InvalidSchema {
        message: message.into(),
    }
    .into()
}

/// Collects templates and declarations, then resolves them in one step.
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    templates: Vec<Template>,
    declarations: BTreeMap<String, StorageDeclaration>,
}

impl SchemaRegistryBuilder {
    /// Registers a template's property metadata.
    pub fn template(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }

    /// Registers a template's storage declaration.
    pub fn declare(mut self, name: impl Into<String>, declaration: StorageDeclaration) -> Self {
        self.declarations.insert(name.into(), declaration);
        self
    }

    /// Resolves everything registered so far.
    pub fn build(self) -> StorageResult<SchemaRegistry> {
        let mut by_name: BTreeMap<String, Template> = BTreeMap::new();
        for template in self.templates {
            if by_name.contains_key(&template.name) {
                return Err(invalid(format!("template {} registered twice", template.name)));
            }
            by_name.insert(template.name.clone(), template);
        }

        if let Some(name) = self.declarations.keys().find(|n| !by_name.contains_key(*n)) {
            return Err(invalid(format!("storage declared for unknown template {}", name)));
        }

        let mut templates = BTreeMap::new();
        for name in by_name.keys() {
            let chain = ancestry(&by_name, name)?;
            let schema = resolve(&by_name, &self.declarations, name, &chain)?;
            templates.insert(name.clone(), schema);
        }

        // Families: descendants sharing the target, discriminated by `_template`.
        let snapshot: Vec<(String, Vec<String>, String)> = templates
            .values()
            .map(|t: &TemplateSchema| (t.name.clone(), t.ancestors.clone(), t.target.name.clone()))
            .collect();
        for schema in templates.values_mut() {
            schema.family = snapshot
                .iter()
                .filter(|(name, ancestors, target)| {
                    *target == schema.target.name
                        && (*name == schema.name || ancestors.contains(&schema.name))
                })
                .map(|(name, _, _)| name.clone())
                .collect();
            schema.shared_target = snapshot
                .iter()
                .filter(|(_, _, target)| *target == schema.target.name)
                .count()
                > 1;
        }

        for schema in templates.values() {
            for property in schema.relationships() {
                if let Some(target) = property.target()
                    && !templates.contains_key(target)
                {
                    return Err(invalid(format!(
                        "{}.{} targets unknown template {}",
                        schema.name, property.name, target
                    )));
                }
            }
        }

        let targets = layout(&templates)?;

        tracing::debug!(
            templates = templates.len(),
            targets = targets.len(),
            "Resolved schema registry"
        );

        Ok(SchemaRegistry { templates, targets })
    }
}

/// Supertype chain of `name`, root first, excluding `name` itself.
fn ancestry(by_name: &BTreeMap<String, Template>, name: &str) -> StorageResult<Vec<String>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::from([name.to_string()]);
    let mut current = by_name.get(name).and_then(|t| t.extends.clone());

    while let Some(parent) = current {
        if !seen.insert(parent.clone()) {
            return Err(invalid(format!("inheritance cycle through {}", parent)));
        }
        let template = by_name
            .get(&parent)
            .ok_or_else(|| invalid(format!("{} extends unknown template {}", name, parent)))?;
        chain.push(parent);
        current = template.extends.clone();
    }

    chain.reverse();
    Ok(chain)
}

fn resolve(
    by_name: &BTreeMap<String, Template>,
    declarations: &BTreeMap<String, StorageDeclaration>,
    name: &str,
    chain: &[String],
) -> StorageResult<TemplateSchema> {
    let mut merged = StorageDeclaration::default();
    let mut definitions: Vec<PropertyDefinition> = Vec::new();

    for level in chain.iter().map(String::as_str).chain(std::iter::once(name)) {
        if let Some(decl) = declarations.get(level) {
            if decl.document_of.is_some() {
                merged.document_of = decl.document_of.clone();
            }
            merged.parents.extend(decl.parents.clone());
            merged.children.extend(decl.children.clone());
            merged.cascade_save |= decl.cascade_save;
        }
        if let Some(template) = by_name.get(level) {
            for definition in &template.properties {
                match definitions.iter_mut().find(|d| d.name == definition.name) {
                    Some(existing) => *existing = definition.clone(),
                    None => definitions.push(definition.clone()),
                }
            }
        }
    }

    let mut properties = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let kind = match definition.ty {
            PropertyType::Scalar(kind) => PropertyKind::Scalar { kind },
            PropertyType::Reference(target) => {
                let decl = merged.parents.get(&definition.name).ok_or_else(|| {
                    invalid(format!("{}.{} has no parent declaration", name, definition.name))
                })?;
                PropertyKind::ToOne {
                    target,
                    foreign_key: decl.id.clone(),
                    fetch_eager: decl.fetch,
                }
            }
            PropertyType::Collection(target) => {
                let decl = merged.children.get(&definition.name).ok_or_else(|| {
                    invalid(format!("{}.{} has no child declaration", name, definition.name))
                })?;
                PropertyKind::ToMany {
                    target,
                    foreign_key: decl.id.clone(),
                    filter: decl.filter.clone(),
                    prune_orphans: decl.prune_orphans,
                    fetch_eager: decl.fetch,
                }
            }
        };
        if is_reserved(&definition.name) {
            return Err(invalid(format!("{}.{} uses a reserved name", name, definition.name)));
        }
        properties.push(Property {
            name: definition.name,
            kind,
        });
    }

    for declared in merged.parents.keys().chain(merged.children.keys()) {
        if !properties.iter().any(|p| &p.name == declared && p.is_relationship()) {
            return Err(invalid(format!(
                "{} declares storage for {}, which is not a relationship property",
                name, declared
            )));
        }
    }

    let target = StorageTarget::parse(merged.document_of.as_deref().unwrap_or(name));

    Ok(TemplateSchema {
        name: name.to_string(),
        ancestors: chain.to_vec(),
        target,
        properties,
        cascade_save: merged.cascade_save,
        family: Vec::new(),
        shared_target: false,
    })
}

fn is_reserved(name: &str) -> bool {
    matches!(name, PRIMARY_KEY | VERSION_COLUMN | TEMPLATE_COLUMN)
}

/// Derives the column layout of every storage target.
fn layout(
    templates: &BTreeMap<String, TemplateSchema>,
) -> StorageResult<BTreeMap<String, Vec<StorageColumn>>> {
    let mut targets: BTreeMap<String, Vec<StorageColumn>> = BTreeMap::new();

    fn add(columns: &mut Vec<StorageColumn>, name: &str, kind: ColumnKind) -> StorageResult<()> {
        match columns.iter().find(|c| c.name == name) {
            Some(existing) if existing.kind == kind => Ok(()),
            Some(existing) => Err(invalid(format!(
                "column {} declared as both {:?} and {:?}",
                name, existing.kind, kind
            ))),
            None => {
                columns.push(StorageColumn {
                    name: name.to_string(),
                    kind,
                });
                Ok(())
            }
        }
    }

    for schema in templates.values() {
        let columns = targets.entry(schema.target.name.clone()).or_insert_with(|| {
            vec![
                StorageColumn {
                    name: PRIMARY_KEY.to_string(),
                    kind: ColumnKind::PrimaryKey,
                },
                StorageColumn {
                    name: VERSION_COLUMN.to_string(),
                    kind: ColumnKind::Version,
                },
                StorageColumn {
                    name: TEMPLATE_COLUMN.to_string(),
                    kind: ColumnKind::Discriminator,
                },
            ]
        });
        for property in &schema.properties {
            match &property.kind {
                PropertyKind::Scalar { kind } => add(columns, &property.name, ColumnKind::Scalar(*kind))?,
                PropertyKind::ToOne { foreign_key, .. } => {
                    add(columns, foreign_key, ColumnKind::ForeignKey)?
                }
                PropertyKind::ToMany { .. } => {}
            }
        }
    }

    // Child-side foreign keys land on the child's target.
    for schema in templates.values() {
        for property in &schema.properties {
            if let PropertyKind::ToMany {
                target,
                foreign_key,
                filter,
                ..
            } = &property.kind
            {
                let child = &templates[target];
                if let Some(filter) = filter
                    && !matches!(
                        child.property(&filter.property).map(|p| &p.kind),
                        Some(PropertyKind::Scalar { .. })
                    )
                {
                    return Err(invalid(format!(
                        "{}.{} filters on {}.{}, which is not a scalar property",
                        schema.name, property.name, target, filter.property
                    )));
                }
                let columns = targets
                    .get_mut(&child.target.name)
                    .ok_or_else(|| invalid(format!("no storage for {}", target)))?;
                add(columns, foreign_key, ColumnKind::ForeignKey)?;
            }
        }
    }

    Ok(targets)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::declaration::{ChildDeclaration, ParentDeclaration};

    fn banking_registry() -> SchemaRegistry {
        let mut customer = StorageDeclaration {
            document_of: Some("pg/customer".to_string()),
            ..Default::default()
        };
        customer.children.insert(
            "primaryAddresses".to_string(),
            ChildDeclaration {
                id: "customer_id".to_string(),
                fetch: true,
                filter: Some(RelationshipFilter {
                    property: "type".to_string(),
                    value: json!("primary"),
                }),
                prune_orphans: true,
            },
        );
        let mut address = StorageDeclaration {
            document_of: Some("pg/address".to_string()),
            ..Default::default()
        };
        address.parents.insert(
            "customer".to_string(),
            ParentDeclaration {
                id: "customer_id".to_string(),
                fetch: false,
            },
        );
        let mut transaction = StorageDeclaration {
            document_of: Some("pg/transaction".to_string()),
            ..Default::default()
        };
        transaction.parents.insert(
            "account".to_string(),
            ParentDeclaration {
                id: "account_id".to_string(),
                fetch: true,
            },
        );

        SchemaRegistry::builder()
            .template(
                Template::new("Customer")
                    .scalar("firstName", ScalarKind::String)
                    .collection("primaryAddresses", "Address"),
            )
            .template(
                Template::new("Address")
                    .scalar("type", ScalarKind::String)
                    .reference("customer", "Customer"),
            )
            .template(Template::new("Account").scalar("number", ScalarKind::Number))
            .template(
                Template::new("Transaction")
                    .scalar("amount", ScalarKind::Number)
                    .reference("account", "Account"),
            )
            .template(Template::new("Debit").extends("Transaction"))
            .template(Template::new("Credit").extends("Transaction"))
            .declare("Customer", customer)
            .declare("Address", address)
            .declare("Transaction", transaction)
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolves_relationships() {
        let registry = banking_registry();
        let customer = registry.template("Customer").unwrap();
        assert_eq!(customer.storage_name(), "customer");
        assert_eq!(customer.target().backend.as_deref(), Some("pg"));

        match &customer.property("primaryAddresses").unwrap().kind {
            PropertyKind::ToMany {
                target,
                foreign_key,
                prune_orphans,
                fetch_eager,
                filter,
            } => {
                assert_eq!(target, "Address");
                assert_eq!(foreign_key, "customer_id");
                assert!(*prune_orphans);
                assert!(*fetch_eager);
                assert_eq!(filter.as_ref().unwrap().property, "type");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_subtypes_inherit_storage_and_properties() {
        let registry = banking_registry();
        let debit = registry.template("Debit").unwrap();
        assert_eq!(debit.storage_name(), "transaction");
        assert_eq!(debit.supertype(), Some("Transaction"));
        assert!(debit.property("amount").is_some());
        assert!(debit.property("account").unwrap().fetch_eager());
        assert!(debit.shares_target());
        assert!(debit.is_a("Transaction"));

        let transaction = registry.template("Transaction").unwrap();
        assert_eq!(transaction.family().len(), 3);
        assert_eq!(registry.concrete(transaction, Some("Debit")).name(), "Debit");
        assert_eq!(registry.concrete(transaction, Some("Nope")).name(), "Transaction");
    }

    #[test]
    fn test_key_helpers() {
        let registry = banking_registry();
        assert_eq!(registry.table_name("Address").unwrap(), "address");
        assert_eq!(registry.parent_key("Address", "customer").unwrap(), "customer_id");
        assert_eq!(
            registry.child_key("Customer", "primaryAddresses").unwrap(),
            "customer_id"
        );
        assert_eq!(registry.primary_key(), "_id");
        assert!(registry.parent_key("Customer", "primaryAddresses").is_err());
        assert!(registry.registered_templates().contains(&"Customer"));
    }

    #[test]
    fn test_layout_includes_child_foreign_keys() {
        let registry = banking_registry();
        let columns = registry.columns("address").unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(&names[..3], &["_id", "__version__", "_template"]);
        assert!(names.contains(&"type"));
        assert!(names.contains(&"customer_id"));
        assert_eq!(names.iter().filter(|n| **n == "customer_id").count(), 1);
    }

    #[test]
    fn test_missing_parent_declaration_is_rejected() {
        let err = SchemaRegistry::builder()
            .template(Template::new("Role").reference("customer", "Customer"))
            .template(Template::new("Customer"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no parent declaration"));
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let mut decl = StorageDeclaration::default();
        decl.parents.insert(
            "account".to_string(),
            ParentDeclaration {
                id: "account_id".to_string(),
                fetch: false,
            },
        );
        let err = SchemaRegistry::builder()
            .template(Template::new("Role").reference("account", "Account"))
            .declare("Role", decl)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown template Account"));
    }

    #[test]
    fn test_inheritance_cycle_is_rejected() {
        let err = SchemaRegistry::builder()
            .template(Template::new("A").extends("B"))
            .template(Template::new("B").extends("A"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_from_json_str() {
        let registry = SchemaRegistry::from_json_str(
            r#"{
                "templates": [
                    {"name": "Customer", "properties": [{"name": "firstName", "type": "String"}]}
                ],
                "schema": {"Customer": {"documentOf": "mongo/customers"}}
            }"#,
        )
        .unwrap();
        assert_eq!(registry.table_name("Customer").unwrap(), "customers");
        assert!(registry.template("Nope").is_err());
    }
}
