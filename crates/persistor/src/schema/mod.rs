//! Schema registry and property metadata.
//!
//! - [`template`] - application-declared templates and typed properties
//! - [`declaration`] - storage declarations (targets, foreign keys, eagerness)
//! - [`registry`] - the resolved, immutable [`SchemaRegistry`]

pub mod declaration;
pub mod registry;
pub mod template;

pub use declaration::{
    ChildDeclaration, ParentDeclaration, RelationshipFilter, SchemaDocument, StorageDeclaration,
    StorageTarget,
};
pub use registry::{
    ColumnKind, PRIMARY_KEY, Property, PropertyKind, SchemaRegistry, SchemaRegistryBuilder,
    StorageColumn, TEMPLATE_COLUMN, TemplateSchema, VERSION_COLUMN,
};
pub use template::{PropertyDefinition, PropertyType, ScalarKind, Template};
