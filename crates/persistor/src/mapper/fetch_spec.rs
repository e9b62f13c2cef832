//! Fetch specifications.
//!
//! A fetch specification names the relationships to resolve eagerly:
//!
//! ```json
//! {"primaryAddresses": true, "roles": {"fetch": {"account": true}}, "referrers": false}
//! ```
//!
//! `true` resolves one level (plus schema-eager relationships below it),
//! `{"fetch": {...}}` resolves recursively, `false` suppresses a schema-eager
//! to-many relationship.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{StorageResult, ValidationError};
use crate::schema::{PropertyKind, SchemaRegistry, TemplateSchema};

/// What to do with one relationship during a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchDirective {
    Skip,
    Shallow,
    Nested(FetchSpec),
}

/// Parsed fetch specification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchSpec {
    entries: BTreeMap<String, FetchDirective>,
}

fn invalid(message: String) -> crate::error::StorageError {
    ValidationError::InvalidFetchSpec { message }.into()
}

impl FetchSpec {
    /// Resolves only schema-eager relationships.
    pub fn none() -> Self {
        Self::default()
    }

    /// Parses the JSON form.
    pub fn parse(value: &Value) -> StorageResult<Self> {
        let object = match value {
            Value::Null => return Ok(Self::none()),
            Value::Object(object) => object,
            other => return Err(invalid(format!("expected an object, got {}", other))),
        };

        let mut spec = Self::none();
        for (name, directive) in object {
            let directive = match directive {
                Value::Bool(true) => FetchDirective::Shallow,
                Value::Bool(false) | Value::Null => FetchDirective::Skip,
                Value::Object(inner) => match inner.get("fetch") {
                    None | Some(Value::Bool(true)) if inner.len() <= 1 => FetchDirective::Shallow,
                    Some(Value::Bool(false)) => FetchDirective::Skip,
                    Some(nested @ Value::Object(_)) => FetchDirective::Nested(Self::parse(nested)?),
                    _ => {
                        return Err(invalid(format!(
                            "{} must be true, false or {{\"fetch\": {{...}}}}",
                            name
                        )));
                    }
                },
                other => {
                    return Err(invalid(format!("invalid directive {} for {}", other, name)));
                }
            };
            spec.entries.insert(name.clone(), directive);
        }
        Ok(spec)
    }

    /// Adds a directive for one relationship.
    pub fn with(mut self, relationship: impl Into<String>, directive: FetchDirective) -> Self {
        self.entries.insert(relationship.into(), directive);
        self
    }

    /// Shorthand for a one-level fetch of a single relationship.
    pub fn only(relationship: impl Into<String>) -> Self {
        Self::none().with(relationship, FetchDirective::Shallow)
    }

    pub fn directive(&self, relationship: &str) -> Option<&FetchDirective> {
        self.entries.get(relationship)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks every named relationship exists, recursing into nested specs.
    pub fn validate(&self, registry: &SchemaRegistry, schema: &TemplateSchema) -> StorageResult<()> {
        for (name, directive) in &self.entries {
            // Polymorphic fetches may name relationships only subtypes declare.
            let property = std::iter::once(schema)
                .chain(schema.family().iter().filter_map(|f| registry.get(f)))
                .find_map(|s| s.property(name).filter(|p| p.is_relationship()))
                .ok_or_else(|| ValidationError::UnknownRelationship {
                    template: schema.name().to_string(),
                    relationship: name.clone(),
                })?;
            if let (FetchDirective::Nested(nested), Some(target)) = (directive, property.target()) {
                nested.validate(registry, registry.template(target)?)?;
            }
        }
        Ok(())
    }

    /// Effective directive for `relationship`, applying schema eagerness.
    ///
    /// Schema-eager to-one relationships are always resolved; schema-eager
    /// to-many relationships are resolved unless explicitly skipped.
    pub(crate) fn effective(&self, schema: &TemplateSchema, relationship: &str) -> FetchDirective {
        let property = match schema.property(relationship) {
            Some(p) => p,
            None => return FetchDirective::Skip,
        };
        match (self.directive(relationship), &property.kind) {
            (Some(FetchDirective::Skip), PropertyKind::ToOne { fetch_eager: true, .. }) => {
                FetchDirective::Shallow
            }
            (Some(directive), _) => directive.clone(),
            (None, _) if property.fetch_eager() => FetchDirective::Shallow,
            (None, _) => FetchDirective::Skip,
        }
    }
}

impl FetchDirective {
    /// Nested specification applied to the resolved instances.
    pub(crate) fn nested(&self) -> FetchSpec {
        match self {
            FetchDirective::Nested(spec) => spec.clone(),
            _ => FetchSpec::none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_shallow_and_nested() {
        let spec = FetchSpec::parse(&json!({
            "primaryAddresses": true,
            "referrers": false,
            "roles": {"fetch": {"account": {"fetch": {"roles": true}}}}
        }))
        .unwrap();

        assert_eq!(spec.directive("primaryAddresses"), Some(&FetchDirective::Shallow));
        assert_eq!(spec.directive("referrers"), Some(&FetchDirective::Skip));
        match spec.directive("roles") {
            Some(FetchDirective::Nested(nested)) => {
                assert!(matches!(
                    nested.directive("account"),
                    Some(FetchDirective::Nested(_))
                ));
            }
            other => panic!("expected nested, got {:?}", other),
        }
        assert_eq!(spec.directive("nope"), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(FetchSpec::parse(&json!(["roles"])).is_err());
        assert!(FetchSpec::parse(&json!({"roles": 3})).is_err());
        assert!(FetchSpec::parse(&json!({"roles": {"fetch": 3}})).is_err());
        assert!(FetchSpec::parse(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_builder() {
        let spec = FetchSpec::only("roles").with("account", FetchDirective::Skip);
        assert_eq!(spec.directive("roles"), Some(&FetchDirective::Shallow));
        assert_eq!(spec.directive("account"), Some(&FetchDirective::Skip));
    }
}
