//! Property metadata for templates.
//!
//! A [`Template`] is the application's description of an entity type: its
//! name, optional supertype, and ordered property list. Each property is a
//! scalar, a single reference to another template, or an ordered collection
//! of another template. Storage details (foreign keys, eagerness, filters)
//! live in the storage declaration and are merged in by the registry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The scalar kinds a property may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    /// UTF-8 text.
    String,
    /// Integer or floating point number.
    Number,
    /// RFC 3339 timestamp or `YYYY-MM-DD` date, stored as text.
    Date,
    /// true/false.
    Boolean,
    /// Arbitrary JSON (arrays of scalars, small embedded objects).
    #[serde(alias = "Array", alias = "Object")]
    Json,
}

impl std::fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScalarKind::String => "string",
            ScalarKind::Number => "number",
            ScalarKind::Date => "date",
            ScalarKind::Boolean => "boolean",
            ScalarKind::Json => "json",
        };
        write!(f, "{}", name)
    }
}

impl ScalarKind {
    /// Returns true if `value` may be assigned to a property of this kind.
    ///
    /// Null is accepted by every kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ScalarKind::String, Value::String(_)) => true,
            (ScalarKind::Number, Value::Number(_)) => true,
            (ScalarKind::Boolean, Value::Bool(_)) => true,
            (ScalarKind::Date, Value::String(s)) => parse_date(s).is_some(),
            (ScalarKind::Json, _) => true,
            _ => false,
        }
    }

    /// Converts a stored column value back into its logical JSON form.
    ///
    /// Relational stores hand back booleans as integers and JSON as text;
    /// document stores hand back the original value, which passes through.
    pub fn decode(&self, value: Value) -> Value {
        match (self, value) {
            (ScalarKind::Boolean, Value::Number(n)) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
            (ScalarKind::Json, Value::String(text)) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            (_, other) => other,
        }
    }
}

fn parse_date(text: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(ts);
    }
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().fixed_offset())
}

/// The declared type of a template property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyType {
    /// A scalar value.
    Scalar(ScalarKind),
    /// A single reference to an instance of the target template.
    Reference(String),
    /// An ordered collection of instances of the target template.
    Collection(String),
}

/// One property of a template.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawPropertyDefinition")]
pub struct PropertyDefinition {
    /// Property name, also the column/field name for scalars.
    pub name: String,
    /// Declared type.
    pub ty: PropertyType,
}

/// Wire form of a property: exactly one of `type`, `ref`, `many`.
#[derive(Deserialize)]
struct RawPropertyDefinition {
    name: String,
    #[serde(rename = "type", default)]
    scalar: Option<ScalarKind>,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default)]
    many: Option<String>,
}

impl TryFrom<RawPropertyDefinition> for PropertyDefinition {
    type Error = String;

    fn try_from(raw: RawPropertyDefinition) -> Result<Self, Self::Error> {
        let ty = match (raw.scalar, raw.reference, raw.many) {
            (Some(kind), None, None) => PropertyType::Scalar(kind),
            (None, Some(target), None) => PropertyType::Reference(target),
            (None, None, Some(target)) => PropertyType::Collection(target),
            _ => {
                return Err(format!(
                    "property '{}' must declare exactly one of type, ref, many",
                    raw.name
                ));
            }
        };
        Ok(PropertyDefinition { name: raw.name, ty })
    }
}

/// An entity type as declared by the application.
///
/// # Example
///
/// ```
/// use helios_persistor::schema::{ScalarKind, Template};
///
/// let address = Template::new("Address")
///     .scalar("type", ScalarKind::String)
///     .scalar("lines", ScalarKind::Json)
///     .reference("customer", "Customer")
///     .collection("returnedMail", "ReturnedMail");
///
/// assert_eq!(address.properties.len(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Template {
    /// Template name.
    pub name: String,
    /// Supertype whose properties and storage this template inherits.
    #[serde(default)]
    pub extends: Option<String>,
    /// Ordered property list.
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

impl Template {
    /// Creates a template with no properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: None,
            properties: Vec::new(),
        }
    }

    /// Declares the supertype.
    pub fn extends(mut self, supertype: impl Into<String>) -> Self {
        self.extends = Some(supertype.into());
        self
    }

    /// Adds a scalar property.
    pub fn scalar(mut self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.properties.push(PropertyDefinition {
            name: name.into(),
            ty: PropertyType::Scalar(kind),
        });
        self
    }

    /// Adds a single-instance reference.
    pub fn reference(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.properties.push(PropertyDefinition {
            name: name.into(),
            ty: PropertyType::Reference(target.into()),
        });
        self
    }

    /// Adds an ordered collection.
    pub fn collection(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.properties.push(PropertyDefinition {
            name: name.into(),
            ty: PropertyType::Collection(target.into()),
        });
        self
    }
}
