//! Filter expression parsing.
//!
//! Filters are JSON objects in the familiar document-store style:
//!
//! ```json
//! {"type": {"$in": ["debit", "credit"]}, "amount": {"$gte": 200}}
//! {"$or": [{"type": "debit"}, {"amount": {"$lt": 50}}]}
//! {"firstName": {"$regex": "^sam", "$options": "i"}}
//! ```
//!
//! Every field inside one object is combined conjunctively, as are several
//! operators on the same field. `$or`/`$and` take lists of filter objects and
//! nest recursively.

use serde_json::{Map, Value};

use crate::error::{QueryError, StorageResult, ValidationError};

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// All sub-expressions must hold. An empty list matches everything.
    And(Vec<FilterExpr>),
    /// At least one sub-expression must hold.
    Or(Vec<FilterExpr>),
    /// A single constraint on one field.
    Field { field: String, condition: Condition },
}

/// A constraint on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Regex { pattern: String, options: String },
}

impl Condition {
    /// Document-store operator form of this condition.
    pub fn to_json(&self) -> Value {
        let (op, operand) = match self {
            Condition::Eq(v) => ("$eq", v.clone()),
            Condition::Ne(v) => ("$ne", v.clone()),
            Condition::Gt(v) => ("$gt", v.clone()),
            Condition::Gte(v) => ("$gte", v.clone()),
            Condition::Lt(v) => ("$lt", v.clone()),
            Condition::Lte(v) => ("$lte", v.clone()),
            Condition::In(vs) => ("$in", Value::Array(vs.clone())),
            Condition::Nin(vs) => ("$nin", Value::Array(vs.clone())),
            Condition::Regex { pattern, options } => {
                let mut object = Map::new();
                object.insert("$regex".to_string(), Value::String(pattern.clone()));
                if !options.is_empty() {
                    object.insert("$options".to_string(), Value::String(options.clone()));
                }
                return Value::Object(object);
            }
        };
        let mut object = Map::new();
        object.insert(op.to_string(), operand);
        Value::Object(object)
    }
}

/// Builds a regex pattern carrying the `$options` flags inline.
pub fn inline_regex(pattern: &str, options: &str) -> String {
    if options.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", options, pattern)
    }
}

const REGEX_OPTIONS: &[char] = &['i', 'm', 's', 'x'];

impl FilterExpr {
    /// Parses a JSON filter.
    ///
    /// Fails with [`QueryError::UnsupportedOperator`] for operators outside
    /// the supported set (including `$exists`), and with a validation error
    /// for structurally malformed filters.
    pub fn parse(filter: &Value) -> StorageResult<FilterExpr> {
        match filter {
            Value::Object(object) => parse_object(object),
            Value::Null => Ok(FilterExpr::And(Vec::new())),
            other => Err(invalid(format!("filter must be an object, got {}", other))),
        }
    }

    /// Equality on one field.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> FilterExpr {
        FilterExpr::Field {
            field: field.into(),
            condition: Condition::Eq(value.into()),
        }
    }

    /// Membership on one field.
    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> FilterExpr {
        FilterExpr::Field {
            field: field.into(),
            condition: Condition::In(values),
        }
    }

    /// Conjunction of `self` and `other`, flattening nested conjunctions.
    pub fn and(self, other: FilterExpr) -> FilterExpr {
        let mut items = match self {
            FilterExpr::And(items) => items,
            single => vec![single],
        };
        match other {
            FilterExpr::And(more) => items.extend(more),
            single => items.push(single),
        }
        FilterExpr::And(items)
    }

    /// Rewrites every field name in place.
    pub fn rename_fields(&mut self, rename: &impl Fn(&str) -> Option<String>) {
        match self {
            FilterExpr::And(items) | FilterExpr::Or(items) => {
                for item in items {
                    item.rename_fields(rename);
                }
            }
            FilterExpr::Field { field, .. } => {
                if let Some(renamed) = rename(field) {
                    *field = renamed;
                }
            }
        }
    }

    /// Canonical document-store query object.
    pub fn to_json(&self) -> Value {
        match self {
            FilterExpr::And(items) => {
                serde_json::json!({ "$and": items.iter().map(FilterExpr::to_json).collect::<Vec<_>>() })
            }
            FilterExpr::Or(items) => {
                serde_json::json!({ "$or": items.iter().map(FilterExpr::to_json).collect::<Vec<_>>() })
            }
            FilterExpr::Field { field, condition } => {
                let mut object = Map::new();
                object.insert(field.clone(), condition.to_json());
                Value::Object(object)
            }
        }
    }
}

fn invalid(message: String) -> crate::error::StorageError {
    ValidationError::InvalidFilter { message }.into()
}

fn unsupported(field: &str, operator: &Value) -> crate::error::StorageError {
    QueryError::UnsupportedOperator {
        field: field.to_string(),
        operator: operator.to_string(),
    }
    .into()
}

fn parse_object(object: &Map<String, Value>) -> StorageResult<FilterExpr> {
    let mut items = Vec::new();

    for (key, value) in object {
        match key.as_str() {
            "$or" | "$and" => {
                let list = value
                    .as_array()
                    .ok_or_else(|| invalid(format!("{} requires a list of filters", key)))?;
                if list.is_empty() {
                    return Err(invalid(format!("{} requires at least one filter", key)));
                }
                let parsed = list
                    .iter()
                    .map(FilterExpr::parse)
                    .collect::<StorageResult<Vec<_>>>()?;
                items.push(if key == "$or" {
                    FilterExpr::Or(parsed)
                } else {
                    FilterExpr::And(parsed)
                });
            }
            op if op.starts_with('$') => return Err(unsupported(key, value)),
            field => parse_field(field, value, &mut items)?,
        }
    }

    if items.len() == 1 {
        Ok(items.remove(0))
    } else {
        Ok(FilterExpr::And(items))
    }
}

fn parse_field(field: &str, value: &Value, items: &mut Vec<FilterExpr>) -> StorageResult<()> {
    let operators = match value {
        Value::Object(object) if object.keys().any(|k| k.starts_with('$')) => {
            if !object.keys().all(|k| k.starts_with('$')) {
                return Err(invalid(format!(
                    "{} mixes operators and plain fields",
                    field
                )));
            }
            object
        }
        literal => {
            items.push(FilterExpr::eq(field, literal.clone()));
            return Ok(());
        }
    };

    const SUPPORTED: &[&str] = &[
        "$in", "$nin", "$gt", "$gte", "$lt", "$lte", "$ne", "$eq", "$regex", "$options",
    ];
    if operators.keys().any(|op| !SUPPORTED.contains(&op.as_str())) {
        return Err(unsupported(field, value));
    }

    let push = |items: &mut Vec<FilterExpr>, condition: Condition| {
        items.push(FilterExpr::Field {
            field: field.to_string(),
            condition,
        });
    };

    for (op, operand) in operators {
        match op.as_str() {
            "$eq" => push(items, Condition::Eq(operand.clone())),
            "$ne" => push(items, Condition::Ne(operand.clone())),
            "$gt" => push(items, Condition::Gt(operand.clone())),
            "$gte" => push(items, Condition::Gte(operand.clone())),
            "$lt" => push(items, Condition::Lt(operand.clone())),
            "$lte" => push(items, Condition::Lte(operand.clone())),
            "$in" | "$nin" => {
                let list = operand
                    .as_array()
                    .ok_or_else(|| invalid(format!("{} on {} requires a list", op, field)))?
                    .clone();
                push(
                    items,
                    if op == "$in" {
                        Condition::In(list)
                    } else {
                        Condition::Nin(list)
                    },
                );
            }
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| invalid(format!("$regex on {} requires a string", field)))?;
                let options = match operators.get("$options") {
                    None => String::new(),
                    Some(Value::String(options)) => options.clone(),
                    Some(other) => {
                        return Err(invalid(format!("$options on {} must be a string, got {}", field, other)));
                    }
                };
                if let Some(bad) = options.chars().find(|c| !REGEX_OPTIONS.contains(c)) {
                    return Err(invalid(format!("unsupported regex option '{}' on {}", bad, field)));
                }
                regex::Regex::new(&inline_regex(pattern, &options)).map_err(|e| {
                    QueryError::InvalidRegex {
                        field: field.to_string(),
                        message: e.to_string(),
                    }
                })?;
                push(
                    items,
                    Condition::Regex {
                        pattern: pattern.to_string(),
                        options,
                    },
                );
            }
            "$options" => {
                if !operators.contains_key("$regex") {
                    return Err(invalid(format!("$options on {} requires $regex", field)));
                }
            }
            _ => return Err(unsupported(field, value)),
        }
    }

    Ok(())
}
