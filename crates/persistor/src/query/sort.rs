//! Sort specifications and pagination.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::{StorageResult, ValidationError};

use super::document::compare_values;

/// Sort direction for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Ordered list of sort keys, passed through to the backend untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    keys: Vec<(String, SortDirection)>,
}

impl SortSpec {
    /// Parses `{"field": 1}` / `{"field": -1}` / `{"field": "desc"}`.
    pub fn parse(value: &Value) -> StorageResult<Self> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            other => {
                return Err(ValidationError::InvalidSort {
                    message: format!("expected an object, got {}", other),
                }
                .into());
            }
        };

        let mut spec = Self::default();
        for (field, direction) in object {
            let direction = match direction {
                Value::Number(n) if n.as_f64().is_some_and(|n| n < 0.0) => SortDirection::Descending,
                Value::Number(_) => SortDirection::Ascending,
                Value::String(s) if s.eq_ignore_ascii_case("desc") => SortDirection::Descending,
                Value::String(s) if s.eq_ignore_ascii_case("asc") => SortDirection::Ascending,
                other => {
                    return Err(ValidationError::InvalidSort {
                        message: format!("invalid direction {} for {}", other, field),
                    }
                    .into());
                }
            };
            spec.keys.push((field.clone(), direction));
        }
        Ok(spec)
    }

    /// Appends a sort key.
    pub fn by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.keys.push((field.into(), direction));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[(String, SortDirection)] {
        &self.keys
    }

    /// Orders two documents by this spec. Nulls sort first.
    pub fn compare(&self, a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
        for (field, direction) in &self.keys {
            let left = a.get(field).unwrap_or(&Value::Null);
            let right = b.get(field).unwrap_or(&Value::Null);
            let ordering = match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => compare_values(left, right).unwrap_or(Ordering::Equal),
            };
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Offset/limit window over a result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl Pagination {
    pub fn new(offset: Option<u64>, limit: Option<u64>) -> Self {
        Self { offset, limit }
    }

    /// Applies the window to an in-memory sequence.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let offset = self.offset.unwrap_or(0) as usize;
        let iter = items.into_iter().skip(offset);
        match self.limit {
            Some(limit) => iter.take(limit as usize).collect(),
            None => iter.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_directions() {
        let spec = SortSpec::parse(&json!({"_id": 1, "amount": -1})).unwrap();
        assert_eq!(
            spec.keys(),
            &[
                ("_id".to_string(), SortDirection::Ascending),
                ("amount".to_string(), SortDirection::Descending),
            ]
        );
        assert!(SortSpec::parse(&json!({"_id": true})).is_err());
        assert!(SortSpec::parse(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_parse_keeps_key_order() {
        let spec = SortSpec::parse(&json!({"type": 1, "amount": -1, "_id": "asc"})).unwrap();
        let fields: Vec<&str> = spec.keys().iter().map(|(field, _)| field.as_str()).collect();
        assert_eq!(fields, vec!["type", "amount", "_id"]);

        let type_then_amount = SortSpec::parse(&json!({"type": 1, "amount": -1})).unwrap();
        let credit = json!({"type": "Credit", "amount": 10}).as_object().cloned().unwrap();
        let debit = json!({"type": "Debit", "amount": 500}).as_object().cloned().unwrap();
        assert_eq!(type_then_amount.compare(&credit, &debit), Ordering::Less);
    }

    #[test]
    fn test_compare_documents() {
        let spec = SortSpec::default().by("amount", SortDirection::Descending);
        let a = json!({"amount": 10}).as_object().cloned().unwrap();
        let b = json!({"amount": 20}).as_object().cloned().unwrap();
        let none = json!({}).as_object().cloned().unwrap();
        assert_eq!(spec.compare(&a, &b), Ordering::Greater);
        assert_eq!(spec.compare(&none, &a), Ordering::Greater);
    }

    #[test]
    fn test_pagination_window() {
        let items: Vec<u32> = (0..6).collect();
        assert_eq!(Pagination::new(Some(1), Some(2)).apply(items.clone()), vec![1, 2]);
        assert_eq!(Pagination::new(Some(5), None).apply(items.clone()), vec![5]);
        assert_eq!(Pagination::default().apply(items).len(), 6);
    }
}
