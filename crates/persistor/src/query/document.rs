//! Document-store predicate translation and evaluation.
//!
//! A [`DocumentQuery`] is the compiled form of a filter for stores that
//! evaluate predicates against JSON documents: regular expressions are
//! compiled once, and [`DocumentQuery::matches`] tests a single document.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{QueryError, StorageResult};

use super::filter::{Condition, FilterExpr, inline_regex};

/// A compiled document-store predicate.
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    root: Node,
    source: Value,
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Field { field: String, test: Test },
}

#[derive(Debug, Clone)]
enum Test {
    Condition(Condition),
    Regex(Regex),
}

impl PartialEq for DocumentQuery {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl DocumentQuery {
    /// Compiles a filter expression.
    pub fn compile(expr: &FilterExpr) -> StorageResult<Self> {
        Ok(Self {
            root: compile_node(expr)?,
            source: expr.to_json(),
        })
    }

    /// The document-store query object this predicate was compiled from.
    pub fn as_json(&self) -> &Value {
        &self.source
    }

    /// Tests a document against the predicate.
    pub fn matches(&self, document: &Map<String, Value>) -> bool {
        eval(&self.root, document)
    }
}

fn compile_node(expr: &FilterExpr) -> StorageResult<Node> {
    Ok(match expr {
        FilterExpr::And(items) => Node::And(items.iter().map(compile_node).collect::<StorageResult<_>>()?),
        FilterExpr::Or(items) => Node::Or(items.iter().map(compile_node).collect::<StorageResult<_>>()?),
        FilterExpr::Field { field, condition } => {
            let test = match condition {
                Condition::Regex { pattern, options } => {
                    let regex = Regex::new(&inline_regex(pattern, options)).map_err(|e| {
                        QueryError::InvalidRegex {
                            field: field.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    Test::Regex(regex)
                }
                other => Test::Condition(other.clone()),
            };
            Node::Field {
                field: field.clone(),
                test,
            }
        }
    })
}

fn eval(node: &Node, document: &Map<String, Value>) -> bool {
    match node {
        Node::And(items) => items.iter().all(|n| eval(n, document)),
        Node::Or(items) => items.iter().any(|n| eval(n, document)),
        Node::Field { field, test } => {
            let actual = document.get(field).unwrap_or(&Value::Null);
            match test {
                Test::Regex(regex) => actual.as_str().is_some_and(|s| regex.is_match(s)),
                Test::Condition(condition) => eval_condition(actual, condition),
            }
        }
    }
}

fn eval_condition(actual: &Value, condition: &Condition) -> bool {
    match condition {
        Condition::Eq(expected) => values_equal(actual, expected),
        Condition::Ne(expected) => !values_equal(actual, expected),
        Condition::Gt(bound) => compare_values(actual, bound) == Some(Ordering::Greater),
        Condition::Gte(bound) => matches!(
            compare_values(actual, bound),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Condition::Lt(bound) => compare_values(actual, bound) == Some(Ordering::Less),
        Condition::Lte(bound) => matches!(
            compare_values(actual, bound),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Condition::In(list) => list.iter().any(|v| values_equal(actual, v)),
        Condition::Nin(list) => !list.iter().any(|v| values_equal(actual, v)),
        Condition::Regex { .. } => false,
    }
}

/// Equality that treats `100` and `100.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Orders two scalars of the same kind; mixed kinds and nulls do not compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn query(filter: Value) -> DocumentQuery {
        DocumentQuery::compile(&FilterExpr::parse(&filter).unwrap()).unwrap()
    }

    fn amounts() -> Vec<Map<String, Value>> {
        [
            ("credit", 100),
            ("debit", 50),
            ("credit", 200),
            ("xfer", 100),
            ("xfer", 50),
            ("debit", 25),
        ]
        .iter()
        .map(|(t, a)| doc(json!({"type": t, "amount": a})))
        .collect()
    }

    fn count(filter: Value) -> usize {
        let q = query(filter);
        amounts().iter().filter(|d| q.matches(d)).count()
    }

    #[test]
    fn test_comparisons_over_known_amounts() {
        assert_eq!(count(json!({"amount": {"$lt": 500}})), 6);
        assert_eq!(count(json!({"amount": {"$ne": 100}})), 4);
        assert_eq!(count(json!({"amount": {"$gte": 100}})), 3);
        assert_eq!(count(json!({"amount": {"$gt": 25, "$lte": 100}})), 4);
        assert_eq!(count(json!({"amount": {"$eq": 50}})), 2);
    }

    #[test]
    fn test_membership() {
        assert_eq!(
            count(json!({"type": {"$in": ["debit", "credit"]}, "amount": {"$gte": 200}})),
            1
        );
        assert_eq!(count(json!({"type": {"$nin": ["debit", "credit"]}})), 2);
    }

    #[test]
    fn test_regex_case_insensitive() {
        assert_eq!(count(json!({"type": {"$regex": "^.*It$", "$options": "i"}})), 4);
        assert_eq!(count(json!({"type": {"$regex": "^.*It$"}})), 0);
    }

    #[test]
    fn test_or_and() {
        assert_eq!(count(json!({"$or": [{"type": "debit"}, {"type": "xfer"}]})), 4);
        assert_eq!(
            count(json!({"$and": [{"type": "debit"}, {"amount": {"$gt": 100}}]})),
            0
        );
    }

    #[test]
    fn test_missing_fields_are_null() {
        let q = query(json!({"referred_id": null}));
        assert!(q.matches(&doc(json!({"firstName": "Sam"}))));
        assert!(!q.matches(&doc(json!({"referred_id": "c-1"}))));

        let q = query(json!({"referred_id": {"$ne": "c-1"}}));
        assert!(q.matches(&doc(json!({}))));
    }

    #[test]
    fn test_numbers_compare_across_representations() {
        let q = query(json!({"amount": 100}));
        assert!(q.matches(&doc(json!({"amount": 100.0}))));
    }

    #[test]
    fn test_compiled_query_keeps_source() {
        let q = query(json!({"amount": {"$lt": 500}}));
        assert_eq!(q.as_json(), &json!({"amount": {"$lt": 500}}));
        assert_eq!(q, query(json!({"amount": {"$lt": 500}})));
    }
}
