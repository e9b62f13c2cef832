//! SQL WHERE-clause translation.
//!
//! Produces a [`SqlFragment`] with anonymous `?` placeholders so fragments can
//! be concatenated freely; parameters are bound in order of appearance.

use serde_json::Value;

use super::filter::{Condition, FilterExpr, inline_regex};

/// A fragment of SQL with bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    /// The SQL clause.
    pub sql: String,
    /// Bound parameter values.
    pub params: Vec<SqlParam>,
}

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    String(String),
    Integer(i64),
    Float(f64),
    Null,
}

impl SqlParam {
    /// Converts a JSON literal into a bindable parameter.
    ///
    /// Booleans bind as 0/1; arrays and objects bind as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlParam::Integer(i),
                None => SqlParam::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlParam::String(s.clone()),
            other => SqlParam::String(other.to_string()),
        }
    }
}

impl SqlFragment {
    /// Creates a fragment without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Adds a parameter and returns its placeholder.
    pub fn add_param(&mut self, param: SqlParam) -> &'static str {
        self.params.push(param);
        "?"
    }

    /// Combines with another fragment using AND.
    pub fn and(mut self, other: SqlFragment) -> Self {
        if !self.sql.is_empty() && !other.sql.is_empty() {
            self.sql = format!("({}) AND ({})", self.sql, other.sql);
        } else if !other.sql.is_empty() {
            self.sql = other.sql;
        }
        self.params.extend(other.params);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Quotes an identifier for SQLite/PostgreSQL, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Translates a filter into a WHERE-clause fragment.
pub fn to_sql(expr: &FilterExpr) -> SqlFragment {
    let mut fragment = SqlFragment::new(String::new());
    fragment.sql = write_expr(expr, &mut fragment.params);
    fragment
}

fn write_expr(expr: &FilterExpr, params: &mut Vec<SqlParam>) -> String {
    match expr {
        FilterExpr::And(items) if items.is_empty() => "1 = 1".to_string(),
        FilterExpr::Or(items) if items.is_empty() => "0 = 1".to_string(),
        FilterExpr::And(items) | FilterExpr::Or(items) if items.len() == 1 => {
            write_expr(&items[0], params)
        }
        FilterExpr::And(items) => join(items, " AND ", params),
        FilterExpr::Or(items) => join(items, " OR ", params),
        FilterExpr::Field { field, condition } => write_condition(field, condition, params),
    }
}

fn join(items: &[FilterExpr], separator: &str, params: &mut Vec<SqlParam>) -> String {
    items
        .iter()
        .map(|item| format!("({})", write_expr(item, params)))
        .collect::<Vec<_>>()
        .join(separator)
}

fn write_condition(field: &str, condition: &Condition, params: &mut Vec<SqlParam>) -> String {
    let column = quote_identifier(field);
    let mut bind = |value: &Value| {
        params.push(SqlParam::from_json(value));
        "?"
    };

    match condition {
        Condition::Eq(Value::Null) => format!("{} IS NULL", column),
        Condition::Eq(v) => format!("{} = {}", column, bind(v)),
        Condition::Ne(Value::Null) => format!("{} IS NOT NULL", column),
        Condition::Ne(v) => format!("({} IS NULL OR {} <> {})", column, column, bind(v)),
        Condition::Gt(v) => format!("{} > {}", column, bind(v)),
        Condition::Gte(v) => format!("{} >= {}", column, bind(v)),
        Condition::Lt(v) => format!("{} < {}", column, bind(v)),
        Condition::Lte(v) => format!("{} <= {}", column, bind(v)),
        Condition::In(values) => {
            let (with_null, placeholders) = membership(values, &mut bind);
            match (placeholders.is_empty(), with_null) {
                (true, false) => "0 = 1".to_string(),
                (true, true) => format!("{} IS NULL", column),
                (false, false) => format!("{} IN ({})", column, placeholders),
                (false, true) => format!("({} IN ({}) OR {} IS NULL)", column, placeholders, column),
            }
        }
        Condition::Nin(values) => {
            let (with_null, placeholders) = membership(values, &mut bind);
            match (placeholders.is_empty(), with_null) {
                (true, false) => "1 = 1".to_string(),
                (true, true) => format!("{} IS NOT NULL", column),
                (false, false) => format!(
                    "({} IS NULL OR {} NOT IN ({}))",
                    column, column, placeholders
                ),
                (false, true) => format!(
                    "({} IS NOT NULL AND {} NOT IN ({}))",
                    column, column, placeholders
                ),
            }
        }
        Condition::Regex { pattern, options } => {
            let pattern = Value::String(inline_regex(pattern, options));
            format!("{} REGEXP {}", column, bind(&pattern))
        }
    }
}

/// Splits a membership list into a null flag and placeholders for the rest.
fn membership(values: &[Value], bind: &mut impl FnMut(&Value) -> &'static str) -> (bool, String) {
    let with_null = values.iter().any(Value::is_null);
    let placeholders = values
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| bind(v))
        .collect::<Vec<_>>()
        .join(", ");
    (with_null, placeholders)
}
