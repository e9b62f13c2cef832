//! Query translation.
//!
//! [`translate`] turns a JSON filter into the predicate a backend evaluates,
//! either a SQL WHERE fragment or a compiled document query. Translation is
//! pure: the same template and filter always produce the same predicate.
//!
//! Two pieces of schema knowledge are folded in:
//!
//! - a filter on a to-one relationship name is rewritten to its foreign-key
//!   column, so `{"account": "<id>"}` works as well as `{"account_id": "<id>"}`;
//! - when several templates share one storage target, rows are restricted to
//!   the requested template and its subtypes via the `_template` column.
//!
//! Unknown fields pass through untouched; the backend reports them.
//!
//! # Example
//!
//! ```ignore
//! let predicate = translate(
//!     registry.template("Transaction")?,
//!     &json!({"amount": {"$lt": 500}}),
//!     QueryDialect::Sql,
//! )?;
//! ```

pub mod document;
pub mod filter;
pub mod sort;
pub mod sql;

use serde_json::Value;

use crate::error::StorageResult;
use crate::schema::{PropertyKind, TEMPLATE_COLUMN, TemplateSchema};

pub use document::DocumentQuery;
pub use filter::{Condition, FilterExpr};
pub use sort::{Pagination, SortDirection, SortSpec};
pub use sql::{SqlFragment, SqlParam};

/// The predicate language a backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryDialect {
    Sql,
    Document,
}

impl std::fmt::Display for QueryDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryDialect::Sql => write!(f, "sql"),
            QueryDialect::Document => write!(f, "document"),
        }
    }
}

/// A backend-native predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum NativePredicate {
    Sql(SqlFragment),
    Document(DocumentQuery),
}

impl NativePredicate {
    pub fn dialect(&self) -> QueryDialect {
        match self {
            NativePredicate::Sql(_) => QueryDialect::Sql,
            NativePredicate::Document(_) => QueryDialect::Document,
        }
    }
}

/// Translates a JSON filter for `schema` into `dialect`.
pub fn translate(
    schema: &TemplateSchema,
    filter: &Value,
    dialect: QueryDialect,
) -> StorageResult<NativePredicate> {
    translate_expr(schema, FilterExpr::parse(filter)?, dialect)
}

/// Translates an already-parsed filter.
pub fn translate_expr(
    schema: &TemplateSchema,
    mut expr: FilterExpr,
    dialect: QueryDialect,
) -> StorageResult<NativePredicate> {
    expr.rename_fields(&|field| match schema.property(field).map(|p| &p.kind) {
        Some(PropertyKind::ToOne { foreign_key, .. }) => Some(foreign_key.clone()),
        _ => None,
    });

    if schema.shares_target() {
        let family = schema
            .family()
            .iter()
            .map(|name| Value::String(name.clone()))
            .collect();
        expr = FilterExpr::in_list(TEMPLATE_COLUMN, family).and(expr);
    }

    let predicate = match dialect {
        QueryDialect::Sql => NativePredicate::Sql(sql::to_sql(&expr)),
        QueryDialect::Document => NativePredicate::Document(DocumentQuery::compile(&expr)?),
    };

    tracing::debug!(template = %schema.name(), predicate = ?predicate, "Translated filter");

    Ok(predicate)
}
