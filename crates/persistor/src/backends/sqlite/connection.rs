//! SQLite implementation of [`Connection`].

use std::fmt::Debug;

use async_trait::async_trait;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params_from_iter;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};

use crate::core::{Connection, Row};
use crate::error::{BackendError, BackendResult};
use crate::query::sql::quote_identifier;
use crate::query::{NativePredicate, Pagination, SortDirection, SortSpec, SqlFragment, SqlParam};
use crate::schema::{PRIMARY_KEY, VERSION_COLUMN};

fn bind(param: &SqlParam) -> SqlValue {
    match param {
        SqlParam::String(s) => SqlValue::Text(s.clone()),
        SqlParam::Integer(i) => SqlValue::Integer(*i),
        SqlParam::Float(f) => SqlValue::Real(*f),
        SqlParam::Null => SqlValue::Null,
    }
}

fn bind_json(value: &Value) -> SqlValue {
    bind(&SqlParam::from_json(value))
}

fn read_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn sql_fragment<'p>(predicate: &'p NativePredicate) -> BackendResult<&'p SqlFragment> {
    match predicate {
        NativePredicate::Sql(fragment) => Ok(fragment),
        other => Err(BackendError::UnsupportedPredicate {
            backend_name: "sqlite".to_string(),
            dialect: other.dialect().to_string(),
        }),
    }
}

fn where_clause(fragment: &SqlFragment) -> String {
    if fragment.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", fragment.sql)
    }
}

fn order_clause(sort: &SortSpec) -> String {
    if sort.is_empty() {
        return String::new();
    }
    let keys = sort
        .keys()
        .iter()
        .map(|(field, direction)| {
            let direction = match direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            format!("{} {}", quote_identifier(field), direction)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ORDER BY {}", keys)
}

fn page_clause(page: Pagination) -> String {
    match (page.limit, page.offset) {
        (None, None) => String::new(),
        (Some(limit), None) => format!(" LIMIT {}", limit),
        (limit, Some(offset)) => format!(
            " LIMIT {} OFFSET {}",
            limit.map(|l| l as i64).unwrap_or(-1),
            offset
        ),
    }
}

/// A pooled SQLite connection.
///
/// Transactions are opened with `BEGIN IMMEDIATE`, so the database write
/// lock is taken up front and writers never deadlock each other; a second
/// writer waits up to the busy timeout instead.
pub struct SqliteConnection {
    conn: PooledConnection<SqliteConnectionManager>,
    in_transaction: bool,
}

impl Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl SqliteConnection {
    pub(crate) fn new(conn: PooledConnection<SqliteConnectionManager>) -> Self {
        Self {
            conn,
            in_transaction: false,
        }
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            // The pooled connection outlives this wrapper; leave it clean.
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %e, "Failed to roll back abandoned SQLite transaction");
            }
        }
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn begin(&mut self) -> BackendResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> BackendResult<()> {
        if !self.in_transaction {
            return Err(BackendError::NoTransaction {
                backend_name: "sqlite".to_string(),
            });
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> BackendResult<()> {
        if !self.in_transaction {
            return Err(BackendError::NoTransaction {
                backend_name: "sqlite".to_string(),
            });
        }
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn query(
        &mut self,
        target: &str,
        predicate: &NativePredicate,
        sort: &SortSpec,
        page: Pagination,
    ) -> BackendResult<Vec<Row>> {
        let fragment = sql_fragment(predicate)?;
        let sql = format!(
            "SELECT * FROM {}{}{}{}",
            quote_identifier(target),
            where_clause(fragment),
            order_clause(sort),
            page_clause(page)
        );
        tracing::trace!(sql = %sql, params = fragment.params.len(), "SQLite query");

        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut rows = stmt.query(params_from_iter(fragment.params.iter().map(bind)))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (index, name) in names.iter().enumerate() {
                record.insert(name.clone(), read_value(row.get_ref(index)?));
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn count(&mut self, target: &str, predicate: &NativePredicate) -> BackendResult<u64> {
        let fragment = sql_fragment(predicate)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            quote_identifier(target),
            where_clause(fragment)
        );
        let count: i64 = self.conn.query_row(
            &sql,
            params_from_iter(fragment.params.iter().map(bind)),
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    async fn read_version(&mut self, target: &str, id: &str) -> BackendResult<Option<i64>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote_identifier(VERSION_COLUMN),
            quote_identifier(target),
            quote_identifier(PRIMARY_KEY)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn lock_row(&mut self, target: &str, id: &str) -> BackendResult<()> {
        // BEGIN IMMEDIATE already holds the database write lock; outside a
        // transaction this is a no-op write that waits out other writers.
        let sql = format!(
            "UPDATE {} SET {} = {} WHERE {} = ?1",
            quote_identifier(target),
            quote_identifier(PRIMARY_KEY),
            quote_identifier(PRIMARY_KEY),
            quote_identifier(PRIMARY_KEY)
        );
        self.conn.execute(&sql, [id])?;
        Ok(())
    }

    async fn insert(&mut self, target: &str, mut row: Row) -> BackendResult<String> {
        let id = match row.get(PRIMARY_KEY) {
            Some(Value::String(id)) => id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        row.insert(PRIMARY_KEY.to_string(), Value::String(id.clone()));

        let columns = row.keys().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ");
        let placeholders = vec!["?"; row.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(target),
            columns,
            placeholders
        );
        self.conn.execute(&sql, params_from_iter(row.values().map(bind_json)))?;
        Ok(id)
    }

    async fn update(
        &mut self,
        target: &str,
        id: &str,
        mut row: Row,
        expected_version: i64,
    ) -> BackendResult<u64> {
        row.remove(PRIMARY_KEY);
        if row.is_empty() {
            return Ok(0);
        }

        let assignments = row
            .keys()
            .map(|c| format!("{} = ?", quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ? AND {} = ?",
            quote_identifier(target),
            assignments,
            quote_identifier(PRIMARY_KEY),
            quote_identifier(VERSION_COLUMN)
        );
        let params = row
            .values()
            .map(bind_json)
            .chain([SqlValue::Text(id.to_string()), SqlValue::Integer(expected_version)]);
        let affected = self.conn.execute(&sql, params_from_iter(params))?;
        Ok(affected as u64)
    }

    async fn delete(&mut self, target: &str, id: &str) -> BackendResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_identifier(target),
            quote_identifier(PRIMARY_KEY)
        );
        let affected = self.conn.execute(&sql, [id])?;
        Ok(affected as u64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::Backend;
    use crate::backends::sqlite::SqliteBackend;
    use crate::query::{FilterExpr, sql::to_sql};
    use crate::schema::{ScalarKind, SchemaRegistry, Template};

    async fn create_connection() -> Box<dyn Connection> {
        let registry = SchemaRegistry::builder()
            .template(
                Template::new("Ledger")
                    .scalar("amount", ScalarKind::Number)
                    .scalar("memo", ScalarKind::String),
            )
            .build()
            .unwrap();
        let backend = SqliteBackend::in_memory().expect("Failed to create SQLite backend");
        backend
            .synchronize(&registry)
            .await
            .expect("Failed to synchronize");
        // The pooled connection keeps the pool, and with it the database, alive.
        backend.acquire().await.expect("Failed to acquire connection")
    }

    fn row(amount: i64, memo: &str) -> Row {
        let mut row = Row::new();
        row.insert("amount".to_string(), json!(amount));
        row.insert("memo".to_string(), json!(memo));
        row.insert(VERSION_COLUMN.to_string(), json!(1));
        row
    }

    fn filter(value: Value) -> NativePredicate {
        NativePredicate::Sql(to_sql(&FilterExpr::parse(&value).unwrap()))
    }

    #[test]
    fn test_page_clause() {
        assert_eq!(page_clause(Pagination::default()), "");
        assert_eq!(page_clause(Pagination::new(None, Some(5))), " LIMIT 5");
        assert_eq!(page_clause(Pagination::new(Some(2), None)), " LIMIT -1 OFFSET 2");
        assert_eq!(page_clause(Pagination::new(Some(2), Some(3))), " LIMIT 3 OFFSET 2");
    }

    #[tokio::test]
    async fn test_insert_query_update_delete() {
        let mut conn = create_connection().await;
        let first = conn.insert("Ledger", row(100, "rent")).await.unwrap();
        conn.insert("Ledger", row(25, "Coffee")).await.unwrap();

        let rows = conn
            .query("Ledger", &filter(json!({"amount": {"$gt": 50}})), &SortSpec::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][PRIMARY_KEY], json!(first));
        assert_eq!(rows[0]["memo"], json!("rent"));

        let rows = conn
            .query(
                "Ledger",
                &filter(json!({"memo": {"$regex": "^coffee", "$options": "i"}})),
                &SortSpec::default(),
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        assert_eq!(conn.update("Ledger", &first, row(150, "rent"), 0).await.unwrap(), 0);
        let mut bumped = row(150, "rent");
        bumped.insert(VERSION_COLUMN.to_string(), json!(2));
        assert_eq!(conn.update("Ledger", &first, bumped, 1).await.unwrap(), 1);
        assert_eq!(conn.read_version("Ledger", &first).await.unwrap(), Some(2));

        assert_eq!(conn.count("Ledger", &filter(json!({}))).await.unwrap(), 2);
        assert_eq!(conn.delete("Ledger", &first).await.unwrap(), 1);
        assert_eq!(conn.read_version("Ledger", &first).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_errors_are_verbatim() {
        let mut conn = create_connection().await;
        let err = conn
            .query("Ledger", &filter(json!({"nope": 1})), &SortSpec::default(), Pagination::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such column: nope"));

        let err = conn.commit().await.unwrap_err();
        assert!(matches!(err, BackendError::NoTransaction { .. }));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let mut conn = create_connection().await;
        conn.begin().await.unwrap();
        assert!(conn.in_transaction());
        conn.insert("Ledger", row(1, "gone")).await.unwrap();
        conn.rollback().await.unwrap();
        assert_eq!(conn.count("Ledger", &filter(json!({}))).await.unwrap(), 0);
    }
}
