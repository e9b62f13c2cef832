//! Table layout for SQLite.
//!
//! One table per storage target, one column per scalar property and foreign
//! key. Existing tables are extended with `ALTER TABLE ... ADD COLUMN`; columns
//! are never dropped or retyped.

use rusqlite::Connection;

use crate::error::BackendResult;
use crate::query::sql::quote_identifier;
use crate::schema::{ColumnKind, ScalarKind, SchemaRegistry, StorageColumn};

/// SQLite column definition for one storage column.
fn column_definition(column: &StorageColumn) -> String {
    let ty = match column.kind {
        ColumnKind::PrimaryKey => "TEXT PRIMARY KEY NOT NULL",
        ColumnKind::Version => "INTEGER NOT NULL DEFAULT 0",
        ColumnKind::Discriminator | ColumnKind::ForeignKey => "TEXT",
        ColumnKind::Scalar(ScalarKind::Number) => "NUMERIC",
        ColumnKind::Scalar(ScalarKind::Boolean) => "INTEGER",
        ColumnKind::Scalar(ScalarKind::String | ScalarKind::Date | ScalarKind::Json) => "TEXT",
    };
    format!("{} {}", quote_identifier(&column.name), ty)
}

fn existing_columns(conn: &Connection, table: &str) -> BackendResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Creates missing tables, columns and foreign-key indexes.
pub(crate) fn synchronize(conn: &Connection, registry: &SchemaRegistry) -> BackendResult<()> {
    for (table, columns) in registry.storage_targets() {
        let existing = existing_columns(conn, table)?;
        if existing.is_empty() {
            let definitions = columns
                .iter()
                .map(column_definition)
                .collect::<Vec<_>>()
                .join(", ");
            conn.execute(
                &format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_identifier(table), definitions),
                [],
            )?;
            tracing::info!(table = %table, columns = columns.len(), "Created table");
        } else {
            for column in columns.iter().filter(|c| !existing.contains(&c.name)) {
                conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        quote_identifier(table),
                        column_definition(column)
                    ),
                    [],
                )?;
                tracing::info!(table = %table, column = %column.name, "Added column");
            }
        }

        for column in columns.iter().filter(|c| c.kind == ColumnKind::ForeignKey) {
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_identifier(&format!("idx_{}_{}", table, column.name)),
                    quote_identifier(table),
                    quote_identifier(&column.name)
                ),
                [],
            )?;
        }
    }
    Ok(())
}

/// Drops one table.
pub(crate) fn drop_table(conn: &Connection, table: &str) -> BackendResult<()> {
    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_identifier(table)), [])?;
    tracing::info!(table = %table, "Dropped table");
    Ok(())
}
