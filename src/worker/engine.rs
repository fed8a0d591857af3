//! Embedded query engine for the worker process.
//!
//! Datasets are SQLite files attached read-only under their dataset alias and
//! cached across jobs, so repeat queries against the same dataset skip the
//! attach. The connection is pinned to query-only mode; a query that tries to
//! write fails like any other semantic error.
//!
//! Every rusqlite error is translated into the stable [`QueryError`] taxonomy
//! before it leaves this module; raw engine errors never cross the process
//! boundary on any exit path (attach, prepare, execute, decode, schema,
//! profile).

use crate::DatasetRef;
use crate::pool::protocol::{
    Column, ColumnProfile, DatasetSchema, ExecutionResult, QueryError, QueryErrorKind,
    TableProfile, TableSchema,
};
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

/// One engine instance per worker process.
pub struct Engine {
    conn: Connection,
    /// Alias -> attached file path, for attach reuse across jobs.
    attached: HashMap<String, PathBuf>,
}

impl Engine {
    pub fn new() -> Result<Self, QueryError> {
        let conn = Connection::open_in_memory().map_err(internal_error)?;
        conn.pragma_update(None, "query_only", "ON")
            .map_err(internal_error)?;
        Ok(Self {
            conn,
            attached: HashMap::new(),
        })
    }

    /// Attach every dataset the job references, reusing cached attachments.
    /// A cached alias pointing at a different file is detached first.
    pub fn attach_datasets(&mut self, refs: &[DatasetRef]) -> Result<(), QueryError> {
        for dataset in refs {
            let alias = dataset.alias();
            match self.attached.get(&alias) {
                Some(path) if *path == dataset.path => continue,
                Some(_) => {
                    // query_only blocks writes, not schema-level detach.
                    self.conn
                        .execute_batch(&format!("DETACH DATABASE \"{}\"", escape_ident(&alias)))
                        .map_err(internal_error)?;
                    self.attached.remove(&alias);
                }
                None => {}
            }

            // ATTACH does not accept a bound parameter for the alias, so the
            // statement is built with the sanitized alias and the path as a
            // bound parameter.
            let uri = format!("file:{}?mode=ro", dataset.path.display());
            self.conn
                .execute(
                    &format!("ATTACH DATABASE ?1 AS \"{}\"", escape_ident(&alias)),
                    rusqlite::params![uri],
                )
                .map_err(|err| attach_error(&dataset.id, err))?;
            self.attached.insert(alias, dataset.path.clone());
        }
        Ok(())
    }

    /// Execute one paginated query. Pagination is mandatory: the engine only
    /// ever materializes one page plus a count, never the full result set.
    pub fn execute_query(
        &mut self,
        query_text: &str,
        dataset_refs: &[DatasetRef],
        page: u32,
        page_size: u32,
    ) -> ExecutionResult {
        let started = Instant::now();

        if let Err(error) = self.attach_datasets(dataset_refs) {
            return ExecutionResult::failed(error.kind, error.message, elapsed_ms(started));
        }

        let trimmed = query_text.trim().trim_end_matches(';');
        if trimmed.is_empty() {
            return ExecutionResult::failed(
                QueryErrorKind::Semantic,
                "Query is empty",
                elapsed_ms(started),
            );
        }

        let page_size = page_size.max(1);
        match self.run_paginated(trimmed, page, page_size) {
            Ok((columns, rows, total_rows)) => ExecutionResult {
                columns,
                rows,
                total_rows,
                error: None,
                execution_time_ms: elapsed_ms(started),
            },
            Err(error) => {
                ExecutionResult::failed(error.kind, error.message, elapsed_ms(started))
            }
        }
    }

    fn run_paginated(
        &self,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Column>, Vec<Vec<serde_json::Value>>, u64), QueryError> {
        let total_rows: u64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM ({query})"),
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count.max(0) as u64)
            .map_err(semantic_error)?;

        let offset = u64::from(page) * u64::from(page_size);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT * FROM ({query}) LIMIT {page_size} OFFSET {offset}"
            ))
            .map_err(semantic_error)?;

        let columns: Vec<Column> = stmt
            .columns()
            .iter()
            .map(|col| Column {
                name: col.name().to_string(),
                decl_type: col.decl_type().map(str::to_string),
            })
            .collect();
        let column_count = columns.len();

        let mut rows = Vec::new();
        let mut result_rows = stmt.query([]).map_err(semantic_error)?;
        while let Some(row) = result_rows.next().map_err(semantic_error)? {
            let mut cells = Vec::with_capacity(column_count);
            for index in 0..column_count {
                let value = row.get_ref(index).map_err(internal_error)?;
                cells.push(cell_to_json(value));
            }
            rows.push(cells);
        }

        Ok((columns, rows, total_rows))
    }

    /// List tables with columns and row counts for one dataset.
    pub fn schema(&mut self, dataset: &DatasetRef) -> Result<DatasetSchema, QueryError> {
        self.attach_datasets(std::slice::from_ref(dataset))?;
        let alias = dataset.alias();

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT name FROM \"{}\".sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                escape_ident(&alias)
            ))
            .map_err(internal_error)?;
        let table_names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(internal_error)?
            .collect::<Result<_, _>>()
            .map_err(internal_error)?;
        drop(stmt);

        let mut tables = Vec::with_capacity(table_names.len());
        for name in table_names {
            let columns = self.table_columns(&alias, &name)?;
            let row_count: i64 = self
                .conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM \"{}\".\"{}\"",
                        escape_ident(&alias),
                        escape_ident(&name)
                    ),
                    [],
                    |row| row.get(0),
                )
                .map_err(internal_error)?;
            tables.push(TableSchema {
                name,
                columns,
                row_count: row_count.max(0) as u64,
            });
        }

        Ok(DatasetSchema {
            dataset_id: dataset.id.clone(),
            tables,
        })
    }

    /// Per-column null count, distinct count, min and max for one table.
    pub fn profile(
        &mut self,
        dataset: &DatasetRef,
        table: &str,
    ) -> Result<TableProfile, QueryError> {
        self.attach_datasets(std::slice::from_ref(dataset))?;
        let alias = dataset.alias();

        let columns = self.table_columns(&alias, table)?;
        if columns.is_empty() {
            return Err(QueryError {
                kind: QueryErrorKind::Semantic,
                message: format!("Unknown table: {table}"),
            });
        }

        let qualified = format!(
            "\"{}\".\"{}\"",
            escape_ident(&alias),
            escape_ident(table)
        );
        let mut profiles = Vec::with_capacity(columns.len());
        for column in &columns {
            let quoted = format!("\"{}\"", escape_ident(&column.name));
            let (null_count, distinct_count, min, max) = self
                .conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*) - COUNT({quoted}), COUNT(DISTINCT {quoted}), \
                                MIN({quoted}), MAX({quoted}) FROM {qualified}"
                    ),
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            cell_to_json(row.get_ref(2)?),
                            cell_to_json(row.get_ref(3)?),
                        ))
                    },
                )
                .map_err(internal_error)?;

            profiles.push(ColumnProfile {
                name: column.name.clone(),
                null_count: null_count.max(0) as u64,
                distinct_count: distinct_count.max(0) as u64,
                min: (!min.is_null()).then_some(min),
                max: (!max.is_null()).then_some(max),
            });
        }

        Ok(TableProfile {
            dataset_id: dataset.id.clone(),
            table: table.to_string(),
            columns: profiles,
        })
    }

    fn table_columns(&self, alias: &str, table: &str) -> Result<Vec<Column>, QueryError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "PRAGMA \"{}\".table_info(\"{}\")",
                escape_ident(alias),
                escape_ident(table)
            ))
            .map_err(internal_error)?;
        let columns = stmt
            .query_map([], |row| {
                Ok(Column {
                    name: row.get(1)?,
                    decl_type: row.get::<_, Option<String>>(2)?.filter(|t| !t.is_empty()),
                })
            })
            .map_err(internal_error)?
            .collect::<Result<_, _>>()
            .map_err(internal_error)?;
        Ok(columns)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Convert one engine cell to a typed JSON value. NULL stays null; blobs are
/// rendered as placeholders since nothing downstream charts raw bytes.
fn cell_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(t) => serde_json::json!(String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => serde_json::json!(format!("<blob {} bytes>", b.len())),
    }
}

fn escape_ident(ident: &str) -> String {
    ident.replace('"', "\"\"")
}

/// Classify an engine error from user SQL into the stable taxonomy with a
/// user-facing message.
fn semantic_error(err: rusqlite::Error) -> QueryError {
    let raw = err.to_string();
    let message = if let Some(rest) = raw.split("no such column: ").nth(1) {
        format!("Unknown column: {rest}")
    } else if let Some(rest) = raw.split("no such table: ").nth(1) {
        format!("Unknown table: {rest}")
    } else if let Some(rest) = raw.split("no such function: ").nth(1) {
        format!("Unknown function: {rest}")
    } else if raw.contains("syntax error") {
        format!("SQL syntax error: {raw}")
    } else if raw.contains("readonly database") || raw.contains("attempt to write") {
        "Datasets are read-only; only SELECT queries are allowed".to_string()
    } else if raw.contains("ambiguous column name") {
        format!("Ambiguous column: {raw}")
    } else {
        format!("Invalid query: {raw}")
    };

    QueryError {
        kind: QueryErrorKind::Semantic,
        message,
    }
}

fn attach_error(dataset_id: &str, err: rusqlite::Error) -> QueryError {
    tracing::warn!(dataset_id, error = %err, "failed to attach dataset");
    QueryError {
        kind: QueryErrorKind::Internal,
        message: format!("Dataset '{dataset_id}' could not be opened"),
    }
}

fn internal_error(err: rusqlite::Error) -> QueryError {
    QueryError {
        kind: QueryErrorKind::Internal,
        message: format!("Query engine error: {err}"),
    }
}
