//! SQLite connection adapter.
//!
//! Wraps a `rusqlite::Connection`. SQLite DDL is transactional, so every
//! change set can run inside its own transaction, and
//! `CREATE TABLE IF NOT EXISTS` gives the atomic bootstrap the tracking and
//! lock tables rely on.

use std::path::Path;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Batch, ErrorCode, Statement};

use super::{ColumnType, Connection, DbError, DbErrorKind, Row, TableSpec, Value};

/// Default busy timeout applied to new connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed [`Connection`].
pub struct SqliteConnection {
    conn: rusqlite::Connection,
    busy_timeout: Duration,
}

impl SqliteConnection {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = rusqlite::Connection::open(path).map_err(map_error)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(map_error)?;
        Self::from_connection(conn)
    }

    /// Wrap an existing rusqlite connection.
    pub fn from_connection(conn: rusqlite::Connection) -> Result<Self, DbError> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT).map_err(map_error)?;
        Ok(Self {
            conn,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Set how long SQLite waits on a locked database before reporting busy.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Result<Self, DbError> {
        self.set_busy_timeout(timeout)?;
        Ok(self)
    }

    /// Borrow the underlying rusqlite connection.
    pub fn inner(&self) -> &rusqlite::Connection {
        &self.conn
    }

    /// Unwrap into the underlying rusqlite connection.
    pub fn into_inner(self) -> rusqlite::Connection {
        self.conn
    }

    fn exists(&mut self, kind: &str, name: &str) -> Result<bool, DbError> {
        let rows = self.query(
            "SELECT 1 FROM sqlite_master WHERE type = ?1 AND lower(name) = lower(?2)",
            &[Value::from(kind), Value::from(name)],
        )?;
        Ok(!rows.is_empty())
    }
}

impl Connection for SqliteConnection {
    fn dbms(&self) -> &str {
        "sqlite"
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        if params.is_empty() {
            // Unsplit change sets may hold several statements.
            let mut batch = Batch::new(&self.conn, sql);
            let mut total = 0u64;
            while let Some(mut stmt) = batch.next().map_err(map_error)? {
                total += run_statement(&mut stmt, &[])?;
            }
            return Ok(total);
        }

        let mut stmt = self.conn.prepare(sql).map_err(map_error)?;
        run_statement(&mut stmt, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let mut stmt = self.conn.prepare(sql).map_err(map_error)?;
        let column_count = stmt.column_count();
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sql_value)))
            .map_err(map_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_error)? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                let value: SqlValue = row.get(index).map_err(map_error)?;
                values.push(from_sql_value(value));
            }
            out.push(Row::new(values));
        }
        Ok(out)
    }

    fn begin(&mut self) -> Result<(), DbError> {
        // Take the write lock up front. A deferred transaction that has
        // already read cannot wait for it and fails with SQLITE_BUSY.
        self.conn.execute_batch("BEGIN IMMEDIATE").map_err(map_error)
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.conn.execute_batch("COMMIT").map_err(map_error)
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        if self.conn.is_autocommit() {
            // SQLite already rolled the transaction back (e.g. after SQLITE_FULL).
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK").map_err(map_error)
    }

    fn create_table_if_not_exists(&mut self, table: &TableSpec) -> Result<(), DbError> {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|column| {
                let ty = match column.ty {
                    ColumnType::Text => "TEXT",
                    ColumnType::Integer => "INTEGER",
                };
                if column.nullable {
                    format!("{} {}", column.name, ty)
                } else {
                    format!("{} {} NOT NULL", column.name, ty)
                }
            })
            .collect();
        if !table.primary_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", table.primary_key.join(", ")));
        }

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table.name,
            parts.join(", ")
        );
        self.conn.execute_batch(&ddl).map_err(map_error)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, DbError> {
        self.exists("table", table)
    }

    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, DbError> {
        let rows = self.query(
            "SELECT 1 FROM pragma_table_info(?1) WHERE lower(name) = lower(?2)",
            &[Value::from(table), Value::from(column)],
        )?;
        Ok(!rows.is_empty())
    }

    fn index_exists(&mut self, index: &str) -> Result<bool, DbError> {
        self.exists("index", index)
    }

    fn view_exists(&mut self, view: &str) -> Result<bool, DbError> {
        self.exists("view", view)
    }

    fn busy_timeout(&self) -> Option<Duration> {
        Some(self.busy_timeout)
    }

    fn set_busy_timeout(&mut self, timeout: Duration) -> Result<(), DbError> {
        self.conn.busy_timeout(timeout).map_err(map_error)?;
        self.busy_timeout = timeout;
        Ok(())
    }
}

fn run_statement(stmt: &mut Statement<'_>, params: &[Value]) -> Result<u64, DbError> {
    let bound = params_from_iter(params.iter().map(to_sql_value));

    // Statements that produce rows (PRAGMA, SELECT) are drained instead.
    if stmt.column_count() > 0 {
        let mut rows = stmt.query(bound).map_err(map_error)?;
        let mut count = 0u64;
        while rows.next().map_err(map_error)?.is_some() {
            count += 1;
        }
        return Ok(count);
    }

    let affected = stmt.execute(bound).map_err(map_error)?;
    Ok(affected as u64)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(r) => SqlValue::Real(*r),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(i),
        SqlValue::Real(r) => Value::Real(r),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Blob(b),
    }
}

fn map_error(err: rusqlite::Error) -> DbError {
    let kind = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => DbErrorKind::Constraint,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => DbErrorKind::Busy,
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::SystemIoFailure
            | ErrorCode::DatabaseCorrupt => DbErrorKind::Connection,
            _ => DbErrorKind::Statement,
        },
        rusqlite::Error::InvalidQuery | rusqlite::Error::MultipleStatement => {
            DbErrorKind::Statement
        }
        _ => DbErrorKind::Other,
    };
    DbError::new(kind, err.to_string())
}
