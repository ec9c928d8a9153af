//! Database connection abstraction.
//!
//! The engine never talks to a driver directly. Everything it needs from the
//! target database goes through the [`Connection`] trait: statement
//! execution, explicit transactions, an atomic create-if-not-exists for its
//! own bookkeeping tables, and a little catalog introspection for
//! preconditions.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConnection;

use std::time::Duration;

use thiserror::Error;

/// Classification of a database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Unique or primary key constraint violated.
    Constraint,
    /// The database is busy or locked by another session.
    Busy,
    /// The connection is unusable.
    Connection,
    /// Malformed SQL or a reference to a missing object.
    Statement,
    /// Anything else.
    Other,
}

/// Error returned by a [`Connection`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DbError {
    /// What kind of failure this is.
    pub kind: DbErrorKind,
    /// Driver message.
    pub message: String,
}

impl DbError {
    /// Create a new database error.
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Check if this is a constraint violation.
    pub fn is_constraint(&self) -> bool {
        self.kind == DbErrorKind::Constraint
    }

    /// Check if the database reported contention.
    pub fn is_busy(&self) -> bool {
        self.kind == DbErrorKind::Busy
    }
}

/// A bound parameter or a fetched column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Floating point.
    Real(f64),
    /// Text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Text content, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Check for NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render the value the way a SQL comparison result is usually printed.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Real(r) => r.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => hex::encode(b),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Create a row from its column values.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Column value by position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Required text column.
    pub fn text(&self, index: usize) -> Result<String, DbError> {
        match self.values.get(index) {
            Some(Value::Text(s)) => Ok(s.clone()),
            other => Err(DbError::new(
                DbErrorKind::Other,
                format!("expected text in column {}, found {:?}", index, other),
            )),
        }
    }

    /// Nullable text column.
    pub fn opt_text(&self, index: usize) -> Result<Option<String>, DbError> {
        match self.values.get(index) {
            Some(Value::Null) | None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(other) => Err(DbError::new(
                DbErrorKind::Other,
                format!("expected text in column {}, found {:?}", index, other),
            )),
        }
    }

    /// Required integer column.
    pub fn integer(&self, index: usize) -> Result<i64, DbError> {
        match self.values.get(index) {
            Some(Value::Integer(i)) => Ok(*i),
            other => Err(DbError::new(
                DbErrorKind::Other,
                format!("expected integer in column {}, found {:?}", index, other),
            )),
        }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check for a zero-column row.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Column type for engine-owned tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Variable length text.
    Text,
    /// 64-bit integer.
    Integer,
}

/// Column of an engine-owned table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Column type.
    pub ty: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

impl ColumnSpec {
    /// A NOT NULL column.
    pub fn required(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }

    /// A nullable column.
    pub fn optional(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }
}

/// Definition of a table the engine creates for itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name.
    pub name: String,
    /// Columns in order.
    pub columns: Vec<ColumnSpec>,
    /// Primary key column names.
    pub primary_key: Vec<String>,
}

impl TableSpec {
    /// Create an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    /// Set the primary key.
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// Capabilities the engine needs from a target database.
///
/// Implementations must make [`Connection::create_table_if_not_exists`]
/// atomic on the database side: two sessions racing to bootstrap the same
/// table must both succeed and end up with one table.
pub trait Connection {
    /// Short lowercase product name, matched by `dbms` preconditions.
    fn dbms(&self) -> &str;

    /// Execute a statement, returning the number of affected rows. Without
    /// parameters the text may hold several statements.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError>;

    /// Run a query and collect every row.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError>;

    /// Open a transaction.
    fn begin(&mut self) -> Result<(), DbError>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<(), DbError>;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> Result<(), DbError>;

    /// Create a table unless it already exists, atomically.
    fn create_table_if_not_exists(&mut self, table: &TableSpec) -> Result<(), DbError>;

    /// Check whether a table exists.
    fn table_exists(&mut self, table: &str) -> Result<bool, DbError>;

    /// Check whether a column exists on a table.
    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, DbError>;

    /// Check whether an index exists.
    fn index_exists(&mut self, index: &str) -> Result<bool, DbError>;

    /// Check whether a view exists.
    fn view_exists(&mut self, view: &str) -> Result<bool, DbError>;

    /// How long the driver waits on a locked database, when it waits at all.
    fn busy_timeout(&self) -> Option<Duration> {
        None
    }

    /// Change how long the driver waits on a locked database.
    fn set_busy_timeout(&mut self, _timeout: Duration) -> Result<(), DbError> {
        Ok(())
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn dbms(&self) -> &str {
        (**self).dbms()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        (**self).execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        (**self).query(sql, params)
    }

    fn begin(&mut self) -> Result<(), DbError> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<(), DbError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        (**self).rollback()
    }

    fn create_table_if_not_exists(&mut self, table: &TableSpec) -> Result<(), DbError> {
        (**self).create_table_if_not_exists(table)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, DbError> {
        (**self).table_exists(table)
    }

    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, DbError> {
        (**self).column_exists(table, column)
    }

    fn index_exists(&mut self, index: &str) -> Result<bool, DbError> {
        (**self).index_exists(index)
    }

    fn view_exists(&mut self, view: &str) -> Result<bool, DbError> {
        (**self).view_exists(view)
    }

    fn busy_timeout(&self) -> Option<Duration> {
        (**self).busy_timeout()
    }

    fn set_busy_timeout(&mut self, timeout: Duration) -> Result<(), DbError> {
        (**self).set_busy_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors() {
        let row = Row::new(vec![
            Value::Text("a".into()),
            Value::Null,
            Value::Integer(7),
        ]);
        assert_eq!(row.text(0).unwrap(), "a");
        assert_eq!(row.opt_text(1).unwrap(), None);
        assert_eq!(row.integer(2).unwrap(), 7);
        assert!(row.integer(0).is_err());
        assert_eq!(row.len(), 3);
    }

    #[test]
    fn test_value_from_option() {
        assert_eq!(Value::from(None::<String>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_table_spec_builder() {
        let spec = TableSpec::new("t")
            .with_column(ColumnSpec::required("id", ColumnType::Integer))
            .with_column(ColumnSpec::optional("note", ColumnType::Text))
            .with_primary_key(["id"]);
        assert_eq!(spec.columns.len(), 2);
        assert!(spec.columns[1].nullable);
        assert_eq!(spec.primary_key, vec!["id".to_string()]);
    }
}
