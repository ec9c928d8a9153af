//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tidemark_core::connection::{Row, TableSpec};
use tidemark_core::{
    Connection, DbError, DbErrorKind, MemoryEventSink, MemorySource, MigrationConfig, Migrator,
    SqliteConnection, Value,
};

/// Three change sets over one table, each with an automatic or explicit
/// rollback.
pub const PEOPLE: &str = r#"{
    "databaseChangeLog": [
        {"changeSet": {"id": "1", "author": "alice", "changes": [
            {"createTable": {"tableName": "person", "columns": [
                {"name": "id", "type": "INTEGER", "primaryKey": true}
            ]}}
        ]}},
        {"changeSet": {"id": "2", "author": "alice", "changes": [
            {"addColumn": {"tableName": "person", "columns": [
                {"name": "name", "type": "TEXT"}
            ]}}
        ], "rollback": "ALTER TABLE person DROP COLUMN name"}},
        {"changeSet": {"id": "3", "author": "bob", "changes": [
            {"createIndex": {"indexName": "person_name", "tableName": "person", "columns": ["name"]}}
        ]}}
    ]
}"#;

/// A database file in a temporary directory.
pub struct TestDb {
    pub dir: tempfile::TempDir,
    pub path: PathBuf,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        Self { dir, path }
    }

    pub fn connect(&self) -> SqliteConnection {
        SqliteConnection::open(&self.path).unwrap()
    }

    /// Migrator over a single in-memory changelog file `db.json`.
    pub fn migrator(&self, changelog: &str) -> Migrator<SqliteConnection> {
        let source = MemorySource::new().with_file("db.json", changelog);
        Migrator::new(self.connect(), source, "db.json")
            .with_config(MigrationConfig::new().with_holder("test-runner"))
    }

    /// Same as [`TestDb::migrator`], recording events.
    pub fn recorded(&self, changelog: &str) -> (Migrator<SqliteConnection>, MemoryEventSink) {
        let sink = MemoryEventSink::new();
        let migrator = self.migrator(changelog).with_event_sink(Arc::new(sink.clone()));
        (migrator, sink)
    }
}

/// Build a JSON changelog from change set bodies.
pub fn json_changelog(change_sets: &[&str]) -> String {
    let items: Vec<String> = change_sets
        .iter()
        .map(|cs| format!(r#"{{"changeSet": {}}}"#, cs))
        .collect();
    format!(r#"{{"databaseChangeLog": [{}]}}"#, items.join(", "))
}

/// Connection that fails tracking inserts once `allowed` of them went through.
pub struct FlakyConnection {
    pub inner: SqliteConnection,
    pub allowed: usize,
    inserts: usize,
}

impl FlakyConnection {
    pub fn new(inner: SqliteConnection, allowed: usize) -> Self {
        Self {
            inner,
            allowed,
            inserts: 0,
        }
    }
}

impl Connection for FlakyConnection {
    fn dbms(&self) -> &str {
        self.inner.dbms()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        if sql.starts_with("INSERT INTO tidemark_changelog") {
            if self.inserts >= self.allowed {
                return Err(DbError::new(DbErrorKind::Other, "disk I/O error"));
            }
            self.inserts += 1;
        }
        self.inner.execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        self.inner.query(sql, params)
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.inner.rollback()
    }

    fn create_table_if_not_exists(&mut self, table: &TableSpec) -> Result<(), DbError> {
        self.inner.create_table_if_not_exists(table)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, DbError> {
        self.inner.table_exists(table)
    }

    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, DbError> {
        self.inner.column_exists(table, column)
    }

    fn index_exists(&mut self, index: &str) -> Result<bool, DbError> {
        self.inner.index_exists(index)
    }

    fn view_exists(&mut self, view: &str) -> Result<bool, DbError> {
        self.inner.view_exists(view)
    }

    fn busy_timeout(&self) -> Option<Duration> {
        self.inner.busy_timeout()
    }

    fn set_busy_timeout(&mut self, timeout: Duration) -> Result<(), DbError> {
        self.inner.set_busy_timeout(timeout)
    }
}
