//! Execution tracking store.
//!
//! History lives in a table inside the target database, one row per change
//! set identity. The row is written in the same transaction as the change
//! set's statements, so the table always reflects exactly what committed.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::changelog::change::quote_text;
use crate::changelog::{ChangeSet, ChangeSetId};
use crate::connection::{ColumnSpec, ColumnType, Connection, DbError, Row, TableSpec, Value};

/// Default tracking table name.
pub const DEFAULT_TRACKING_TABLE: &str = "tidemark_changelog";

/// Author of records the engine writes for itself.
pub const INTERNAL_AUTHOR: &str = "tidemark";

/// Changelog path of records the engine writes for itself.
pub const INTERNAL_FILENAME: &str = "tidemark-internal";

const COLUMNS: &str = "id, author, filename, date_executed, order_executed, exec_type, \
                       checksum, description, comments, tag, contexts, labels, deployment_id";

/// Outcome stored with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecType {
    /// First successful execution.
    Executed,
    /// Re-execution of an already applied change set.
    Reran,
    /// Failed with `failOnError = false`.
    Failed,
    /// Recorded without execution.
    MarkRan,
}

impl ExecType {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecType::Executed => "EXECUTED",
            ExecType::Reran => "RERAN",
            ExecType::Failed => "FAILED",
            ExecType::MarkRan => "MARK_RAN",
        }
    }

    /// Parse the stored form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXECUTED" => Some(ExecType::Executed),
            "RERAN" => Some(ExecType::Reran),
            "FAILED" => Some(ExecType::Failed),
            "MARK_RAN" => Some(ExecType::MarkRan),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the tracking table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    /// Change set identity.
    pub id: ChangeSetId,
    /// When the change set was executed.
    pub date_executed: DateTime<Utc>,
    /// Position in execution order.
    pub order_executed: i64,
    /// Outcome.
    pub exec_type: ExecType,
    /// Checksum at execution time; `None` once cleared.
    pub checksum: Option<String>,
    /// Summary of the changes.
    pub description: String,
    /// Change set comment.
    pub comments: Option<String>,
    /// Tag attached to this record.
    pub tag: Option<String>,
    /// Context expression at execution time.
    pub contexts: Option<String>,
    /// Labels at execution time.
    pub labels: Option<String>,
    /// Run that wrote the record.
    pub deployment_id: Option<String>,
}

impl ExecutionRecord {
    /// Build the record for a change set.
    pub fn for_change_set(
        change_set: &ChangeSet,
        exec_type: ExecType,
        checksum: Option<String>,
        order_executed: i64,
        deployment_id: Option<String>,
    ) -> Self {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        Self {
            id: change_set.id.clone(),
            date_executed: now(),
            order_executed,
            exec_type,
            checksum,
            description: change_set.description(),
            comments: change_set.comment.clone(),
            tag: change_set.declared_tags().last().map(str::to_string),
            contexts: non_empty(change_set.contexts.to_string()),
            labels: non_empty(change_set.labels_string()),
            deployment_id,
        }
    }

    /// Internal record carrying `tag` at position `order_executed`.
    pub fn tag_marker(tag: &str, order_executed: i64) -> Self {
        Self {
            id: ChangeSetId::new(format!("tag-{}", tag), INTERNAL_AUTHOR, INTERNAL_FILENAME),
            date_executed: now(),
            order_executed,
            exec_type: ExecType::Executed,
            checksum: None,
            description: format!("tagDatabase tag={}", tag),
            comments: None,
            tag: Some(tag.to_string()),
            contexts: None,
            labels: None,
            deployment_id: None,
        }
    }

    /// Whether the record counts as applied. Failed executions do not.
    pub fn is_applied(&self) -> bool {
        self.exec_type != ExecType::Failed
    }

    /// Whether the engine wrote this record for itself (tag markers).
    pub fn is_internal(&self) -> bool {
        self.id.path == INTERNAL_FILENAME && self.id.author == INTERNAL_AUTHOR
    }

    fn from_row(row: &Row) -> Result<Self, TrackingError> {
        let date = row.text(3)?;
        let date_executed = DateTime::parse_from_rfc3339(&date)
            .map_err(|e| TrackingError::Corrupt(format!("bad date_executed '{}': {}", date, e)))?
            .with_timezone(&Utc);
        let exec = row.text(5)?;
        let exec_type = ExecType::parse(&exec)
            .ok_or_else(|| TrackingError::Corrupt(format!("unknown exec_type '{}'", exec)))?;

        Ok(Self {
            id: ChangeSetId::new(row.text(0)?, row.text(1)?, row.text(2)?),
            date_executed,
            order_executed: row.integer(4)?,
            exec_type,
            checksum: row.opt_text(6)?,
            description: row.opt_text(7)?.unwrap_or_default(),
            comments: row.opt_text(8)?,
            tag: row.opt_text(9)?,
            contexts: row.opt_text(10)?,
            labels: row.opt_text(11)?,
            deployment_id: row.opt_text(12)?,
        })
    }

    fn params(&self) -> Vec<Value> {
        vec![
            Value::from(self.id.id.as_str()),
            Value::from(self.id.author.as_str()),
            Value::from(self.id.path.as_str()),
            Value::from(format_date(&self.date_executed)),
            Value::from(self.order_executed),
            Value::from(self.exec_type.as_str()),
            Value::from(self.checksum.clone()),
            Value::from(self.description.as_str()),
            Value::from(self.comments.clone()),
            Value::from(self.tag.clone()),
            Value::from(self.contexts.clone()),
            Value::from(self.labels.clone()),
            Value::from(self.deployment_id.clone()),
        ]
    }
}

/// Tracking store errors.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// The database rejected a read or write.
    #[error("tracking store: {0}")]
    Database(#[from] DbError),

    /// A tag with this name already exists.
    #[error("tag '{0}' already exists")]
    TagExists(String),

    /// A stored row cannot be interpreted.
    #[error("corrupt tracking record: {0}")]
    Corrupt(String),
}

/// Result of tagging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagOutcome {
    /// Tag name.
    pub tag: String,
    /// Record that now carries the tag.
    pub record: ChangeSetId,
    /// Whether a marker record was inserted to carry it.
    pub marker_inserted: bool,
}

/// Current time at the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::parse_from_rfc3339(&format_date(&now))
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(now)
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Reads and writes the tracking table.
#[derive(Debug, Clone)]
pub struct TrackingStore {
    table: String,
}

impl Default for TrackingStore {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKING_TABLE)
    }
}

impl TrackingStore {
    /// Create a store over the named table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Table definition.
    pub fn spec(&self) -> TableSpec {
        TableSpec::new(&self.table)
            .with_column(ColumnSpec::required("id", ColumnType::Text))
            .with_column(ColumnSpec::required("author", ColumnType::Text))
            .with_column(ColumnSpec::required("filename", ColumnType::Text))
            .with_column(ColumnSpec::required("date_executed", ColumnType::Text))
            .with_column(ColumnSpec::required("order_executed", ColumnType::Integer))
            .with_column(ColumnSpec::required("exec_type", ColumnType::Text))
            .with_column(ColumnSpec::optional("checksum", ColumnType::Text))
            .with_column(ColumnSpec::optional("description", ColumnType::Text))
            .with_column(ColumnSpec::optional("comments", ColumnType::Text))
            .with_column(ColumnSpec::optional("tag", ColumnType::Text))
            .with_column(ColumnSpec::optional("contexts", ColumnType::Text))
            .with_column(ColumnSpec::optional("labels", ColumnType::Text))
            .with_column(ColumnSpec::optional("deployment_id", ColumnType::Text))
            .with_primary_key(["id", "author", "filename"])
    }

    /// Create the table if it does not exist.
    pub fn ensure(&self, conn: &mut dyn Connection) -> Result<(), TrackingError> {
        conn.create_table_if_not_exists(&self.spec())?;
        Ok(())
    }

    /// Check whether the table exists.
    pub fn exists(&self, conn: &mut dyn Connection) -> Result<bool, TrackingError> {
        Ok(conn.table_exists(&self.table)?)
    }

    /// All records in execution order.
    pub fn history(&self, conn: &mut dyn Connection) -> Result<Vec<ExecutionRecord>, TrackingError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY order_executed",
            COLUMNS, self.table
        );
        conn.query(&sql, &[])?
            .iter()
            .map(ExecutionRecord::from_row)
            .collect()
    }

    /// History without creating the table; empty when it does not exist.
    pub fn history_if_present(
        &self,
        conn: &mut dyn Connection,
    ) -> Result<Vec<ExecutionRecord>, TrackingError> {
        if !self.exists(conn)? {
            return Ok(Vec::new());
        }
        self.history(conn)
    }

    /// Sequence number for the next record.
    pub fn next_sequence(&self, conn: &mut dyn Connection) -> Result<i64, TrackingError> {
        let sql = format!("SELECT COALESCE(MAX(order_executed), 0) FROM {}", self.table);
        let rows = conn.query(&sql, &[])?;
        let max = match rows.first() {
            Some(row) => row.integer(0)?,
            None => 0,
        };
        Ok(max + 1)
    }

    /// Write a record, replacing the row with the same identity.
    pub fn record(
        &self,
        conn: &mut dyn Connection,
        record: &ExecutionRecord,
    ) -> Result<(), TrackingError> {
        let params = record.params();
        let update = format!(
            "UPDATE {} SET date_executed = ?4, order_executed = ?5, exec_type = ?6, \
             checksum = ?7, description = ?8, comments = ?9, tag = ?10, contexts = ?11, \
             labels = ?12, deployment_id = ?13 \
             WHERE id = ?1 AND author = ?2 AND filename = ?3",
            self.table
        );
        if conn.execute(&update, &params)? == 0 {
            let insert = format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                self.table, COLUMNS
            );
            conn.execute(&insert, &params)?;
        }
        tracing::debug!(
            change_set = %record.id,
            exec_type = %record.exec_type,
            order = record.order_executed,
            "recorded change set"
        );
        Ok(())
    }

    /// Delete the record for an identity. Returns whether a row was removed.
    pub fn remove(&self, conn: &mut dyn Connection, id: &ChangeSetId) -> Result<bool, TrackingError> {
        let sql = format!(
            "DELETE FROM {} WHERE id = ?1 AND author = ?2 AND filename = ?3",
            self.table
        );
        let removed = conn.execute(&sql, &identity_params(id))?;
        Ok(removed > 0)
    }

    /// Store a fresh checksum for an identity.
    pub fn update_checksum(
        &self,
        conn: &mut dyn Connection,
        id: &ChangeSetId,
        checksum: &str,
    ) -> Result<(), TrackingError> {
        let sql = format!(
            "UPDATE {} SET checksum = ?4 WHERE id = ?1 AND author = ?2 AND filename = ?3",
            self.table
        );
        let mut params = identity_params(id);
        params.push(Value::from(checksum));
        conn.execute(&sql, &params)?;
        Ok(())
    }

    /// Forget every stored checksum. History is kept.
    pub fn clear_checksums(&self, conn: &mut dyn Connection) -> Result<u64, TrackingError> {
        let sql = format!("UPDATE {} SET checksum = NULL", self.table);
        let cleared = conn.execute(&sql, &[])?;
        tracing::info!(table = %self.table, cleared, "cleared checksums");
        Ok(cleared)
    }

    /// Attach a tag to the most recent record.
    ///
    /// When history is empty, or the most recent record already carries a
    /// different tag, a marker record is inserted to carry the new one.
    pub fn tag(&self, conn: &mut dyn Connection, name: &str) -> Result<TagOutcome, TrackingError> {
        let history = self.history(conn)?;
        if history.iter().any(|r| r.tag.as_deref() == Some(name)) {
            return Err(TrackingError::TagExists(name.to_string()));
        }

        if let Some(latest) = history.last().filter(|r| r.tag.is_none()) {
            let sql = format!(
                "UPDATE {} SET tag = ?4 WHERE id = ?1 AND author = ?2 AND filename = ?3",
                self.table
            );
            let mut params = identity_params(&latest.id);
            params.push(Value::from(name));
            conn.execute(&sql, &params)?;
            tracing::info!(tag = %name, change_set = %latest.id, "tagged database");
            return Ok(TagOutcome {
                tag: name.to_string(),
                record: latest.id.clone(),
                marker_inserted: false,
            });
        }

        let order = history.last().map(|r| r.order_executed).unwrap_or(0) + 1;
        let marker = ExecutionRecord::tag_marker(name, order);
        self.record(conn, &marker)?;
        tracing::info!(tag = %name, "tagged database with marker record");
        Ok(TagOutcome {
            tag: name.to_string(),
            record: marker.id,
            marker_inserted: true,
        })
    }

    /// Render the statement that writes a record, with inline literals.
    pub fn render_insert(&self, record: &ExecutionRecord) -> String {
        let values: Vec<String> = record.params().iter().map(literal).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            COLUMNS,
            values.join(", ")
        )
    }

    /// Render the statement that removes a record, with inline literals.
    pub fn render_delete(&self, id: &ChangeSetId) -> String {
        format!(
            "DELETE FROM {} WHERE id = {} AND author = {} AND filename = {}",
            self.table,
            quote_text(&id.id),
            quote_text(&id.author),
            quote_text(&id.path)
        )
    }
}

fn identity_params(id: &ChangeSetId) -> Vec<Value> {
    vec![
        Value::from(id.id.as_str()),
        Value::from(id.author.as_str()),
        Value::from(id.path.as_str()),
    ]
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Text(s) => quote_text(s),
        other => other.to_display_string(),
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::changelog::Change;
    use crate::connection::SqliteConnection;

    fn setup() -> (SqliteConnection, TrackingStore) {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let store = TrackingStore::default();
        store.ensure(&mut conn).unwrap();
        (conn, store)
    }

    fn record(id: &str, order: i64) -> ExecutionRecord {
        let cs = ChangeSet::new(id, "alice", "db.json").with_change(Change::sql("SELECT 1"));
        ExecutionRecord::for_change_set(&cs, ExecType::Executed, Some("1:abc".into()), order, None)
    }

    #[test]
    fn test_record_and_history() {
        let (mut conn, store) = setup();
        store.record(&mut conn, &record("2", 2)).unwrap();
        store.record(&mut conn, &record("1", 1)).unwrap();

        let history = store.history(&mut conn).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id.id, "1");
        assert_eq!(history[0], record_with_date(&record("1", 1), history[0].date_executed));
        assert_eq!(store.next_sequence(&mut conn).unwrap(), 3);
    }

    fn record_with_date(r: &ExecutionRecord, date: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            date_executed: date,
            ..r.clone()
        }
    }

    #[test]
    fn test_rerun_replaces_row() {
        let (mut conn, store) = setup();
        store.record(&mut conn, &record("1", 1)).unwrap();
        let mut rerun = record("1", 2);
        rerun.exec_type = ExecType::Reran;
        rerun.checksum = Some("1:new".into());
        store.record(&mut conn, &rerun).unwrap();

        let history = store.history(&mut conn).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].exec_type, ExecType::Reran);
        assert_eq!(history[0].order_executed, 2);
        assert_eq!(history[0].checksum.as_deref(), Some("1:new"));
    }

    #[test]
    fn test_history_if_present_does_not_create() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let store = TrackingStore::default();
        assert!(store.history_if_present(&mut conn).unwrap().is_empty());
        assert!(!store.exists(&mut conn).unwrap());
    }

    #[test]
    fn test_clear_and_update_checksums() {
        let (mut conn, store) = setup();
        store.record(&mut conn, &record("1", 1)).unwrap();
        assert_eq!(store.clear_checksums(&mut conn).unwrap(), 1);
        assert_eq!(store.history(&mut conn).unwrap()[0].checksum, None);

        let id = ChangeSetId::new("1", "alice", "db.json");
        store.update_checksum(&mut conn, &id, "1:fresh").unwrap();
        assert_eq!(
            store.history(&mut conn).unwrap()[0].checksum.as_deref(),
            Some("1:fresh")
        );
    }

    #[test]
    fn test_tag_latest_record() {
        let (mut conn, store) = setup();
        store.record(&mut conn, &record("1", 1)).unwrap();
        store.record(&mut conn, &record("2", 2)).unwrap();

        let outcome = store.tag(&mut conn, "v1").unwrap();
        assert!(!outcome.marker_inserted);
        assert_eq!(outcome.record.id, "2");
        assert!(matches!(
            store.tag(&mut conn, "v1"),
            Err(TrackingError::TagExists(_))
        ));
    }

    #[test]
    fn test_tag_inserts_marker_when_needed() {
        let (mut conn, store) = setup();
        let outcome = store.tag(&mut conn, "empty").unwrap();
        assert!(outcome.marker_inserted);

        store.record(&mut conn, &record("1", 2)).unwrap();
        store.tag(&mut conn, "v1").unwrap();
        let second = store.tag(&mut conn, "v1.1").unwrap();
        assert!(second.marker_inserted);

        let history = store.history(&mut conn).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].is_internal());
        assert_eq!(history[1].tag.as_deref(), Some("v1"));
        assert_eq!(history[2].tag.as_deref(), Some("v1.1"));
        assert_eq!(history[2].order_executed, 3);
    }

    #[test]
    fn test_remove() {
        let (mut conn, store) = setup();
        store.record(&mut conn, &record("1", 1)).unwrap();
        let id = ChangeSetId::new("1", "alice", "db.json");
        assert!(store.remove(&mut conn, &id).unwrap());
        assert!(!store.remove(&mut conn, &id).unwrap());
    }

    #[test]
    fn test_rendered_statements_execute() {
        let (mut conn, store) = setup();
        let mut r = record("it's", 1);
        r.comments = Some("quoted 'comment'".into());
        conn.execute(&store.render_insert(&r), &[]).unwrap();
        assert_eq!(store.history(&mut conn).unwrap()[0].id.id, "it's");
        conn.execute(&store.render_delete(&r.id), &[]).unwrap();
        assert!(store.history(&mut conn).unwrap().is_empty());
    }

    #[test]
    fn test_record_captures_change_set_metadata() {
        let cs = ChangeSet::new("1", "a", "p")
            .with_change(Change::TagDatabase { tag: "v2".into() })
            .with_labels(["x", "y"]);
        let r = ExecutionRecord::for_change_set(&cs, ExecType::MarkRan, None, 5, Some("d1".into()));
        assert_eq!(r.tag.as_deref(), Some("v2"));
        assert_eq!(r.labels.as_deref(), Some("x,y"));
        assert_eq!(r.contexts, None);
        assert!(r.is_applied());
    }
}
