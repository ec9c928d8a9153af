//! Integration tests for rollback and tagging.

mod common;

use std::thread;
use std::time::Duration;

use chrono::Utc;
use common::{json_changelog, TestDb, PEOPLE};
use pretty_assertions::assert_eq;
use tidemark_core::{ChangeSetId, Connection, EntryStatus, MigrationError, Target};

fn id(id: &str, author: &str) -> ChangeSetId {
    ChangeSetId::new(id, author, "db.json")
}

/// Names of the user tables, sorted.
fn user_tables(conn: &mut impl Connection) -> Vec<String> {
    conn.query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'tidemark_%' ORDER BY name",
        &[],
    )
    .unwrap()
    .iter()
    .map(|row| row.text(0).unwrap())
    .collect()
}

#[test]
fn test_rollback_to_baseline_restores_schema() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);

    let tagged = migrator.tag("baseline").unwrap();
    assert!(tagged.marker_inserted);
    let before = user_tables(migrator.connection_mut());

    migrator.update(Target::All).unwrap();
    assert_eq!(user_tables(migrator.connection_mut()), vec!["person".to_string()]);

    let report = migrator.rollback(Target::DownToTag("baseline".into())).unwrap();
    assert_eq!(
        report.ids_with(EntryStatus::RolledBack),
        vec![id("3", "bob"), id("2", "alice"), id("1", "alice")]
    );
    assert_eq!(user_tables(migrator.connection_mut()), before);

    // Only the marker is left and every change set is pending again.
    let history = migrator.history().unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_internal());
    assert_eq!(migrator.status().unwrap().pending_count, 3);

    migrator.update(Target::All).unwrap();
    assert!(migrator.connection_mut().index_exists("person_name").unwrap());
}

#[test]
fn test_tagged_change_set_survives_rollback() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);
    migrator.update(Target::Count(2)).unwrap();

    let tagged = migrator.tag("v1").unwrap();
    assert!(!tagged.marker_inserted);
    assert_eq!(tagged.record, id("2", "alice"));

    migrator.update(Target::All).unwrap();
    let report = migrator.rollback(Target::DownToTag("v1".into())).unwrap();
    assert_eq!(report.ids_with(EntryStatus::RolledBack), vec![id("3", "bob")]);

    let conn = migrator.connection_mut();
    assert!(!conn.index_exists("person_name").unwrap());
    assert!(conn.column_exists("person", "name").unwrap());
    assert_eq!(migrator.status().unwrap().pending, vec![id("3", "bob")]);
}

#[test]
fn test_rollback_by_count_and_date() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);
    migrator.update(Target::Count(1)).unwrap();
    thread::sleep(Duration::from_millis(20));
    let cutoff = Utc::now();
    thread::sleep(Duration::from_millis(20));
    migrator.update(Target::All).unwrap();

    let last = migrator.rollback(Target::RollbackCount(1)).unwrap();
    assert_eq!(last.ids_with(EntryStatus::RolledBack), vec![id("3", "bob")]);

    let since = migrator.rollback(Target::UpToDate(cutoff)).unwrap();
    assert_eq!(since.ids_with(EntryStatus::RolledBack), vec![id("2", "alice")]);

    let conn = migrator.connection_mut();
    assert!(conn.table_exists("person").unwrap());
    assert!(!conn.column_exists("person", "name").unwrap());
}

#[test]
fn test_missing_rollback_fails_whole_plan() {
    let log = json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE raw (id INTEGER)"}}]}"#,
        r#"{"id": "2", "author": "a", "changes": [{"createTable": {"tableName": "typed", "columns": [{"name": "id", "type": "INTEGER"}]}}]}"#,
    ]);
    let db = TestDb::new();
    let mut migrator = db.migrator(&log);
    migrator.update(Target::All).unwrap();

    let err = migrator.rollback(Target::RollbackCount(2)).unwrap_err();
    assert!(matches!(err, MigrationError::NoRollbackDefined(ref cs) if *cs == id("1", "a")));

    // Nothing ran, not even the change set that could be undone.
    assert!(migrator.connection_mut().table_exists("typed").unwrap());
    assert_eq!(migrator.history().unwrap().len(), 2);
    assert!(migrator.list_locks().unwrap().is_empty());
}

#[test]
fn test_unknown_tag_and_change_set() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);
    migrator.update(Target::All).unwrap();

    assert!(matches!(
        migrator.rollback(Target::DownToTag("nope".into())),
        Err(MigrationError::UnknownTag(_))
    ));

    let trimmed = json_changelog(&[
        r#"{"id": "1", "author": "alice", "changes": [{"createTable": {"tableName": "person", "columns": [{"name": "id", "type": "INTEGER", "primaryKey": true}]}}]}"#,
    ]);
    let mut migrator = db.migrator(&trimmed);
    let status = migrator.status().unwrap();
    assert_eq!(status.unknown_records, vec![id("2", "alice"), id("3", "bob")]);

    let err = migrator.rollback(Target::RollbackCount(1)).unwrap_err();
    assert!(matches!(err, MigrationError::UnknownChangeSet(ref cs) if *cs == id("3", "bob")));
}

#[test]
fn test_forward_target_is_rejected_by_rollback() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);
    assert!(matches!(
        migrator.rollback(Target::All),
        Err(MigrationError::Config(_))
    ));
    assert!(matches!(
        migrator.update(Target::RollbackCount(1)),
        Err(MigrationError::Config(_))
    ));
}

#[test]
fn test_mark_ran_records_are_forgotten() {
    let log = json_changelog(&[
        r#"{"id": "1", "author": "a",
            "preConditions": {"onFail": "MARK_RAN", "conditions": [{"tableExists": {"tableName": "nowhere"}}]},
            "changes": [{"sql": {"sql": "DROP TABLE nowhere"}}]}"#,
    ]);
    let db = TestDb::new();
    let mut migrator = db.migrator(&log);
    migrator.update(Target::All).unwrap();

    let report = migrator.rollback(Target::RollbackCount(1)).unwrap();
    assert_eq!(report.ids_with(EntryStatus::Forgotten), vec![id("1", "a")]);
    assert!(migrator.history().unwrap().is_empty());
}

#[test]
fn test_rollback_sql_previews_without_side_effects() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);
    migrator.update(Target::All).unwrap();

    let script = migrator.rollback_sql(Target::RollbackCount(2)).unwrap();
    let text = script.to_string();
    let drop_index = text.find("DROP INDEX person_name").unwrap();
    let drop_column = text.find("ALTER TABLE person DROP COLUMN name").unwrap();
    assert!(drop_index < drop_column);
    assert!(text.contains("DELETE FROM tidemark_changelog"));

    assert!(migrator.connection_mut().index_exists("person_name").unwrap());
    assert_eq!(migrator.history().unwrap().len(), 3);
}

#[test]
fn test_tag_names_are_unique() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);
    migrator.update(Target::All).unwrap();
    migrator.tag("release").unwrap();

    assert!(matches!(migrator.tag("release"), Err(MigrationError::Conflict(_))));
    assert!(matches!(migrator.tag("  "), Err(MigrationError::Config(_))));

    // A second tag on an already tagged record gets a marker.
    let second = migrator.tag("release-2").unwrap();
    assert!(second.marker_inserted);
}

#[test]
fn test_rollback_outside_transaction() {
    // VACUUM fails inside a transaction, in both directions.
    let log = json_changelog(&[
        r#"{"id": "1", "author": "a", "runInTransaction": false,
            "changes": [{"sql": {"sql": "VACUUM"}}], "rollback": "VACUUM"}"#,
    ]);
    let db = TestDb::new();
    let mut migrator = db.migrator(&log);
    migrator.tag("base").unwrap();
    migrator.update(Target::All).unwrap();

    let script = migrator.rollback_sql(Target::DownToTag("base".into())).unwrap();
    assert!(script.to_string().contains("runs outside a transaction"));

    let report = migrator.rollback(Target::DownToTag("base".into())).unwrap();
    assert_eq!(report.ids_with(EntryStatus::RolledBack), vec![id("1", "a")]);

    let history = migrator.history().unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_internal());
}

#[test]
fn test_tag_stays_put_when_its_record_reruns() {
    let first = json_changelog(&[
        r#"{"id": "1", "author": "a", "runAlways": true,
            "changes": [{"sql": {"sql": "CREATE TABLE IF NOT EXISTS t1 (id INTEGER)"}}],
            "rollback": "DROP TABLE t1"}"#,
    ]);
    let second = json_changelog(&[
        r#"{"id": "1", "author": "a", "runAlways": true,
            "changes": [{"sql": {"sql": "CREATE TABLE IF NOT EXISTS t1 (id INTEGER)"}}],
            "rollback": "DROP TABLE t1"}"#,
        r#"{"id": "2", "author": "a",
            "changes": [{"createTable": {"tableName": "t2", "columns": [{"name": "id", "type": "INTEGER"}]}}]}"#,
    ]);
    let db = TestDb::new();
    {
        let mut migrator = db.migrator(&first);
        migrator.update(Target::All).unwrap();
        let tagged = migrator.tag("v1").unwrap();
        assert!(!tagged.marker_inserted);
        assert_eq!(tagged.record, id("1", "a"));
    }

    let mut migrator = db.migrator(&second);
    let report = migrator.update(Target::All).unwrap();
    assert_eq!(report.ids_with(EntryStatus::Reran), vec![id("1", "a")]);

    // The rerun row moved forward; the tag stayed at the old position.
    let history = migrator.history().unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].is_internal());
    assert_eq!(history[0].tag.as_deref(), Some("v1"));
    assert_eq!(history[0].order_executed, 1);
    assert_eq!(history[1].id, id("1", "a"));
    assert_eq!(history[1].tag, None);

    let report = migrator.rollback(Target::DownToTag("v1".into())).unwrap();
    assert_eq!(
        report.ids_with(EntryStatus::RolledBack),
        vec![id("2", "a"), id("1", "a")]
    );
    assert!(user_tables(migrator.connection_mut()).is_empty());

    let history = migrator.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tag.as_deref(), Some("v1"));
}
