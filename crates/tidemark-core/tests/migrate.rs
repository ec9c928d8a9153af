//! Integration tests for forward runs.

mod common;

use common::{json_changelog, FlakyConnection, TestDb, PEOPLE};
use pretty_assertions::assert_eq;
use tidemark_core::{
    CancelToken, ChangeSetId, Connection, EntryStatus, EventSink, ExecType, MemorySource,
    MigrationConfig, MigrationError, MigrationEvent, MigrationEventKind, Migrator, ProblemKind,
    RunOutcome, Target,
};

fn id(id: &str, author: &str) -> ChangeSetId {
    ChangeSetId::new(id, author, "db.json")
}

#[test]
fn test_update_applies_everything_once() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);
    assert_eq!(migrator.status().unwrap().pending_count, 3);

    let report = migrator.update(Target::All).unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        report.ids_with(EntryStatus::Executed),
        vec![id("1", "alice"), id("2", "alice"), id("3", "bob")]
    );

    let conn = migrator.connection_mut();
    assert!(conn.table_exists("person").unwrap());
    assert!(conn.column_exists("person", "name").unwrap());
    assert!(conn.index_exists("person_name").unwrap());

    let status = migrator.status().unwrap();
    assert!(status.is_up_to_date());
    assert_eq!(status.applied_count, 3);

    // A second run finds nothing to do and writes nothing.
    let again = migrator.update(Target::All).unwrap();
    assert!(again.entries.is_empty());
    let history = migrator.history().unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.windows(2).all(|w| w[0].order_executed < w[1].order_executed));
    assert!(history
        .iter()
        .all(|r| r.deployment_id.as_deref() == Some(report.deployment_id.as_str())));
}

#[test]
fn test_new_connection_sees_recorded_history() {
    let db = TestDb::new();
    db.migrator(PEOPLE).update(Target::All).unwrap();

    let mut fresh = db.migrator(PEOPLE);
    assert!(fresh.status().unwrap().is_up_to_date());
    assert!(fresh.validate().unwrap().is_valid());
}

#[test]
fn test_update_by_count_and_tag() {
    let log = json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t1 (id INTEGER)"}}]}"#,
        r#"{"id": "2", "author": "a", "changes": [{"tagDatabase": {"tag": "v1"}}]}"#,
        r#"{"id": "3", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t3 (id INTEGER)"}}]}"#,
        r#"{"id": "4", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t4 (id INTEGER)"}}]}"#,
    ]);
    let db = TestDb::new();
    let mut migrator = db.migrator(&log);

    let first = migrator.update(Target::Count(1)).unwrap();
    assert_eq!(first.ids_with(EntryStatus::Executed), vec![id("1", "a")]);

    let to_tag = migrator.update(Target::UpToTag("v1".into())).unwrap();
    assert_eq!(to_tag.ids_with(EntryStatus::Executed), vec![id("2", "a")]);
    let history = migrator.history().unwrap();
    assert_eq!(history.last().unwrap().tag.as_deref(), Some("v1"));

    assert!(matches!(
        migrator.update(Target::UpToTag("v9".into())),
        Err(MigrationError::UnknownTag(tag)) if tag == "v9"
    ));

    let rest = migrator.update(Target::All).unwrap();
    assert_eq!(rest.completed(), 2);
    assert!(migrator.connection_mut().table_exists("t4").unwrap());
}

#[test]
fn test_failure_keeps_earlier_commits() {
    let log = json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t (id INTEGER)"}}]}"#,
        r#"{"id": "2", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE u (id INTEGER); INSERT INTO missing VALUES (1)"}}]}"#,
        r#"{"id": "3", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE w (id INTEGER)"}}]}"#,
    ]);
    let db = TestDb::new();
    let (mut migrator, sink) = db.recorded(&log);

    let err = migrator.update(Target::All).unwrap_err();
    let failure = match &err {
        MigrationError::ChangeSetFailure(failure) => failure,
        other => panic!("unexpected error {:?}", other),
    };
    assert_eq!(failure.id, id("2", "a"));
    assert!(failure.cause.contains("missing"));
    assert_eq!(failure.partial.ids_with(EntryStatus::Executed), vec![id("1", "a")]);

    let conn = migrator.connection_mut();
    assert!(conn.table_exists("t").unwrap());
    assert!(!conn.table_exists("u").unwrap());
    assert!(!conn.table_exists("w").unwrap());

    assert_eq!(migrator.history().unwrap().len(), 1);
    assert!(migrator.list_locks().unwrap().is_empty());
    assert!(sink.kinds().iter().any(|k| matches!(
        k,
        MigrationEventKind::RunFinished {
            outcome: RunOutcome::Failed,
            completed: 1,
            ..
        }
    )));
}

#[test]
fn test_fail_on_error_false_records_failure_and_continues() {
    let log = json_changelog(&[
        r#"{"id": "1", "author": "a", "failOnError": false, "changes": [{"sql": {"sql": "INSERT INTO missing VALUES (1)"}}]}"#,
        r#"{"id": "2", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t (id INTEGER)"}}]}"#,
    ]);
    let db = TestDb::new();
    let mut migrator = db.migrator(&log);

    let report = migrator.update(Target::All).unwrap();
    assert_eq!(report.count(EntryStatus::Failed), 1);
    assert_eq!(report.count(EntryStatus::Executed), 1);

    let history = migrator.history().unwrap();
    assert_eq!(history[0].exec_type, ExecType::Failed);
    assert_eq!(history[1].exec_type, ExecType::Executed);

    // A failed change set stays pending.
    let status = migrator.status().unwrap();
    assert_eq!(status.pending, vec![id("1", "a")]);
}

#[test]
fn test_tracking_write_failure_reports_partial_run() {
    let db = TestDb::new();
    let source = MemorySource::new().with_file("db.json", PEOPLE);
    let conn = FlakyConnection::new(db.connect(), 1);
    let mut migrator = Migrator::new(conn, source, "db.json");

    let err = migrator.update(Target::All).unwrap_err();
    assert!(matches!(err, MigrationError::Persistence { .. }));
    let partial = err.partial_report().expect("partial report");
    assert_eq!(partial.ids_with(EntryStatus::Executed), vec![id("1", "alice")]);

    let mut conn = migrator.into_connection().inner;
    assert!(conn.table_exists("person").unwrap());
    assert!(!conn.column_exists("person", "name").unwrap());

    let mut retry = db.migrator(PEOPLE);
    assert!(retry.list_locks().unwrap().is_empty());
    assert_eq!(retry.status().unwrap().pending_count, 2);
}

#[test]
fn test_edited_change_set_blocks_update() {
    let db = TestDb::new();
    let original = json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t (id INTEGER)"}}]}"#,
    ]);
    db.migrator(&original).update(Target::All).unwrap();

    let edited = json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t (id INTEGER, name TEXT)"}}]}"#,
        r#"{"id": "2", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE u (id INTEGER)"}}]}"#,
    ]);
    let mut migrator = db.migrator(&edited);

    let report = migrator.validate().unwrap();
    assert_eq!(report.problems.len(), 1);
    assert_eq!(report.problems[0].kind, ProblemKind::ChecksumMismatch);
    assert_eq!(report.problems[0].change_set, Some(id("1", "a")));

    let err = migrator.update(Target::All).unwrap_err();
    assert_eq!(err.problems().len(), 1);
    assert!(!migrator.connection_mut().table_exists("u").unwrap());
    assert_eq!(migrator.history().unwrap().len(), 1);
}

#[test]
fn test_whitespace_edits_keep_checksum() {
    let db = TestDb::new();
    let original = json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t (id INTEGER)"}}]}"#,
    ]);
    db.migrator(&original).update(Target::All).unwrap();

    let reformatted = json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t\n    (id   INTEGER)\n"}}]}"#,
    ]);
    let mut migrator = db.migrator(&reformatted);
    assert!(migrator.validate().unwrap().is_valid());
    assert!(migrator.status().unwrap().is_up_to_date());
}

#[test]
fn test_valid_checksum_any_accepts_edits() {
    let db = TestDb::new();
    db.migrator(&json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t (id INTEGER)"}}]}"#,
    ]))
    .update(Target::All)
    .unwrap();

    let mut migrator = db.migrator(&json_changelog(&[
        r#"{"id": "1", "author": "a", "validCheckSum": "ANY", "changes": [{"sql": {"sql": "CREATE TABLE t (id BIGINT)"}}]}"#,
    ]));
    assert!(migrator.validate().unwrap().is_valid());
    assert!(migrator.update(Target::All).unwrap().entries.is_empty());
}

#[test]
fn test_run_on_change_reruns_edited_change_set() {
    let db = TestDb::new();
    let view = |n: u32| {
        let change_set = format!(
            r#"{{"id": "view", "author": "a", "runOnChange": true, "changes": [{{"sql": {{"sql": "DROP VIEW IF EXISTS answer; CREATE VIEW answer AS SELECT {} AS n"}}}}]}}"#,
            n
        );
        json_changelog(&[change_set.as_str()])
    };
    db.migrator(&view(1)).update(Target::All).unwrap();

    let mut migrator = db.migrator(&view(2));
    assert!(migrator.validate().unwrap().is_valid());
    let report = migrator.update(Target::All).unwrap();
    assert_eq!(report.ids_with(EntryStatus::Reran), vec![id("view", "a")]);

    let history = migrator.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].exec_type, ExecType::Reran);

    let rows = migrator.connection_mut().query("SELECT n FROM answer", &[]).unwrap();
    assert_eq!(rows[0].integer(0).unwrap(), 2);
}

#[test]
fn test_run_always_runs_every_time() {
    let log = json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE runs (n INTEGER)"}}]}"#,
        r#"{"id": "2", "author": "a", "runAlways": true, "changes": [{"sql": {"sql": "INSERT INTO runs (n) VALUES (1)"}}]}"#,
    ]);
    let db = TestDb::new();
    let mut migrator = db.migrator(&log);
    migrator.update(Target::All).unwrap();
    let second = migrator.update(Target::All).unwrap();
    assert_eq!(second.ids_with(EntryStatus::Reran), vec![id("2", "a")]);
    migrator.update(Target::All).unwrap();

    let rows = migrator.connection_mut().query("SELECT COUNT(*) FROM runs", &[]).unwrap();
    assert_eq!(rows[0].integer(0).unwrap(), 3);
    assert_eq!(migrator.history().unwrap().len(), 2);
}

#[test]
fn test_preconditions_mark_ran_and_continue() {
    let log = json_changelog(&[
        r#"{"id": "legacy", "author": "a",
            "preConditions": {"onFail": "MARK_RAN", "conditions": [{"not": [{"tableExists": {"tableName": "person"}}]}]},
            "changes": [{"sql": {"sql": "CREATE TABLE person (id INTEGER)"}}]}"#,
        r#"{"id": "audit", "author": "a",
            "preConditions": {"onFail": "CONTINUE", "conditions": [{"tableExists": {"tableName": "audit_source"}}]},
            "changes": [{"sql": {"sql": "CREATE TABLE audit (id INTEGER)"}}]}"#,
    ]);
    let db = TestDb::new();
    db.connect()
        .execute("CREATE TABLE person (id INTEGER)", &[])
        .unwrap();

    let mut migrator = db.migrator(&log);
    let report = migrator.update(Target::All).unwrap();
    assert_eq!(report.ids_with(EntryStatus::MarkRan), vec![id("legacy", "a")]);
    assert_eq!(report.ids_with(EntryStatus::Skipped), vec![id("audit", "a")]);

    let history = migrator.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].exec_type, ExecType::MarkRan);
    assert_eq!(migrator.status().unwrap().pending, vec![id("audit", "a")]);
    assert!(!migrator.connection_mut().table_exists("audit").unwrap());
}

#[test]
fn test_dbms_precondition_halts_before_running() {
    let log = json_changelog(&[
        r#"{"id": "1", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t (id INTEGER)"}}]}"#,
        r#"{"id": "2", "author": "a", "preConditions": {"conditions": [{"dbms": {"type": "postgresql"}}]},
            "changes": [{"sql": {"sql": "CREATE TABLE u (id INTEGER)"}}]}"#,
    ]);
    let db = TestDb::new();
    let mut migrator = db.migrator(&log);

    let err = migrator.update(Target::All).unwrap_err();
    assert_eq!(err.problems()[0].kind, ProblemKind::PreconditionHalt);
    assert!(!migrator.connection_mut().table_exists("t").unwrap());
    assert!(migrator.history().unwrap().is_empty());
}

#[test]
fn test_contexts_and_labels_filter_change_sets() {
    let log = json_changelog(&[
        r#"{"id": "schema", "author": "a", "changes": [{"sql": {"sql": "CREATE TABLE t (id INTEGER)"}}]}"#,
        r#"{"id": "seed", "author": "a", "context": "test", "changes": [{"sql": {"sql": "INSERT INTO t VALUES (1)"}}]}"#,
        r#"{"id": "v2", "author": "a", "labels": "v2", "changes": [{"sql": {"sql": "CREATE TABLE t2 (id INTEGER)"}}]}"#,
    ]);
    let db = TestDb::new();
    let config = MigrationConfig::new()
        .with_contexts(["prod"])
        .with_label_expression("v1")
        .unwrap();
    let mut migrator = db.migrator(&log).with_config(config);

    let status = migrator.status().unwrap();
    assert_eq!(status.pending, vec![id("schema", "a")]);
    assert_eq!(status.filtered, vec![id("seed", "a"), id("v2", "a")]);

    let report = migrator.update(Target::All).unwrap();
    assert_eq!(report.ids_with(EntryStatus::Executed), vec![id("schema", "a")]);

    // A different filter picks up what was left behind.
    let mut everything = db.migrator(&log);
    assert_eq!(everything.update(Target::All).unwrap().completed(), 2);
}

struct CancelAfterFirst(CancelToken);

impl EventSink for CancelAfterFirst {
    fn emit(&self, event: &MigrationEvent) {
        if matches!(event.kind, MigrationEventKind::ChangeSetApplied { .. }) {
            self.0.cancel();
        }
    }
}

#[test]
fn test_cancel_stops_between_change_sets() {
    let db = TestDb::new();
    let migrator = db.migrator(PEOPLE);
    let sink = CancelAfterFirst(migrator.cancel_token());
    let mut migrator = migrator.with_event_sink(std::sync::Arc::new(sink));

    let report = migrator.update(Target::All).unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.completed(), 1);
    assert!(migrator.list_locks().unwrap().is_empty());
    assert_eq!(migrator.status().unwrap().pending_count, 2);
}

#[test]
fn test_update_sql_previews_without_side_effects() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);

    let script = migrator.update_sql(Target::Count(2)).unwrap();
    let text = script.to_string();
    assert!(text.contains("CREATE TABLE person"));
    assert!(text.contains("ALTER TABLE person ADD COLUMN name TEXT"));
    assert!(!text.contains("CREATE INDEX"));
    assert!(text.contains("INSERT INTO tidemark_changelog"));
    assert!(text.contains("created by the first update"));

    let conn = migrator.connection_mut();
    assert!(!conn.table_exists("person").unwrap());
    assert!(!conn.table_exists("tidemark_changelog").unwrap());
}

#[test]
fn test_changelog_sync_records_without_running() {
    let db = TestDb::new();
    let mut migrator = db.migrator(PEOPLE);

    let report = migrator.changelog_sync(Target::All).unwrap();
    assert_eq!(report.completed(), 3);
    assert!(!migrator.connection_mut().table_exists("person").unwrap());
    assert!(migrator.status().unwrap().is_up_to_date());
    assert!(migrator
        .history()
        .unwrap()
        .iter()
        .all(|r| r.exec_type == ExecType::Executed && r.checksum.is_some()));
}

#[test]
fn test_run_events_bracket_the_change_sets() {
    let db = TestDb::new();
    let (mut migrator, sink) = db.recorded(PEOPLE);
    migrator.update(Target::All).unwrap();

    let kinds = sink.kinds();
    let started = kinds
        .iter()
        .position(|k| matches!(k, MigrationEventKind::RunStarted { planned: 3, .. }))
        .unwrap();
    let finished = kinds
        .iter()
        .position(|k| matches!(k, MigrationEventKind::RunFinished { completed: 3, .. }))
        .unwrap();
    let applied = kinds
        .iter()
        .filter(|k| matches!(k, MigrationEventKind::ChangeSetApplied { .. }))
        .count();
    assert!(started < finished);
    assert_eq!(applied, 3);
}
