//! Plan execution.
//!
//! The executor runs a plan step by step. Each change set runs in its own
//! transaction together with the write of its tracking record, so a change
//! set is either fully applied and recorded or not at all. A failure stops
//! the run; everything committed before it stays committed and the error
//! carries the report so far.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::changelog::{ChangeSetId, FailAction};
use crate::connection::{Connection, DbError};
use crate::error::MigrationError;
use crate::events::{EventSink, MigrationEvent, MigrationEventKind};
use crate::planner::{Plan, PlanStep, RollbackAction, RollbackPlan, StepAction};
use crate::precondition::{self, ConditionContext};
use crate::sql;
use crate::tracking::{ExecType, ExecutionRecord, TrackingError, TrackingStore};

/// Cooperative cancellation, checked between change sets.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The change set in progress completes.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step ran.
    Completed,
    /// Stopped between change sets on request.
    Cancelled,
    /// Stopped by an error.
    Failed,
}

/// What happened to one change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Executed for the first time.
    Executed,
    /// Executed again.
    Reran,
    /// Recorded without execution.
    MarkRan,
    /// Failed and recorded as failed; the run continued.
    Failed,
    /// Left pending by a precondition.
    Skipped,
    /// Inverse changes ran and the record was removed.
    RolledBack,
    /// Only the record was removed.
    Forgotten,
}

impl From<ExecType> for EntryStatus {
    fn from(exec_type: ExecType) -> Self {
        match exec_type {
            ExecType::Executed => EntryStatus::Executed,
            ExecType::Reran => EntryStatus::Reran,
            ExecType::MarkRan => EntryStatus::MarkRan,
            ExecType::Failed => EntryStatus::Failed,
        }
    }
}

/// One line of an execution report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    /// Change set.
    pub id: ChangeSetId,
    /// Outcome.
    pub status: EntryStatus,
    /// Statements executed.
    pub statements: usize,
    /// Wall time.
    pub duration_ms: u64,
    /// Failure cause or skip reason.
    pub message: Option<String>,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    /// Operation name.
    pub operation: String,
    /// Identifier stamped on every record of the run.
    pub deployment_id: String,
    /// Start of the run.
    pub started_at: DateTime<Utc>,
    /// End of the run, unset while it is in progress.
    pub finished_at: Option<DateTime<Utc>>,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Per change set outcomes in execution order.
    pub entries: Vec<ReportEntry>,
    /// Precondition warnings.
    pub warnings: Vec<String>,
}

impl ExecutionReport {
    /// Start a report.
    pub fn new(operation: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            deployment_id: deployment_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Completed,
            entries: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Number of entries with a status.
    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// Identities with a status, in execution order.
    pub fn ids_with(&self, status: EntryStatus) -> Vec<ChangeSetId> {
        self.entries
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Entries that changed the schema or history.
    pub fn completed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status != EntryStatus::Skipped)
            .count()
    }

    fn push(&mut self, id: &ChangeSetId, status: EntryStatus, statements: usize, started: Instant) {
        self.entries.push(ReportEntry {
            id: id.clone(),
            status,
            statements,
            duration_ms: started.elapsed().as_millis() as u64,
            message: None,
        });
    }

    fn push_with_message(&mut self, id: &ChangeSetId, status: EntryStatus, started: Instant, message: String) {
        self.push(id, status, 0, started);
        if let Some(entry) = self.entries.last_mut() {
            entry.message = Some(message);
        }
    }

    fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }
}

/// A change set that stopped a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSetFailure {
    /// Failing change set.
    pub id: ChangeSetId,
    /// Error text.
    pub cause: String,
    /// What the run did before the failure.
    pub partial: ExecutionReport,
}

/// A rendered preview script.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SqlScript {
    text: String,
    statements: usize,
}

impl SqlScript {
    /// Create an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a comment, one `--` line per input line.
    pub fn comment(&mut self, text: &str) {
        for line in text.lines() {
            self.text.push_str("-- ");
            self.text.push_str(line);
            self.text.push('\n');
        }
    }

    /// Append a statement, terminated with `;`.
    pub fn statement(&mut self, sql: &str) {
        let sql = sql.trim();
        self.text.push_str(sql);
        if !sql.ends_with(';') {
            self.text.push(';');
        }
        self.text.push('\n');
        self.statements += 1;
    }

    /// Append an empty line.
    pub fn blank(&mut self) {
        self.text.push('\n');
    }

    /// Script text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of statements.
    pub fn statement_count(&self) -> usize {
        self.statements
    }
}

impl std::fmt::Display for SqlScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Generate a deployment id: the UTC time to the second plus three random
/// digits.
pub fn new_deployment_id() -> String {
    format!(
        "{}{:03}",
        Utc::now().format("%y%m%d%H%M%S"),
        rand::thread_rng().gen_range(0..1000)
    )
}

/// Runs plans against a connection.
pub struct Executor<'a> {
    tracking: &'a TrackingStore,
    events: &'a dyn EventSink,
    cancel: CancelToken,
    deployment_id: String,
}

impl<'a> Executor<'a> {
    /// Create an executor writing to `tracking` and reporting to `events`.
    pub fn new(tracking: &'a TrackingStore, events: &'a dyn EventSink) -> Self {
        Self {
            tracking,
            events,
            cancel: CancelToken::new(),
            deployment_id: new_deployment_id(),
        }
    }

    /// Use a cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Use a fixed deployment id.
    pub fn with_deployment_id(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = deployment_id.into();
        self
    }

    /// Deployment id of this executor's runs.
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Apply a forward plan.
    ///
    /// `history` is the history the plan was computed from; dynamic
    /// `changeSetExecuted` checks see it plus everything this run records.
    pub fn apply(
        &self,
        conn: &mut dyn Connection,
        plan: &Plan,
        history: &[ExecutionRecord],
    ) -> Result<ExecutionReport, MigrationError> {
        let mut report = ExecutionReport::new("update", &self.deployment_id);
        let dbms = conn.dbms().to_string();
        let mut executed: HashSet<ChangeSetId> = history
            .iter()
            .filter(|r| r.is_applied())
            .map(|r| r.id.clone())
            .collect();
        let mut sequence = match self.tracking.next_sequence(conn) {
            Ok(sequence) => sequence,
            Err(e) => return Err(persistence(report, e)),
        };

        for (index, step) in plan.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!(remaining = plan.steps.len() - index, "update cancelled");
                report.finish(RunOutcome::Cancelled);
                return Ok(report);
            }

            let change_set = &step.change_set;
            let id = &change_set.id;
            let started = Instant::now();
            self.emit(MigrationEventKind::ChangeSetStarted { id: id.clone() });
            for warning in &step.warnings {
                self.warn(&mut report, id, warning);
            }

            let in_tx = change_set.run_in_transaction;
            if in_tx {
                if let Err(e) = conn.begin() {
                    return Err(self.fail(report, id, e.to_string()));
                }
            }

            let mut action = step.action;
            if let Some(preconditions) = &change_set.preconditions {
                let outcome = {
                    let ctx = ConditionContext {
                        dbms: &dbms,
                        executed: &executed,
                        changelog_path: &id.path,
                    };
                    precondition::check_dynamic(preconditions, &ctx, conn)
                };
                match outcome.action() {
                    None => {}
                    Some(FailAction::Halt) => {
                        abort(conn, in_tx);
                        return Err(self.fail(report, id, outcome.message().to_string()));
                    }
                    Some(FailAction::Continue) => {
                        abort(conn, in_tx);
                        let reason = outcome.message().to_string();
                        self.emit(MigrationEventKind::ChangeSetSkipped {
                            id: id.clone(),
                            reason: reason.clone(),
                        });
                        report.push_with_message(id, EntryStatus::Skipped, started, reason);
                        continue;
                    }
                    Some(FailAction::MarkRan) => action = StepAction::MarkRan,
                    Some(FailAction::Warn) => self.warn(&mut report, id, outcome.message()),
                }
            }

            let statements = match action {
                StepAction::MarkRan => Vec::new(),
                StepAction::Execute | StepAction::Rerun => sql::render_all(&change_set.changes),
            };
            if let Err(e) = run_statements(conn, &statements) {
                abort(conn, in_tx);
                let cause = e.to_string();
                if change_set.fail_on_error {
                    return Err(self.fail(report, id, cause));
                }

                let mut record = self.record_for(step, ExecType::Failed, sequence);
                record.tag = None;
                let records = with_tag_marker(step, record);
                if let Err(e) = self.write_in_transaction(conn, &records) {
                    return Err(persistence(report, e));
                }
                sequence += 1;
                self.emit(MigrationEventKind::ChangeSetFailed {
                    id: id.clone(),
                    cause: cause.clone(),
                    continued: true,
                });
                report.push_with_message(id, EntryStatus::Failed, started, cause);
                continue;
            }

            let records = with_tag_marker(step, self.record_for(step, action.exec_type(), sequence));
            let written = if in_tx {
                record_and_commit(self.tracking, conn, &records)
            } else {
                self.write_in_transaction(conn, &records)
            };
            if let Err(e) = written {
                abort(conn, in_tx);
                return Err(persistence(report, e));
            }

            sequence += 1;
            executed.insert(id.clone());
            report.push(id, action.exec_type().into(), statements.len(), started);
            self.emit(MigrationEventKind::ChangeSetApplied {
                id: id.clone(),
                exec_type: action.exec_type(),
                statements: statements.len(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        report.finish(RunOutcome::Completed);
        Ok(report)
    }

    /// Apply a rollback plan, newest record first.
    pub fn rollback(
        &self,
        conn: &mut dyn Connection,
        plan: &RollbackPlan,
    ) -> Result<ExecutionReport, MigrationError> {
        let mut report = ExecutionReport::new("rollback", &self.deployment_id);

        for (index, step) in plan.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!(remaining = plan.steps.len() - index, "rollback cancelled");
                report.finish(RunOutcome::Cancelled);
                return Ok(report);
            }

            let id = &step.record.id;
            let started = Instant::now();
            match &step.action {
                RollbackAction::Undo(changes) => {
                    let statements = sql::render_all(changes);
                    let in_tx = step.run_in_transaction;
                    if in_tx {
                        if let Err(e) = conn.begin() {
                            return Err(self.fail(report, id, e.to_string()));
                        }
                    }
                    if let Err(e) = run_statements(conn, &statements) {
                        abort(conn, in_tx);
                        return Err(self.fail(report, id, e.to_string()));
                    }
                    let removed = if in_tx {
                        remove_and_commit(self.tracking, conn, id)
                    } else {
                        self.tracking.remove(conn, id).map(|_| ())
                    };
                    if let Err(e) = removed {
                        abort(conn, in_tx);
                        return Err(persistence(report, e));
                    }
                    report.push(id, EntryStatus::RolledBack, statements.len(), started);
                }
                RollbackAction::Forget => {
                    if let Err(e) = self.tracking.remove(conn, id) {
                        return Err(persistence(report, e));
                    }
                    report.push(id, EntryStatus::Forgotten, 0, started);
                }
            }
            self.emit(MigrationEventKind::ChangeSetRolledBack {
                id: id.clone(),
                record_only: step.action == RollbackAction::Forget,
            });
        }

        report.finish(RunOutcome::Completed);
        Ok(report)
    }

    /// Record every step of a plan without executing it.
    pub fn sync(&self, conn: &mut dyn Connection, plan: &Plan) -> Result<ExecutionReport, MigrationError> {
        let mut report = ExecutionReport::new("changelog-sync", &self.deployment_id);
        let mut sequence = match self.tracking.next_sequence(conn) {
            Ok(sequence) => sequence,
            Err(e) => return Err(persistence(report, e)),
        };

        for step in &plan.steps {
            let started = Instant::now();
            let exec_type = step.action.exec_type();
            let records = with_tag_marker(step, self.record_for(step, exec_type, sequence));
            if let Err(e) = self.write_in_transaction(conn, &records) {
                return Err(persistence(report, e));
            }
            sequence += 1;
            report.push(&step.change_set.id, exec_type.into(), 0, started);
        }

        report.finish(RunOutcome::Completed);
        Ok(report)
    }

    /// Render a forward plan as a script. Nothing is executed.
    pub fn preview(&self, plan: &Plan, next_sequence: i64, title: &str) -> SqlScript {
        let mut script = self.script_header(title);
        let mut sequence = next_sequence;

        for step in &plan.steps {
            let change_set = &step.change_set;
            script.blank();
            script.comment(&format!("change set {} ({})", change_set.id, step.action.exec_type()));
            if let Some(preconditions) = &change_set.preconditions {
                let dynamic: Vec<String> = preconditions.dynamic_conditions().map(|c| c.describe()).collect();
                if !dynamic.is_empty() {
                    script.comment(&format!("checked when run: {}", dynamic.join(", ")));
                }
            }
            for warning in &step.warnings {
                script.comment(&format!("warning: {}", warning));
            }
            if !change_set.run_in_transaction {
                script.comment("runs outside a transaction");
            }
            if step.action != StepAction::MarkRan {
                for statement in sql::render_all(&change_set.changes) {
                    script.statement(&statement);
                }
            }
            if step.action == StepAction::Rerun {
                script.statement(&self.tracking.render_delete(&change_set.id));
            }
            let record = self.record_for(step, step.action.exec_type(), sequence);
            for record in with_tag_marker(step, record) {
                script.statement(&self.tracking.render_insert(&record));
            }
            sequence += 1;
        }

        for skipped in &plan.skipped {
            script.blank();
            script.comment(&format!("skipped {}: {}", skipped.id, skipped.reason));
        }
        script
    }

    /// Render a rollback plan as a script. Nothing is executed.
    pub fn preview_rollback(&self, plan: &RollbackPlan, title: &str) -> SqlScript {
        let mut script = self.script_header(title);
        for step in &plan.steps {
            script.blank();
            script.comment(&format!("roll back {}", step.record.id));
            if !step.run_in_transaction {
                script.comment("runs outside a transaction");
            }
            if let RollbackAction::Undo(changes) = &step.action {
                for statement in sql::render_all(changes) {
                    script.statement(&statement);
                }
            }
            script.statement(&self.tracking.render_delete(&step.record.id));
        }
        script
    }

    fn script_header(&self, title: &str) -> SqlScript {
        let mut script = SqlScript::new();
        script.comment(title);
        script.comment(&format!("deployment: {}", self.deployment_id));
        script.comment(&format!("generated: {}", Utc::now().to_rfc3339()));
        script
    }

    fn record_for(&self, step: &PlanStep, exec_type: ExecType, sequence: i64) -> ExecutionRecord {
        ExecutionRecord::for_change_set(
            &step.change_set,
            exec_type,
            Some(step.checksum.to_string()),
            sequence,
            Some(self.deployment_id.clone()),
        )
    }

    fn write_in_transaction(
        &self,
        conn: &mut dyn Connection,
        records: &[ExecutionRecord],
    ) -> Result<(), TrackingError> {
        conn.begin()?;
        if let Err(e) = record_and_commit(self.tracking, conn, records) {
            abort(conn, true);
            return Err(e);
        }
        Ok(())
    }

    fn warn(&self, report: &mut ExecutionReport, id: &ChangeSetId, message: &str) {
        report.warnings.push(format!("{}: {}", id, message));
        self.emit(MigrationEventKind::PreconditionWarning {
            id: id.clone(),
            message: message.to_string(),
        });
    }

    fn fail(&self, mut report: ExecutionReport, id: &ChangeSetId, cause: String) -> MigrationError {
        self.emit(MigrationEventKind::ChangeSetFailed {
            id: id.clone(),
            cause: cause.clone(),
            continued: false,
        });
        report.finish(RunOutcome::Failed);
        MigrationError::ChangeSetFailure(Box::new(ChangeSetFailure {
            id: id.clone(),
            cause,
            partial: report,
        }))
    }

    fn emit(&self, kind: MigrationEventKind) {
        self.events.emit(&MigrationEvent::new(kind));
    }
}

fn persistence(mut report: ExecutionReport, source: TrackingError) -> MigrationError {
    report.finish(RunOutcome::Failed);
    MigrationError::Persistence {
        source,
        partial: Some(Box::new(report)),
    }
}

fn run_statements(conn: &mut dyn Connection, statements: &[String]) -> Result<(), DbError> {
    for statement in statements {
        tracing::trace!(sql = %statement, "executing");
        conn.execute(statement, &[])?;
    }
    Ok(())
}

/// The record for a step, followed by a marker that leaves a tag the rerun
/// row no longer carries at its old position in history.
fn with_tag_marker(step: &PlanStep, record: ExecutionRecord) -> Vec<ExecutionRecord> {
    let marker = step
        .existing_tag
        .as_ref()
        .filter(|existing| record.tag.as_deref() != Some(existing.tag.as_str()))
        .map(|existing| ExecutionRecord::tag_marker(&existing.tag, existing.order_executed));
    std::iter::once(record).chain(marker).collect()
}

fn record_and_commit(
    tracking: &TrackingStore,
    conn: &mut dyn Connection,
    records: &[ExecutionRecord],
) -> Result<(), TrackingError> {
    for record in records {
        tracking.record(conn, record)?;
    }
    conn.commit()?;
    Ok(())
}

fn remove_and_commit(
    tracking: &TrackingStore,
    conn: &mut dyn Connection,
    id: &ChangeSetId,
) -> Result<(), TrackingError> {
    tracking.remove(conn, id)?;
    conn.commit()?;
    Ok(())
}

fn abort(conn: &mut dyn Connection, in_transaction: bool) {
    if !in_transaction {
        return;
    }
    if let Err(e) = conn.rollback() {
        tracing::warn!(error = %e, "transaction rollback failed");
    }
}
