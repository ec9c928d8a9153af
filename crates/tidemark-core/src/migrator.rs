//! The migration facade.
//!
//! [`Migrator`] ties the pieces together: it reads the changelog, takes the
//! run lock, bootstraps the tracking table, validates, plans and executes.
//! Read-only operations (`status`, `validate`, the SQL previews, `history`
//! and `list_locks`) take no lock and never create tables.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::changelog::{ChangelogParser, ChangelogSource, Changelog};
use crate::checksum::Checksum;
use crate::config::MigrationConfig;
use crate::connection::Connection;
use crate::error::MigrationError;
use crate::events::{EventSink, MigrationEvent, MigrationEventKind, TracingEventSink};
use crate::executor::{CancelToken, ExecutionReport, Executor, RunOutcome, SqlScript};
use crate::lock::{LockInfo, LockManager};
use crate::planner::{Planner, Target};
use crate::report::{self, StatusReport, ValidationReport};
use crate::tracking::{ExecutionRecord, TagOutcome, TrackingStore};

/// Result of clearing checksums.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClearChecksumsReport {
    /// Records whose checksum was cleared.
    pub cleared: u64,
}

/// Result of releasing the run lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseReport {
    /// Whether a lock was removed.
    pub released: bool,
    /// The holder before the release.
    pub previous: Option<LockInfo>,
}

/// A held lock as shown by [`Migrator::list_locks`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockReport {
    /// Holder identity.
    pub holder: String,
    /// When the lock was granted.
    pub granted_at: DateTime<Utc>,
    /// How long it has been held, in seconds.
    pub held_for_secs: u64,
    /// Held longer than the configured stale threshold.
    pub stale: bool,
}

/// Borrowed state a locked operation works with.
struct Run<'m> {
    config: &'m MigrationConfig,
    tracking: &'m TrackingStore,
    events: &'m dyn EventSink,
    cancel: &'m CancelToken,
}

impl Run<'_> {
    fn executor(&self) -> Executor<'_> {
        Executor::new(self.tracking, self.events).with_cancel_token(self.cancel.clone())
    }

    fn emit(&self, kind: MigrationEventKind) {
        self.events.emit(&MigrationEvent::new(kind));
    }

    fn started(&self, operation: &str, deployment_id: &str, planned: usize) {
        tracing::info!(operation, deployment_id, planned, "run started");
        self.emit(MigrationEventKind::RunStarted {
            operation: operation.to_string(),
            deployment_id: deployment_id.to_string(),
            planned,
        });
    }

    fn finished(&self, operation: &str, deployment_id: &str, result: &Result<ExecutionReport, MigrationError>) {
        let (completed, outcome) = match result {
            Ok(report) => (report.completed(), report.outcome),
            Err(err) => (
                err.partial_report().map(ExecutionReport::completed).unwrap_or(0),
                RunOutcome::Failed,
            ),
        };
        tracing::info!(operation, deployment_id, completed, outcome = ?outcome, "run finished");
        self.emit(MigrationEventKind::RunFinished {
            operation: operation.to_string(),
            deployment_id: deployment_id.to_string(),
            completed,
            outcome,
        });
    }
}

/// Runs migrations of one changelog against one database.
pub struct Migrator<C: Connection> {
    conn: C,
    source: Box<dyn ChangelogSource>,
    changelog_path: String,
    config: MigrationConfig,
    tracking: TrackingStore,
    locks: LockManager,
    events: Arc<dyn EventSink>,
    cancel: CancelToken,
}

impl<C: Connection> Migrator<C> {
    /// Create a migrator with the default configuration.
    pub fn new(
        conn: C,
        source: impl ChangelogSource + 'static,
        changelog_path: impl Into<String>,
    ) -> Self {
        let config = MigrationConfig::default();
        Self {
            conn,
            source: Box::new(source),
            changelog_path: crate::changelog::paths::normalize(&changelog_path.into()),
            tracking: TrackingStore::new(&config.changelog_table),
            locks: LockManager::new(&config.lock_table).with_backoff(config.backoff),
            config,
            events: Arc::new(TracingEventSink),
            cancel: CancelToken::new(),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.tracking = TrackingStore::new(&config.changelog_table);
        self.locks = LockManager::new(&config.lock_table).with_backoff(config.backoff);
        self.config = config;
        self
    }

    /// Send events to `events` instead of `tracing`.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Token that cancels the running operation between change sets.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The underlying connection.
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Give the connection back.
    pub fn into_connection(self) -> C {
        self.conn
    }

    /// Read and flatten the changelog, stopping at the first problem.
    pub fn load_changelog(&self) -> Result<Changelog, MigrationError> {
        Ok(ChangelogParser::new(self.source.as_ref()).parse(&self.changelog_path)?)
    }

    /// Pending change sets.
    pub fn status(&mut self) -> Result<StatusReport, MigrationError> {
        let changelog = self.load_changelog()?;
        let history = self.tracking.history_if_present(&mut self.conn)?;
        Ok(report::status(&changelog, &history, &self.config.filter()))
    }

    /// Every problem with the changelog and its history.
    pub fn validate(&mut self) -> Result<ValidationReport, MigrationError> {
        let outcome = ChangelogParser::new(self.source.as_ref()).parse_collecting(&self.changelog_path);
        let history = self.tracking.history_if_present(&mut self.conn)?;
        let report = report::validate(&outcome.changelog, outcome.problems, &history);
        tracing::info!(
            change_sets = report.change_sets,
            problems = report.problems.len(),
            "validated changelog"
        );
        Ok(report)
    }

    /// Apply pending change sets up to `target`.
    pub fn update(&mut self, target: Target) -> Result<ExecutionReport, MigrationError> {
        let changelog = self.load_changelog()?;
        let filter = self.config.filter();
        self.locked(|conn, run| {
            run.tracking.ensure(conn)?;
            let mut history = run.tracking.history(conn)?;
            ensure_valid(&changelog, &history)?;
            refresh_checksums(conn, run.tracking, &changelog, &mut history)?;

            let dbms = conn.dbms().to_string();
            let plan = Planner::new(&filter, &dbms).plan(&changelog, &history, &target)?;
            for skipped in &plan.skipped {
                run.emit(MigrationEventKind::ChangeSetSkipped {
                    id: skipped.id.clone(),
                    reason: skipped.reason.to_string(),
                });
            }

            let executor = run.executor();
            run.started("update", executor.deployment_id(), plan.len());
            let result = executor.apply(conn, &plan, &history);
            run.finished("update", executor.deployment_id(), &result);
            result
        })
    }

    /// Render what [`Migrator::update`] would run, without running it.
    pub fn update_sql(&mut self, target: Target) -> Result<SqlScript, MigrationError> {
        let changelog = self.load_changelog()?;
        let tracked = self.tracking.exists(&mut self.conn)?;
        let history = self.tracking.history_if_present(&mut self.conn)?;
        ensure_valid(&changelog, &history)?;

        let filter = self.config.filter();
        let dbms = self.conn.dbms().to_string();
        let plan = Planner::new(&filter, &dbms).plan(&changelog, &history, &target)?;

        let next = history.iter().map(|r| r.order_executed).max().unwrap_or(0) + 1;
        let mut title = format!("update {} ({})", self.changelog_path, target);
        if !tracked {
            title.push_str(&format!(
                "\ntracking table {} is created by the first update",
                self.tracking.table()
            ));
        }
        Ok(Executor::new(&self.tracking, self.events.as_ref()).preview(&plan, next, &title))
    }

    /// Undo recorded change sets back to `target`.
    pub fn rollback(&mut self, target: Target) -> Result<ExecutionReport, MigrationError> {
        let changelog = self.load_changelog()?;
        let filter = self.config.filter();
        self.locked(|conn, run| {
            run.tracking.ensure(conn)?;
            let history = run.tracking.history(conn)?;
            ensure_valid(&changelog, &history)?;

            let dbms = conn.dbms().to_string();
            let plan = Planner::new(&filter, &dbms).plan_rollback(&changelog, &history, &target)?;

            let executor = run.executor();
            run.started("rollback", executor.deployment_id(), plan.len());
            let result = executor.rollback(conn, &plan);
            run.finished("rollback", executor.deployment_id(), &result);
            result
        })
    }

    /// Render what [`Migrator::rollback`] would run, without running it.
    pub fn rollback_sql(&mut self, target: Target) -> Result<SqlScript, MigrationError> {
        let changelog = self.load_changelog()?;
        let history = self.tracking.history_if_present(&mut self.conn)?;
        ensure_valid(&changelog, &history)?;

        let filter = self.config.filter();
        let dbms = self.conn.dbms().to_string();
        let plan = Planner::new(&filter, &dbms).plan_rollback(&changelog, &history, &target)?;
        let title = format!("rollback {} ({})", self.changelog_path, target);
        Ok(Executor::new(&self.tracking, self.events.as_ref()).preview_rollback(&plan, &title))
    }

    /// Tag the current state of the database.
    pub fn tag(&mut self, name: &str) -> Result<TagOutcome, MigrationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MigrationError::Config("tag name must not be empty".to_string()));
        }
        self.locked(|conn, run| {
            run.tracking.ensure(conn)?;
            let outcome = run.tracking.tag(conn, name)?;
            run.emit(MigrationEventKind::Tagged {
                tag: outcome.tag.clone(),
            });
            Ok(outcome)
        })
    }

    /// Forget every stored checksum. The next update stores fresh ones.
    pub fn clear_checksums(&mut self) -> Result<ClearChecksumsReport, MigrationError> {
        self.locked(|conn, run| {
            run.tracking.ensure(conn)?;
            let cleared = run.tracking.clear_checksums(conn)?;
            run.emit(MigrationEventKind::ChecksumsCleared { count: cleared });
            Ok(ClearChecksumsReport { cleared })
        })
    }

    /// Release the run lock.
    ///
    /// Without `force` only this migrator's own lock is released and a lock
    /// held by someone else is an error. With `force` any holder's lock is
    /// removed.
    pub fn release_lock(&mut self, force: bool) -> Result<ReleaseReport, MigrationError> {
        if force {
            let previous = self.locks.force_release(&mut self.conn)?;
            return Ok(ReleaseReport {
                released: previous.is_some(),
                previous,
            });
        }

        let previous = self.locks.current(&mut self.conn)?;
        if previous.is_some() {
            self.locks.release(&mut self.conn, &self.config.holder)?;
        }
        Ok(ReleaseReport {
            released: previous.is_some(),
            previous,
        })
    }

    /// Record pending change sets as executed without running them.
    pub fn changelog_sync(&mut self, target: Target) -> Result<ExecutionReport, MigrationError> {
        let changelog = self.load_changelog()?;
        let filter = self.config.filter();
        self.locked(|conn, run| {
            run.tracking.ensure(conn)?;
            let history = run.tracking.history(conn)?;
            ensure_valid(&changelog, &history)?;

            let dbms = conn.dbms().to_string();
            let plan = Planner::new(&filter, &dbms)
                .without_preconditions()
                .plan(&changelog, &history, &target)?;

            let executor = run.executor();
            run.started("changelog-sync", executor.deployment_id(), plan.len());
            let result = executor.sync(conn, &plan);
            run.finished("changelog-sync", executor.deployment_id(), &result);
            result
        })
    }

    /// Recorded history in execution order.
    pub fn history(&mut self) -> Result<Vec<ExecutionRecord>, MigrationError> {
        Ok(self.tracking.history_if_present(&mut self.conn)?)
    }

    /// The current lock holder, if any.
    pub fn list_locks(&mut self) -> Result<Vec<LockReport>, MigrationError> {
        let current = self.locks.current(&mut self.conn)?;
        Ok(current
            .into_iter()
            .map(|info| LockReport {
                held_for_secs: info.age().as_secs(),
                stale: info.is_stale(self.config.stale_lock_after),
                holder: info.holder,
                granted_at: info.granted_at,
            })
            .collect())
    }

    /// Run `f` while holding the run lock. The lock is released on every
    /// path; a release failure is reported only when `f` succeeded.
    fn locked<T>(
        &mut self,
        f: impl FnOnce(&mut dyn Connection, &Run<'_>) -> Result<T, MigrationError>,
    ) -> Result<T, MigrationError> {
        self.config.validate()?;
        self.locks.ensure(&mut self.conn)?;

        let run = Run {
            config: &self.config,
            tracking: &self.tracking,
            events: self.events.as_ref(),
            cancel: &self.cancel,
        };
        let holder = run.config.holder.clone();
        let mut guard = self
            .locks
            .acquire_guard(&mut self.conn, &holder, run.config.lock_timeout)?;
        run.emit(MigrationEventKind::LockAcquired {
            holder: holder.clone(),
        });

        let result = f(&mut *guard, &run);
        let released = guard.release();
        run.emit(MigrationEventKind::LockReleased { holder });

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Err(release_err)) => {
                tracing::warn!(error = %release_err, "lock release failed after error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }
}

/// Reject runs over edited change sets.
fn ensure_valid(changelog: &Changelog, history: &[ExecutionRecord]) -> Result<(), MigrationError> {
    let problems = report::checksum_problems(changelog, history);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(MigrationError::Validation { problems })
    }
}

/// Store current checksums for applied records whose checksum was cleared.
fn refresh_checksums(
    conn: &mut dyn Connection,
    tracking: &TrackingStore,
    changelog: &Changelog,
    history: &mut [ExecutionRecord],
) -> Result<(), MigrationError> {
    let mut refreshed = 0;
    for record in history.iter_mut() {
        if record.checksum.is_some() || !record.is_applied() || record.is_internal() {
            continue;
        }
        let Some(change_set) = changelog.find(&record.id) else {
            continue;
        };
        let checksum = Checksum::of(change_set).to_string();
        tracking.update_checksum(conn, &record.id, &checksum)?;
        record.checksum = Some(checksum);
        refreshed += 1;
    }
    if refreshed > 0 {
        tracing::info!(refreshed, "stored checksums for cleared records");
    }
    Ok(())
}
