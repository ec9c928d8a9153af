//! Run events.
//!
//! Everything a run does of interest is emitted as a [`MigrationEvent`]
//! through an [`EventSink`]. The default sink forwards to `tracing`; tests
//! use [`MemoryEventSink`] to assert on what happened.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::changelog::ChangeSetId;
use crate::executor::RunOutcome;
use crate::tracking::ExecType;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEventKind {
    /// An operation started.
    RunStarted {
        /// Operation name.
        operation: String,
        /// Run identifier.
        deployment_id: String,
        /// Steps planned.
        planned: usize,
    },
    /// An operation finished.
    RunFinished {
        /// Operation name.
        operation: String,
        /// Run identifier.
        deployment_id: String,
        /// Steps completed.
        completed: usize,
        /// Final outcome.
        outcome: RunOutcome,
    },
    /// The run lock was acquired.
    LockAcquired {
        /// Holder identity.
        holder: String,
    },
    /// The run lock was released.
    LockReleased {
        /// Holder identity.
        holder: String,
    },
    /// A change set is about to run.
    ChangeSetStarted {
        /// Identity.
        id: ChangeSetId,
    },
    /// A change set was recorded.
    ChangeSetApplied {
        /// Identity.
        id: ChangeSetId,
        /// Stored outcome.
        exec_type: ExecType,
        /// Statements executed.
        statements: usize,
        /// Wall time.
        duration_ms: u64,
    },
    /// A change set failed.
    ChangeSetFailed {
        /// Identity.
        id: ChangeSetId,
        /// Error text.
        cause: String,
        /// Whether the run continues (`failOnError = false`).
        continued: bool,
    },
    /// A change set was left pending for this run.
    ChangeSetSkipped {
        /// Identity.
        id: ChangeSetId,
        /// Why.
        reason: String,
    },
    /// A change set was undone.
    ChangeSetRolledBack {
        /// Identity.
        id: ChangeSetId,
        /// Only the record was removed.
        record_only: bool,
    },
    /// A precondition failed with `WARN`.
    PreconditionWarning {
        /// Identity.
        id: ChangeSetId,
        /// Explanation.
        message: String,
    },
    /// A tag was attached.
    Tagged {
        /// Tag name.
        tag: String,
    },
    /// Stored checksums were cleared.
    ChecksumsCleared {
        /// Rows updated.
        count: u64,
    },
}

/// An event with its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationEvent {
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub kind: MigrationEventKind,
}

impl MigrationEvent {
    /// Stamp an event with the current time.
    pub fn new(kind: MigrationEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Format the event as a log line.
    pub fn to_log_line(&self) -> String {
        let desc = match &self.kind {
            MigrationEventKind::RunStarted {
                operation,
                deployment_id,
                planned,
            } => format!(
                "RUN_START op={} deployment={} planned={}",
                operation, deployment_id, planned
            ),
            MigrationEventKind::RunFinished {
                operation,
                deployment_id,
                completed,
                outcome,
            } => format!(
                "RUN_END op={} deployment={} completed={} outcome={:?}",
                operation, deployment_id, completed, outcome
            ),
            MigrationEventKind::LockAcquired { holder } => format!("LOCK_ACQUIRED holder={}", holder),
            MigrationEventKind::LockReleased { holder } => format!("LOCK_RELEASED holder={}", holder),
            MigrationEventKind::ChangeSetStarted { id } => format!("CHANGESET_START id={}", id),
            MigrationEventKind::ChangeSetApplied {
                id,
                exec_type,
                statements,
                duration_ms,
            } => format!(
                "CHANGESET_APPLIED id={} exec_type={} statements={} duration_ms={}",
                id, exec_type, statements, duration_ms
            ),
            MigrationEventKind::ChangeSetFailed {
                id,
                cause,
                continued,
            } => format!(
                "CHANGESET_FAILED id={} continued={} cause={}",
                id, continued, cause
            ),
            MigrationEventKind::ChangeSetSkipped { id, reason } => {
                format!("CHANGESET_SKIPPED id={} reason={}", id, reason)
            }
            MigrationEventKind::ChangeSetRolledBack { id, record_only } => {
                format!("CHANGESET_ROLLED_BACK id={} record_only={}", id, record_only)
            }
            MigrationEventKind::PreconditionWarning { id, message } => {
                format!("PRECONDITION_WARN id={} message={}", id, message)
            }
            MigrationEventKind::Tagged { tag } => format!("TAGGED tag={}", tag),
            MigrationEventKind::ChecksumsCleared { count } => {
                format!("CHECKSUMS_CLEARED count={}", count)
            }
        };
        format!("{} {}", self.timestamp.to_rfc3339(), desc)
    }
}

/// Receiver of run events.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn emit(&self, event: &MigrationEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &MigrationEvent) {
        match &event.kind {
            MigrationEventKind::ChangeSetFailed { id, cause, continued } => {
                tracing::error!(change_set = %id, continued, cause = %cause, "change set failed")
            }
            MigrationEventKind::PreconditionWarning { id, message } => {
                tracing::warn!(change_set = %id, message = %message, "precondition warning")
            }
            MigrationEventKind::ChangeSetApplied {
                id,
                exec_type,
                duration_ms,
                ..
            } => tracing::info!(
                change_set = %id,
                exec_type = %exec_type,
                duration_ms,
                "change set applied"
            ),
            MigrationEventKind::ChangeSetStarted { id } => {
                tracing::debug!(change_set = %id, "running change set")
            }
            _ => tracing::info!(event = %event.to_log_line(), "migration event"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<MigrationEvent>>>,
}

impl MemoryEventSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far.
    pub fn events(&self) -> Vec<MigrationEvent> {
        self.events.lock().clone()
    }

    /// Event kinds so far.
    pub fn kinds(&self) -> Vec<MigrationEventKind> {
        self.events.lock().iter().map(|e| e.kind.clone()).collect()
    }

    /// Clear all events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Event count.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &MigrationEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &MigrationEvent) {}
}
