//! Migration error taxonomy.
//!
//! Every operation of [`crate::Migrator`] fails with a [`MigrationError`].
//! Lower layers keep their own error types and are folded in here.

use std::time::Duration;

use thiserror::Error;

use crate::changelog::{ChangeSetId, ParseError};
use crate::connection::{DbError, DbErrorKind};
use crate::executor::{ChangeSetFailure, ExecutionReport};
use crate::lock::LockError;
use crate::planner::PlanError;
use crate::report::{Problem, ProblemKind};
use crate::tracking::TrackingError;

/// Migration errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The changelog cannot be read.
    #[error("changelog: {0}")]
    Parse(#[from] ParseError),

    /// Validation found problems; nothing was executed.
    #[error("validation failed with {} problem(s): {}", .problems.len(), summarize(.problems))]
    Validation {
        /// Every problem found.
        problems: Vec<Problem>,
    },

    /// The run lock could not be acquired in time.
    #[error("could not acquire lock within {waited:?} (held by {})", .holder.as_deref().unwrap_or("unknown"))]
    LockTimeout {
        /// Holder at the last attempt.
        holder: Option<String>,
        /// Time spent waiting.
        waited: Duration,
    },

    /// Release attempted by someone other than the holder.
    #[error("lock is held by {holder}, not {requested_by}")]
    NotHolder {
        /// Actual holder.
        holder: String,
        /// Caller.
        requested_by: String,
    },

    /// A change set failed; earlier change sets stay committed.
    #[error("change set {} failed: {}", .0.id, .0.cause)]
    ChangeSetFailure(Box<ChangeSetFailure>),

    /// The tracking store rejected a read or write.
    #[error("persistence: {source}")]
    Persistence {
        /// Underlying error.
        source: TrackingError,
        /// Report up to the failure when it happened mid-run.
        partial: Option<Box<ExecutionReport>>,
    },

    /// The tag is unknown.
    #[error("unknown tag '{0}'")]
    UnknownTag(String),

    /// A change set to roll back has no rollback.
    #[error("no rollback defined for change set {0}")]
    NoRollbackDefined(ChangeSetId),

    /// A tag with this name already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A recorded change set is missing from the changelog.
    #[error("change set {0} is recorded but missing from the changelog")]
    UnknownChangeSet(ChangeSetId),

    /// The configuration is invalid.
    #[error("configuration: {0}")]
    Config(String),

    /// The database failed outside of a change set.
    #[error("database: {0}")]
    Database(#[from] DbError),
}

impl MigrationError {
    /// Report of the work done before the failure, when there is one.
    pub fn partial_report(&self) -> Option<&ExecutionReport> {
        match self {
            MigrationError::ChangeSetFailure(failure) => Some(&failure.partial),
            MigrationError::Persistence { partial, .. } => partial.as_deref(),
            _ => None,
        }
    }

    /// Validation problems, empty for other errors.
    pub fn problems(&self) -> &[Problem] {
        match self {
            MigrationError::Validation { problems } => problems,
            _ => &[],
        }
    }
}

fn summarize(problems: &[Problem]) -> String {
    match problems {
        [] => String::new(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

impl From<LockError> for MigrationError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { holder, waited } => MigrationError::LockTimeout { holder, waited },
            LockError::NotHolder {
                holder,
                requested_by,
            } => MigrationError::NotHolder {
                holder,
                requested_by,
            },
            LockError::Database(e) => MigrationError::Database(e),
            LockError::Corrupt(message) => {
                MigrationError::Database(DbError::new(DbErrorKind::Other, message))
            }
        }
    }
}

impl From<TrackingError> for MigrationError {
    fn from(err: TrackingError) -> Self {
        match err {
            TrackingError::TagExists(tag) => {
                MigrationError::Conflict(format!("tag '{}' already exists", tag))
            }
            source => MigrationError::Persistence {
                source,
                partial: None,
            },
        }
    }
}

impl From<PlanError> for MigrationError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::UnknownTag(tag) => MigrationError::UnknownTag(tag),
            PlanError::NoRollbackDefined(id) => MigrationError::NoRollbackDefined(id),
            PlanError::UnknownChangeSet(id) => MigrationError::UnknownChangeSet(id),
            PlanError::PreconditionHalt { id, message } => MigrationError::Validation {
                problems: vec![Problem::new(ProblemKind::PreconditionHalt, Some(id), message)],
            },
            PlanError::InvalidTarget(target) => {
                MigrationError::Config(format!("target '{}' does not fit this operation", target))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_errors_map() {
        let err: MigrationError = LockError::Timeout {
            holder: Some("host:1".into()),
            waited: Duration::from_secs(2),
        }
        .into();
        assert!(matches!(err, MigrationError::LockTimeout { .. }));
        assert!(err.to_string().contains("host:1"));
    }

    #[test]
    fn test_tag_exists_is_conflict() {
        let err: MigrationError = TrackingError::TagExists("v1".into()).into();
        assert!(matches!(err, MigrationError::Conflict(_)));

        let err: MigrationError = TrackingError::Corrupt("bad".into()).into();
        assert!(matches!(err, MigrationError::Persistence { partial: None, .. }));
        assert!(err.partial_report().is_none());
    }

    #[test]
    fn test_precondition_halt_is_validation() {
        let id = ChangeSetId::new("1", "alice", "db.json");
        let err: MigrationError = PlanError::PreconditionHalt {
            id: id.clone(),
            message: "dbms mismatch".into(),
        }
        .into();
        assert_eq!(err.problems().len(), 1);
        assert_eq!(err.problems()[0].change_set, Some(id));
        assert!(err.to_string().contains("1 problem(s)"));
    }
}
