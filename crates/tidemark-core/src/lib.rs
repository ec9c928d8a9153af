//! Tidemark Core - changelog-driven schema migrations.
//!
//! Tidemark keeps a database schema in step with a changelog: an ordered
//! list of uniquely identified change sets. Applied change sets are recorded
//! in a tracking table inside the target database, so every run computes
//! exactly the pending delta and applies it, one transaction per change set.
//!
//! # Components
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`changelog`] | Model, JSON and formatted SQL documents, include flattening |
//! | [`checksum`] | Content digests for drift detection |
//! | [`connection`] | Database abstraction and the SQLite adapter |
//! | [`tracking`] | The tracking table |
//! | [`lock`] | The cross-process run lock |
//! | [`planner`] | Pending and rollback plans |
//! | [`executor`] | Transactional execution and SQL previews |
//! | [`report`] | Status and validation |
//! | [`migrator`] | The facade exposing every operation |
//!
//! # Example
//!
//! ```ignore
//! use tidemark_core::{FileSystemSource, Migrator, SqliteConnection, Target};
//!
//! let conn = SqliteConnection::open("app.db")?;
//! let mut migrator = Migrator::new(conn, FileSystemSource::new("db"), "changelog.json");
//!
//! let status = migrator.status()?;
//! println!("{} change sets pending", status.pending_count);
//!
//! let report = migrator.update(Target::All)?;
//! migrator.tag("release-1")?;
//! ```

pub mod changelog;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod executor;
pub mod lock;
pub mod migrator;
pub mod planner;
pub mod precondition;
pub mod report;
pub mod sql;
pub mod tracking;

pub use changelog::{
    Change, ChangeSet, ChangeSetId, Changelog, ChangelogParser, ChangelogSource, ColumnDef,
    ContextExpr, ContextFilter, FailAction, FileSystemSource, MemorySource, ParseError,
    Precondition, Preconditions,
};
pub use checksum::Checksum;
pub use config::MigrationConfig;
pub use connection::{Connection, DbError, DbErrorKind, Value};
pub use error::MigrationError;
pub use events::{EventSink, MemoryEventSink, MigrationEvent, MigrationEventKind, NullEventSink, TracingEventSink};
pub use executor::{CancelToken, ChangeSetFailure, EntryStatus, ExecutionReport, RunOutcome, SqlScript};
pub use lock::{LockError, LockInfo, LockManager};
pub use migrator::{ClearChecksumsReport, LockReport, Migrator, ReleaseReport};
pub use planner::{Plan, Planner, RollbackPlan, TagPosition, Target};
pub use report::{Problem, ProblemKind, StatusReport, ValidationReport};
pub use tracking::{ExecType, ExecutionRecord, TagOutcome, TrackingError, TrackingStore};

#[cfg(feature = "sqlite")]
pub use connection::SqliteConnection;
