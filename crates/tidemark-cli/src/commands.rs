//! Subcommands and their dispatch to the migrator.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::Subcommand;
use tidemark_core::{Connection, MigrationError, Migrator, Target};

use crate::formatter::Formatter;

/// Forward run limits.
#[derive(clap::Args, Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateTarget {
    /// Stop after the change set declaring this tag
    #[arg(long, conflicts_with = "count")]
    pub to_tag: Option<String>,

    /// Apply only the next N pending change sets
    #[arg(long)]
    pub count: Option<usize>,
}

impl UpdateTarget {
    /// Engine target.
    pub fn target(&self) -> Target {
        match (&self.to_tag, self.count) {
            (Some(tag), _) => Target::UpToTag(tag.clone()),
            (None, Some(n)) => Target::Count(n),
            (None, None) => Target::All,
        }
    }
}

/// Rollback boundary; exactly one must be given.
#[derive(clap::Args, Debug, Clone, PartialEq, Eq, Default)]
#[group(required = true, multiple = false)]
pub struct RollbackTarget {
    /// Undo everything recorded after the record carrying this tag
    #[arg(long)]
    pub tag: Option<String>,

    /// Undo everything executed after this time (RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`, UTC)
    #[arg(long)]
    pub date: Option<String>,

    /// Undo the last N change sets
    #[arg(long)]
    pub count: Option<usize>,
}

impl RollbackTarget {
    /// Engine target.
    pub fn target(&self) -> Result<Target, MigrationError> {
        if let Some(tag) = &self.tag {
            return Ok(Target::DownToTag(tag.clone()));
        }
        if let Some(date) = &self.date {
            return parse_date(date).map(Target::UpToDate);
        }
        match self.count {
            Some(n) => Ok(Target::RollbackCount(n)),
            None => Err(MigrationError::Config(
                "rollback needs --tag, --date or --count".to_string(),
            )),
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List pending change sets
    Status,
    /// Check the changelog and its recorded history for problems
    Validate,
    /// Apply pending change sets
    Update(UpdateTarget),
    /// Print the SQL an update would run
    UpdateSql(UpdateTarget),
    /// Undo applied change sets
    Rollback(RollbackTarget),
    /// Print the SQL a rollback would run
    RollbackSql(RollbackTarget),
    /// Tag the current database state
    Tag {
        /// Tag name
        name: String,
    },
    /// Forget stored checksums; the next update stores fresh ones
    ClearChecksums,
    /// Release the migration lock
    ReleaseLocks {
        /// Release a lock held by another process
        #[arg(long)]
        force: bool,
    },
    /// Show who holds the migration lock
    ListLocks,
    /// Show recorded change sets
    History,
    /// Record pending change sets as applied without running them
    ChangelogSync(UpdateTarget),
}

impl Command {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Validate => "validate",
            Command::Update(_) => "update",
            Command::UpdateSql(_) => "update-sql",
            Command::Rollback(_) => "rollback",
            Command::RollbackSql(_) => "rollback-sql",
            Command::Tag { .. } => "tag",
            Command::ClearChecksums => "clear-checksums",
            Command::ReleaseLocks { .. } => "release-locks",
            Command::ListLocks => "list-locks",
            Command::History => "history",
            Command::ChangelogSync(_) => "changelog-sync",
        }
    }
}

/// Rendered result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Text to print.
    pub text: String,
    /// Whether the tool should exit with a failure status.
    pub failed: bool,
}

impl Output {
    fn ok(text: String) -> Self {
        Self { text, failed: false }
    }
}

/// Run one command.
pub fn execute<C: Connection>(
    migrator: &mut Migrator<C>,
    command: &Command,
    formatter: &dyn Formatter,
) -> Result<Output, MigrationError> {
    let output = match command {
        Command::Status => Output::ok(formatter.format_status(&migrator.status()?)),
        Command::Validate => {
            let report = migrator.validate()?;
            Output {
                text: formatter.format_validation(&report),
                failed: !report.is_valid(),
            }
        }
        Command::Update(target) => {
            Output::ok(formatter.format_execution(&migrator.update(target.target())?))
        }
        Command::UpdateSql(target) => {
            Output::ok(formatter.format_script(&migrator.update_sql(target.target())?))
        }
        Command::Rollback(target) => {
            Output::ok(formatter.format_execution(&migrator.rollback(target.target()?)?))
        }
        Command::RollbackSql(target) => {
            Output::ok(formatter.format_script(&migrator.rollback_sql(target.target()?)?))
        }
        Command::Tag { name } => Output::ok(formatter.format_tag(&migrator.tag(name)?)),
        Command::ClearChecksums => Output::ok(formatter.format_cleared(&migrator.clear_checksums()?)),
        Command::ReleaseLocks { force } => {
            Output::ok(formatter.format_released(&migrator.release_lock(*force)?))
        }
        Command::ListLocks => Output::ok(formatter.format_locks(&migrator.list_locks()?)),
        Command::History => Output::ok(formatter.format_history(&migrator.history()?)),
        Command::ChangelogSync(target) => {
            Output::ok(formatter.format_execution(&migrator.changelog_sync(target.target())?))
        }
    };
    Ok(output)
}

/// Parse a rollback date. Times without an offset are UTC.
pub fn parse_date(input: &str) -> Result<DateTime<Utc>, MigrationError> {
    let input = input.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(input) {
        return Ok(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| MigrationError::Config(format!("cannot parse date '{}'", input)))
}
