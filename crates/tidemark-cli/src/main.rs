//! Tidemark Command-Line Tool
//!
//! Applies, previews and rolls back changelog-driven schema migrations
//! against a SQLite database.

mod commands;
mod config;
mod formatter;

use std::path::PathBuf;

use clap::Parser;
use commands::Command;
use config::{CliError, Overrides, Settings};
use formatter::{create_formatter, OutputFormat};

/// Tidemark Command-Line Tool
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(version, about = "Changelog-driven database migrations")]
pub struct Args {
    /// Properties file with default settings
    #[arg(long, global = true)]
    pub defaults_file: Option<PathBuf>,

    /// Database url (sqlite:path or sqlite::memory:)
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Root changelog file
    #[arg(long, global = true)]
    pub changelog: Option<PathBuf>,

    /// Comma-separated runtime contexts
    #[arg(long, global = true)]
    pub contexts: Option<String>,

    /// Label expression, e.g. "api and !legacy"
    #[arg(long, global = true)]
    pub labels: Option<String>,

    /// Seconds to wait for the migration lock
    #[arg(long, global = true)]
    pub lock_timeout: Option<u64>,

    /// Output format
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            changelog: self.changelog.clone(),
            contexts: self.contexts.clone(),
            labels: self.labels.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

fn main() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidemark=info,tidemark_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let format = args.format;

    match run(args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(CliError::Migration(e)) => {
            eprintln!("{}", create_formatter(format).format_error(&e));
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Run the selected command; `Ok(false)` means it finished but reported a failure.
fn run(args: Args) -> Result<bool, CliError> {
    let settings = Settings::resolve(args.defaults_file.as_deref(), args.overrides())?;
    tracing::debug!(
        command = args.command.name(),
        changelog = %settings.changelog.display(),
        "resolved settings"
    );

    let mut migrator = settings.migrator()?;
    let formatter = create_formatter(args.format);
    let output = commands::execute(&mut migrator, &args.command, formatter.as_ref())?;
    println!("{}", output.text);
    Ok(!output.failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use commands::{RollbackTarget, UpdateTarget};

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "tidemark",
            "update",
            "--count",
            "2",
            "--url",
            "sqlite:app.db",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.format, OutputFormat::Json);
        assert_eq!(args.url.as_deref(), Some("sqlite:app.db"));
        assert_eq!(
            args.command,
            Command::Update(UpdateTarget {
                to_tag: None,
                count: Some(2),
            })
        );
    }

    #[test]
    fn test_rollback_needs_exactly_one_target() {
        assert!(Args::try_parse_from(["tidemark", "rollback"]).is_err());
        assert!(Args::try_parse_from(["tidemark", "rollback", "--tag", "v1", "--count", "1"]).is_err());

        let args = Args::try_parse_from(["tidemark", "rollback-sql", "--date", "2024-01-01"]).unwrap();
        assert_eq!(
            args.command,
            Command::RollbackSql(RollbackTarget {
                date: Some("2024-01-01".into()),
                ..RollbackTarget::default()
            })
        );
    }

    #[test]
    fn test_update_target_flags_conflict() {
        assert!(Args::try_parse_from(["tidemark", "update", "--to-tag", "v1", "--count", "1"]).is_err());
    }

    #[test]
    fn test_run_against_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("changelog.json"),
            r#"{"databaseChangeLog": [
                {"changeSet": {"id": "1", "author": "alice", "changes": [
                    {"createTable": {"tableName": "person", "columns": [{"name": "id", "type": "INTEGER"}]}}
                ]}}
            ]}"#,
        )
        .unwrap();
        let url = format!("sqlite:{}", dir.path().join("app.db").display());
        let changelog = dir.path().join("changelog.json");

        let parse = |command: &str| {
            Args::try_parse_from([
                "tidemark",
                "--url",
                url.as_str(),
                "--changelog",
                changelog.to_str().unwrap(),
                command,
            ])
            .unwrap()
        };

        assert!(run(parse("update")).unwrap());
        assert!(run(parse("validate")).unwrap());

        let settings = Settings::resolve(None, parse("status").overrides()).unwrap();
        let mut migrator = settings.migrator().unwrap();
        assert!(migrator.status().unwrap().is_up_to_date());
        assert_eq!(migrator.history().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_url_is_an_error() {
        let args = Args::try_parse_from(["tidemark", "status"]).unwrap();
        assert!(matches!(run(args), Err(CliError::Invalid(_))));
    }
}
