//! CLI configuration.
//!
//! Settings come from an optional properties-style defaults file and are
//! overridden by command-line flags:
//!
//! ```text
//! # tidemark.properties
//! changeLogFile = db/changelog.json
//! url = sqlite:app.db
//! contexts: dev, test
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tidemark_core::connection::DbError;
use tidemark_core::{FileSystemSource, MigrationConfig, MigrationError, Migrator, SqliteConnection};

/// Changelog used when neither the defaults file nor a flag names one.
pub const DEFAULT_CHANGELOG: &str = "changelog.json";

/// Keys of the defaults file that the tool reads.
pub const KNOWN_KEYS: &[&str] = &[
    "changeLogFile",
    "url",
    "contexts",
    "labels",
    "labelFilter",
    "lockTimeout",
    "lockHolder",
    "databaseChangeLogTableName",
    "databaseChangeLogLockTableName",
];

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// A file cannot be read.
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The defaults file is malformed.
    #[error("{}:{line}: {message}", .path.display())]
    Properties {
        /// File path.
        path: PathBuf,
        /// One-based line.
        line: usize,
        /// What is wrong.
        message: String,
    },

    /// A setting has an invalid value.
    #[error("invalid setting: {0}")]
    Invalid(String),

    /// The database URL names no supported database.
    #[error("unsupported database url '{0}' (expected sqlite:<path>)")]
    UnsupportedUrl(String),

    /// The database cannot be opened.
    #[error("cannot open database: {0}")]
    Database(#[from] DbError),

    /// A migration operation failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Key/value pairs of a defaults file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    /// Read a defaults file.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|(line, message)| CliError::Properties {
            path: path.to_path_buf(),
            line,
            message,
        })
    }

    /// Parse `key=value` and `key: value` lines. `#` and `!` start comment
    /// lines and a trailing backslash continues a value on the next line.
    pub fn parse(text: &str) -> Result<Self, (usize, String)> {
        let mut entries = BTreeMap::new();
        let mut pending: Option<(usize, String)> = None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();

            let (start, logical) = match pending.take() {
                Some((start, mut joined)) => {
                    joined.push_str(line);
                    (start, joined)
                }
                None => {
                    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                        continue;
                    }
                    (line_no, line.to_string())
                }
            };

            if let Some(stripped) = logical.strip_suffix('\\') {
                pending = Some((start, stripped.to_string()));
                continue;
            }

            let Some(split) = logical.find(['=', ':']) else {
                return Err((start, format!("expected key=value, found '{}'", logical)));
            };
            let key = logical[..split].trim();
            if key.is_empty() {
                return Err((start, "missing key".to_string()));
            }
            let value = logical[split + 1..].trim();
            entries.insert(key.to_string(), value.to_string());
        }

        if let Some((start, _)) = pending {
            return Err((start, "continuation at end of file".to_string()));
        }
        Ok(Self { entries })
    }

    /// Value of a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Keys the tool does not read.
    pub fn unknown_keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .keys()
            .map(String::as_str)
            .filter(|k| !KNOWN_KEYS.contains(k))
    }
}

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    /// A SQLite database file.
    SqliteFile(PathBuf),
    /// A private in-memory SQLite database.
    SqliteMemory,
}

impl DatabaseUrl {
    /// Parse `sqlite:<path>`, `sqlite://<path>`, `jdbc:sqlite:<path>` or
    /// `sqlite::memory:`.
    pub fn parse(url: &str) -> Result<Self, CliError> {
        let url = url.trim();
        let rest = url
            .strip_prefix("jdbc:")
            .unwrap_or(url)
            .strip_prefix("sqlite:")
            .ok_or_else(|| CliError::UnsupportedUrl(url.to_string()))?;
        let path = rest.strip_prefix("//").unwrap_or(rest);
        match path {
            "" => Err(CliError::UnsupportedUrl(url.to_string())),
            ":memory:" => Ok(DatabaseUrl::SqliteMemory),
            path => Ok(DatabaseUrl::SqliteFile(PathBuf::from(path))),
        }
    }

    /// Open a connection.
    pub fn connect(&self) -> Result<SqliteConnection, DbError> {
        match self {
            DatabaseUrl::SqliteFile(path) => SqliteConnection::open(path),
            DatabaseUrl::SqliteMemory => SqliteConnection::open_in_memory(),
        }
    }
}

/// Flag values that override the defaults file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    /// Database URL.
    pub url: Option<String>,
    /// Root changelog file.
    pub changelog: Option<PathBuf>,
    /// Comma-separated contexts.
    pub contexts: Option<String>,
    /// Label expression.
    pub labels: Option<String>,
    /// Lock timeout in seconds.
    pub lock_timeout: Option<u64>,
}

/// Fully resolved settings of one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Database location.
    pub database: DatabaseUrl,
    /// Root changelog file.
    pub changelog: PathBuf,
    /// Engine configuration.
    pub config: MigrationConfig,
}

impl Settings {
    /// Merge the defaults file (when given) with flag overrides.
    ///
    /// A changelog named in the defaults file is resolved against the
    /// directory of that file.
    pub fn resolve(defaults_file: Option<&Path>, overrides: Overrides) -> Result<Self, CliError> {
        let properties = match defaults_file {
            Some(path) => Properties::load(path)?,
            None => Properties::default(),
        };
        for key in properties.unknown_keys() {
            tracing::debug!(key, "ignoring unknown defaults file key");
        }
        let base = defaults_file
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let url = overrides
            .url
            .or_else(|| properties.get("url").map(str::to_string))
            .ok_or_else(|| CliError::Invalid("no database url; pass --url or set url".to_string()))?;
        let database = DatabaseUrl::parse(&url)?;

        let changelog = match overrides.changelog {
            Some(path) => path,
            None => match properties.get("changeLogFile") {
                Some(file) => base.join(file),
                None => PathBuf::from(DEFAULT_CHANGELOG),
            },
        };

        let mut config = MigrationConfig::new();
        if let Some(table) = properties.get("databaseChangeLogTableName") {
            config = config.with_changelog_table(table);
        }
        if let Some(table) = properties.get("databaseChangeLogLockTableName") {
            config = config.with_lock_table(table);
        }
        if let Some(holder) = properties.get("lockHolder") {
            config = config.with_holder(holder);
        }

        let lock_timeout = match overrides.lock_timeout {
            Some(secs) => Some(secs),
            None => properties
                .get("lockTimeout")
                .map(|v| {
                    v.parse::<u64>()
                        .map_err(|_| CliError::Invalid(format!("lockTimeout '{}' is not a number of seconds", v)))
                })
                .transpose()?,
        };
        if let Some(secs) = lock_timeout {
            config = config.with_lock_timeout(Duration::from_secs(secs));
        }

        let contexts = overrides
            .contexts
            .or_else(|| properties.get("contexts").map(str::to_string));
        if let Some(contexts) = contexts {
            config = config.with_contexts(split_list(&contexts));
        }

        let labels = overrides.labels.or_else(|| {
            properties
                .get("labels")
                .or_else(|| properties.get("labelFilter"))
                .map(str::to_string)
        });
        if let Some(labels) = labels {
            config = config.with_label_expression(&labels)?;
        }

        config.validate()?;
        Ok(Self {
            database,
            changelog,
            config,
        })
    }

    /// Open the database and build a migrator over the changelog.
    ///
    /// The changelog's directory becomes the source root, so change set
    /// identities do not depend on where the tool is run from.
    pub fn migrator(&self) -> Result<Migrator<SqliteConnection>, CliError> {
        let conn = self.database.connect()?;
        let root = self
            .changelog
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let file = self
            .changelog
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                CliError::Invalid(format!("changelog '{}' is not a file", self.changelog.display()))
            })?;
        Ok(Migrator::new(conn, FileSystemSource::new(root), file).with_config(self.config.clone()))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_properties() {
        let props = Properties::parse(
            "# connection\n\
             url = sqlite:app.db\n\
             ! legacy comment\n\
             changeLogFile: db/changelog.json\n\
             contexts=dev,\\\n\
             \x20   test\n\
             username=sa\n",
        )
        .unwrap();
        assert_eq!(props.get("url"), Some("sqlite:app.db"));
        assert_eq!(props.get("changeLogFile"), Some("db/changelog.json"));
        assert_eq!(props.get("contexts"), Some("dev,test"));
        assert_eq!(props.unknown_keys().collect::<Vec<_>>(), vec!["username"]);
    }

    #[test]
    fn test_parse_errors_carry_lines() {
        assert_eq!(Properties::parse("url=x\njust words\n").unwrap_err().0, 2);
        assert_eq!(Properties::parse("=value").unwrap_err().0, 1);
        assert!(Properties::parse("url=a\\").is_err());
    }

    #[test]
    fn test_database_urls() {
        assert_eq!(
            DatabaseUrl::parse("sqlite:app.db").unwrap(),
            DatabaseUrl::SqliteFile("app.db".into())
        );
        assert_eq!(
            DatabaseUrl::parse("jdbc:sqlite:/var/lib/app.db").unwrap(),
            DatabaseUrl::SqliteFile("/var/lib/app.db".into())
        );
        assert_eq!(
            DatabaseUrl::parse("sqlite://data/app.db").unwrap(),
            DatabaseUrl::SqliteFile("data/app.db".into())
        );
        assert_eq!(DatabaseUrl::parse("sqlite::memory:").unwrap(), DatabaseUrl::SqliteMemory);
        assert!(matches!(
            DatabaseUrl::parse("postgres://localhost/app"),
            Err(CliError::UnsupportedUrl(_))
        ));
        assert!(DatabaseUrl::parse("sqlite:").is_err());
    }

    #[test]
    fn test_flags_override_defaults_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tidemark.properties");
        std::fs::write(
            &file,
            "url=sqlite:from-file.db\n\
             changeLogFile=db/changelog.json\n\
             contexts=dev\n\
             lockTimeout=30\n\
             databaseChangeLogTableName=history\n",
        )
        .unwrap();

        let settings = Settings::resolve(
            Some(&file),
            Overrides {
                contexts: Some("prod, eu".into()),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.database, DatabaseUrl::SqliteFile("from-file.db".into()));
        assert_eq!(settings.changelog, dir.path().join("db/changelog.json"));
        assert_eq!(settings.config.contexts, vec!["prod".to_string(), "eu".to_string()]);
        assert_eq!(settings.config.lock_timeout, Duration::from_secs(30));
        assert_eq!(settings.config.changelog_table, "history");

        let settings = Settings::resolve(
            Some(&file),
            Overrides {
                url: Some("sqlite::memory:".into()),
                changelog: Some("other.json".into()),
                lock_timeout: Some(5),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.database, DatabaseUrl::SqliteMemory);
        assert_eq!(settings.changelog, PathBuf::from("other.json"));
        assert_eq!(settings.config.lock_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(
            Settings::resolve(None, Overrides::default()),
            Err(CliError::Invalid(_))
        ));
        let bad_labels = Overrides {
            url: Some("sqlite::memory:".into()),
            labels: Some("v1 and".into()),
            ..Overrides::default()
        };
        assert!(matches!(
            Settings::resolve(None, bad_labels),
            Err(CliError::Migration(MigrationError::Config(_)))
        ));
        assert!(matches!(
            Settings::resolve(Some(Path::new("/nonexistent/tidemark.properties")), Overrides::default()),
            Err(CliError::Io { .. })
        ));
    }
}
