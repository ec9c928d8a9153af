//! Migration configuration.

use std::time::Duration;

use rand::Rng;

use crate::changelog::{ContextExpr, ContextFilter};
use crate::error::MigrationError;
use crate::lock::{Backoff, DEFAULT_LOCK_TABLE};
use crate::tracking::DEFAULT_TRACKING_TABLE;

/// Default time to wait for the run lock, in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

/// Default first retry delay while waiting for the lock, in milliseconds.
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 50;

/// Default upper bound for one retry delay, in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 2_000;

/// Default age after which a held lock is reported as stale, in seconds.
pub const DEFAULT_STALE_LOCK_SECS: u64 = 3_600;

/// Identity used for the run lock when none is configured:
/// `<host>:<pid>:<random suffix>`.
///
/// The suffix keeps two migrators in the same process apart.
pub fn default_holder() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}:{}:{:08x}", host, std::process::id(), suffix)
}

/// Settings of a [`crate::Migrator`].
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Tracking table name.
    pub changelog_table: String,

    /// Lock table name.
    pub lock_table: String,

    /// How long to wait for the run lock.
    pub lock_timeout: Duration,

    /// Retry backoff while waiting for the lock.
    pub backoff: Backoff,

    /// Lock holder identity.
    pub holder: String,

    /// Active contexts. Empty selects every change set.
    pub contexts: Vec<String>,

    /// Label expression. Empty selects every change set.
    pub labels: ContextExpr,

    /// Age after which a held lock is reported as stale.
    pub stale_lock_after: Duration,
}

impl MigrationConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self {
            changelog_table: DEFAULT_TRACKING_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            backoff: Backoff {
                initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
                max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            },
            holder: default_holder(),
            contexts: Vec::new(),
            labels: ContextExpr::empty(),
            stale_lock_after: Duration::from_secs(DEFAULT_STALE_LOCK_SECS),
        }
    }

    /// Set the tracking table name.
    pub fn with_changelog_table(mut self, table: impl Into<String>) -> Self {
        self.changelog_table = table.into();
        self
    }

    /// Set the lock table name.
    pub fn with_lock_table(mut self, table: impl Into<String>) -> Self {
        self.lock_table = table.into();
        self
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the lock retry backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the lock holder identity.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Set the active contexts.
    pub fn with_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contexts = contexts.into_iter().map(Into::into).collect();
        self
    }

    /// Set the label expression.
    pub fn with_labels(mut self, labels: ContextExpr) -> Self {
        self.labels = labels;
        self
    }

    /// Parse and set the label expression.
    pub fn with_label_expression(self, labels: &str) -> Result<Self, MigrationError> {
        let expr = ContextExpr::parse(labels).map_err(MigrationError::Config)?;
        Ok(self.with_labels(expr))
    }

    /// Set the stale lock threshold.
    pub fn with_stale_lock_after(mut self, threshold: Duration) -> Self {
        self.stale_lock_after = threshold;
        self
    }

    /// Context and label filter for planning.
    pub fn filter(&self) -> ContextFilter {
        ContextFilter::new(self.contexts.iter().cloned(), self.labels.clone())
    }

    /// Check the settings.
    pub fn validate(&self) -> Result<(), MigrationError> {
        for (what, table) in [("changelog table", &self.changelog_table), ("lock table", &self.lock_table)] {
            if !is_identifier(table) {
                return Err(MigrationError::Config(format!(
                    "{} name '{}' is not a plain identifier",
                    what, table
                )));
            }
        }
        if self.changelog_table.eq_ignore_ascii_case(&self.lock_table) {
            return Err(MigrationError::Config(
                "changelog table and lock table must differ".to_string(),
            ));
        }
        if self.holder.trim().is_empty() {
            return Err(MigrationError::Config("lock holder must not be empty".to_string()));
        }
        if self.backoff.initial.is_zero() || self.backoff.initial > self.backoff.max {
            return Err(MigrationError::Config(format!(
                "backoff initial {:?} must be positive and at most max {:?}",
                self.backoff.initial, self.backoff.max
            )));
        }
        Ok(())
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MigrationConfig::default();
        assert_eq!(config.changelog_table, "tidemark_changelog");
        assert_eq!(config.lock_table, "tidemark_lock");
        assert_eq!(config.lock_timeout, Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS));
        assert!(config.contexts.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = MigrationConfig::new()
            .with_changelog_table("history")
            .with_lock_table("run_lock")
            .with_holder("ci")
            .with_contexts(["dev", "test"])
            .with_lock_timeout(Duration::from_secs(5))
            .with_label_expression("v1 or v2")
            .unwrap();

        assert_eq!(config.changelog_table, "history");
        assert_eq!(config.holder, "ci");
        assert_eq!(config.contexts, vec!["dev".to_string(), "test".to_string()]);
        assert_eq!(config.labels.as_str(), "v1 or v2");
        assert_eq!(config.filter().contexts(), &["dev".to_string(), "test".to_string()]);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(MigrationConfig::new().with_changelog_table("drop table x").validate().is_err());
        assert!(MigrationConfig::new().with_lock_table("tidemark_changelog").validate().is_err());
        assert!(MigrationConfig::new().with_holder("  ").validate().is_err());
        assert!(MigrationConfig::new().with_label_expression("a and").is_err());
    }

    #[test]
    fn test_default_holders_differ() {
        assert_ne!(default_holder(), default_holder());
    }
}
