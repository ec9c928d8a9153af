//! Cross-process run lock.
//!
//! The lock is a single row (id = 1) in a dedicated table. Inserting the row
//! acquires it; the primary key guarantees at most one holder. Releasing
//! deletes the row. A lock left behind by a crashed run is reported as
//! stale but is never broken automatically.

use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::connection::{ColumnSpec, ColumnType, Connection, DbError, TableSpec, Value};

/// Default lock table name.
pub const DEFAULT_LOCK_TABLE: &str = "tidemark_lock";

const LOCK_ID: i64 = 1;

/// Lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed taken for the whole timeout.
    #[error("timed out after {waited:?} waiting for lock held by {}", .holder.as_deref().unwrap_or("unknown"))]
    Timeout {
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

    /// The database failed.
    #[error("lock table: {0}")]
    Database(#[from] DbError),

    /// The lock row cannot be interpreted.
    #[error("corrupt lock row: {0}")]
    Corrupt(String),
}

/// The current lock holder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockInfo {
    /// Holder identity.
    pub holder: String,
    /// When the lock was granted.
    pub granted_at: DateTime<Utc>,
}

impl LockInfo {
    /// How long the lock has been held.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.granted_at).to_std().unwrap_or_default()
    }

    /// Whether the lock has been held longer than `threshold`.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() > threshold
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// First delay.
    pub initial: Duration,
    /// Upper bound for a single delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (zero-based), including jitter of
    /// up to half the base delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let base = self.initial.saturating_mul(factor).min(self.max);
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max)
    }
}

/// Acquires and releases the run lock.
#[derive(Debug, Clone)]
pub struct LockManager {
    table: String,
    backoff: Backoff,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TABLE)
    }
}

impl LockManager {
    /// Create a manager over the named table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            backoff: Backoff::default(),
        }
    }

    /// Set the retry backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Table definition.
    pub fn spec(&self) -> TableSpec {
        TableSpec::new(&self.table)
            .with_column(ColumnSpec::required("id", ColumnType::Integer))
            .with_column(ColumnSpec::required("locked_by", ColumnType::Text))
            .with_column(ColumnSpec::required("lock_granted", ColumnType::Text))
            .with_primary_key(["id"])
    }

    /// Create the lock table if it does not exist.
    pub fn ensure(&self, conn: &mut dyn Connection) -> Result<(), LockError> {
        conn.create_table_if_not_exists(&self.spec())?;
        Ok(())
    }

    /// The current holder, if any. A missing table means unlocked.
    pub fn current(&self, conn: &mut dyn Connection) -> Result<Option<LockInfo>, LockError> {
        if !conn.table_exists(&self.table)? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT locked_by, lock_granted FROM {} WHERE id = ?1",
            self.table
        );
        let rows = conn.query(&sql, &[Value::from(LOCK_ID)])?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let granted = row.text(1)?;
        let granted_at = DateTime::parse_from_rfc3339(&granted)
            .map_err(|e| LockError::Corrupt(format!("bad lock_granted '{}': {}", granted, e)))?
            .with_timezone(&Utc);
        Ok(Some(LockInfo {
            holder: row.text(0)?,
            granted_at,
        }))
    }

    /// Try once. Returns `true` when `holder` now holds the lock, including
    /// when it already did.
    pub fn try_acquire(&self, conn: &mut dyn Connection, holder: &str) -> Result<bool, LockError> {
        let sql = format!(
            "INSERT INTO {} (id, locked_by, lock_granted) VALUES (?1, ?2, ?3)",
            self.table
        );
        let granted = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        match conn.execute(
            &sql,
            &[Value::from(LOCK_ID), Value::from(holder), Value::from(granted)],
        ) {
            Ok(_) => Ok(true),
            Err(e) if e.is_constraint() || e.is_busy() => match self.current(conn) {
                Ok(Some(info)) => Ok(info.holder == holder),
                Ok(None) => Ok(false),
                Err(LockError::Database(e)) if e.is_busy() => Ok(false),
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire, retrying with backoff until `timeout` has elapsed.
    ///
    /// Returns `true` when the holder already held the lock. While waiting,
    /// the connection's busy timeout is capped at the time left, so a single
    /// attempt cannot outlast `timeout`.
    pub fn acquire(
        &self,
        conn: &mut dyn Connection,
        holder: &str,
        timeout: Duration,
    ) -> Result<bool, LockError> {
        let busy_timeout = conn.busy_timeout();
        let result = self.acquire_within(conn, holder, timeout, busy_timeout);

        let Some(busy_timeout) = busy_timeout else {
            return result;
        };
        match (result, conn.set_busy_timeout(busy_timeout)) {
            (Ok(reentered), Ok(())) => Ok(reentered),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), restored) => {
                if let Err(restore_err) = restored {
                    tracing::warn!(error = %restore_err, "failed to restore busy timeout");
                }
                Err(e)
            }
        }
    }

    fn acquire_within(
        &self,
        conn: &mut dyn Connection,
        holder: &str,
        timeout: Duration,
        busy_timeout: Option<Duration>,
    ) -> Result<bool, LockError> {
        let start = Instant::now();
        cap_busy_timeout(conn, busy_timeout, timeout)?;
        if let Some(info) = self.current(conn)? {
            if info.holder == holder {
                return Ok(true);
            }
        }

        let mut attempt = 0u32;
        loop {
            cap_busy_timeout(conn, busy_timeout, timeout.saturating_sub(start.elapsed()))?;
            if self.try_acquire(conn, holder)? {
                tracing::info!(holder = %holder, attempts = attempt + 1, "acquired lock");
                return Ok(false);
            }

            let waited = start.elapsed();
            if waited >= timeout {
                let holder = self.current(conn).ok().flatten().map(|info| info.holder);
                tracing::warn!(waited = ?waited, holder = ?holder, "lock acquisition timed out");
                return Err(LockError::Timeout { holder, waited });
            }

            let delay = self.backoff.delay(attempt).min(timeout - waited);
            tracing::debug!(attempt, delay = ?delay, "lock busy, retrying");
            thread::sleep(delay);
            attempt += 1;
        }
    }

    /// Acquire and wrap the connection in a guard that releases on drop.
    pub fn acquire_guard<'c>(
        &self,
        conn: &'c mut dyn Connection,
        holder: &str,
        timeout: Duration,
    ) -> Result<LockGuard<'c>, LockError> {
        let reentered = self.acquire(conn, holder, timeout)?;
        Ok(LockGuard {
            conn,
            manager: self.clone(),
            holder: holder.to_string(),
            reentered,
            released: false,
        })
    }

    /// Release the lock held by `holder`.
    pub fn release(&self, conn: &mut dyn Connection, holder: &str) -> Result<(), LockError> {
        let sql = format!("DELETE FROM {} WHERE id = ?1 AND locked_by = ?2", self.table);
        if conn.execute(&sql, &[Value::from(LOCK_ID), Value::from(holder)])? > 0 {
            tracing::info!(holder = %holder, "released lock");
            return Ok(());
        }
        match self.current(conn)? {
            Some(info) => Err(LockError::NotHolder {
                holder: info.holder,
                requested_by: holder.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Release whoever holds the lock. Returns the previous holder.
    pub fn force_release(&self, conn: &mut dyn Connection) -> Result<Option<LockInfo>, LockError> {
        let previous = self.current(conn)?;
        if previous.is_some() {
            let sql = format!("DELETE FROM {} WHERE id = ?1", self.table);
            conn.execute(&sql, &[Value::from(LOCK_ID)])?;
            tracing::warn!(holder = ?previous.as_ref().map(|p| &p.holder), "force-released lock");
        }
        Ok(previous)
    }
}

fn cap_busy_timeout(
    conn: &mut dyn Connection,
    busy_timeout: Option<Duration>,
    left: Duration,
) -> Result<(), LockError> {
    if let Some(busy_timeout) = busy_timeout {
        conn.set_busy_timeout(busy_timeout.min(left))?;
    }
    Ok(())
}

/// Holds the run lock and the connection for the duration of a run.
///
/// The guard dereferences to the connection, so the run keeps using it while
/// the lock is held. Dropping the guard releases the lock and logs failures;
/// [`LockGuard::release`] reports them instead.
pub struct LockGuard<'c> {
    conn: &'c mut dyn Connection,
    manager: LockManager,
    holder: String,
    reentered: bool,
    released: bool,
}

impl<'c> LockGuard<'c> {
    /// Holder identity.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release now.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        if self.reentered {
            return Ok(());
        }
        self.manager.release(&mut *self.conn, &self.holder)
    }
}

impl<'c> Deref for LockGuard<'c> {
    type Target = dyn Connection + 'c;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl<'c> DerefMut for LockGuard<'c> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.conn
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released || self.reentered {
            return;
        }
        if let Err(e) = self.manager.release(&mut *self.conn, &self.holder) {
            tracing::warn!(holder = %self.holder, error = %e, "failed to release lock");
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::connection::SqliteConnection;

    fn setup() -> (SqliteConnection, LockManager) {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let manager = LockManager::default().with_backoff(Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
        });
        manager.ensure(&mut conn).unwrap();
        (conn, manager)
    }

    #[test]
    fn test_acquire_and_release() {
        let (mut conn, manager) = setup();
        assert!(!manager.acquire(&mut conn, "a", Duration::from_secs(1)).unwrap());
        assert_eq!(manager.current(&mut conn).unwrap().unwrap().holder, "a");

        manager.release(&mut conn, "a").unwrap();
        assert!(manager.current(&mut conn).unwrap().is_none());
    }

    #[test]
    fn test_reentrant_for_same_holder() {
        let (mut conn, manager) = setup();
        manager.acquire(&mut conn, "a", Duration::from_secs(1)).unwrap();
        assert!(manager.acquire(&mut conn, "a", Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_timeout_when_held_by_other() {
        let (mut conn, manager) = setup();
        manager.acquire(&mut conn, "a", Duration::from_secs(1)).unwrap();

        let start = Instant::now();
        let err = manager
            .acquire(&mut conn, "b", Duration::from_millis(60))
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(60));
        match err {
            LockError::Timeout { holder, .. } => assert_eq!(holder.as_deref(), Some("a")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_acquire_restores_busy_timeout() {
        let (mut conn, manager) = setup();
        manager.acquire(&mut conn, "a", Duration::from_millis(100)).unwrap();
        manager
            .acquire(&mut conn, "b", Duration::from_millis(30))
            .unwrap_err();
        assert_eq!(
            conn.busy_timeout(),
            Some(crate::connection::sqlite::DEFAULT_BUSY_TIMEOUT)
        );
    }

    #[test]
    fn test_write_locked_database_does_not_outlast_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let mut writer = SqliteConnection::open(&path).unwrap();
        let manager = LockManager::default();
        manager.ensure(&mut writer).unwrap();
        writer.begin().unwrap();

        let mut conn = SqliteConnection::open(&path).unwrap();
        let start = Instant::now();
        let err = manager
            .acquire(&mut conn, "b", Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));

        writer.rollback().unwrap();
    }

    #[test]
    fn test_release_by_other_holder() {
        let (mut conn, manager) = setup();
        manager.acquire(&mut conn, "a", Duration::from_secs(1)).unwrap();
        assert!(matches!(
            manager.release(&mut conn, "b"),
            Err(LockError::NotHolder { .. })
        ));

        let previous = manager.force_release(&mut conn).unwrap().unwrap();
        assert_eq!(previous.holder, "a");
        assert!(manager.current(&mut conn).unwrap().is_none());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (mut conn, manager) = setup();
        {
            let mut guard = manager
                .acquire_guard(&mut conn, "a", Duration::from_secs(1))
                .unwrap();
            guard.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        }
        assert!(manager.current(&mut conn).unwrap().is_none());
        assert!(conn.table_exists("t").unwrap());
    }

    #[test]
    fn test_guard_explicit_release() {
        let (mut conn, manager) = setup();
        let guard = manager
            .acquire_guard(&mut conn, "a", Duration::from_secs(1))
            .unwrap();
        guard.release().unwrap();
        assert!(manager.current(&mut conn).unwrap().is_none());
    }

    #[test]
    fn test_stale_detection() {
        let info = LockInfo {
            holder: "a".into(),
            granted_at: Utc::now() - chrono::Duration::hours(2),
        };
        assert!(info.is_stale(Duration::from_secs(3600)));
        assert!(!info.is_stale(Duration::from_secs(3 * 3600)));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let backoff = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
        };
        assert!(backoff.delay(0) >= Duration::from_millis(10));
        assert!(backoff.delay(0) <= Duration::from_millis(15));
        assert_eq!(backoff.delay(30), Duration::from_millis(100));
    }
}
