//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{ffi, Connection, ErrorCode, TransactionBehavior};
use tracing::info;

use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::Timestamp;

use crate::migrations;

/// Thread-safe SQLite database wrapper.
///
/// Uses WAL mode so readers in other processes are not blocked by the
/// writer. Within the process the connection is guarded by a Mutex since
/// rusqlite Connection is not Sync.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL, foreign keys, a busy timeout,
    /// and runs all pending migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(sql_err("open database"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA cache_size = -65536;",
        )
        .map_err(sql_err("set pragmas"))?;

        info!("Database opened at {}", path.display());
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err("open in-memory database"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(sql_err("set pragmas"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AtomError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a closure inside an IMMEDIATE transaction.
    ///
    /// The write lock is taken up front, so a select-then-write sequence in
    /// the closure cannot interleave with another writer. The transaction
    /// commits only if the closure returns `Ok`; any error rolls it back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| AtomError::Storage(format!("Database lock poisoned: {}", e)))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err("begin transaction"))?;
        let value = f(&tx)?;
        tx.commit().map_err(sql_err("commit transaction"))?;
        Ok(value)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

/// Map a rusqlite error into the store's taxonomy.
///
/// Busy/locked failures become a retryable conflict; everything else is a
/// storage error tagged with `context`.
pub(crate) fn sql_err(context: &'static str) -> impl Fn(rusqlite::Error) -> AtomError {
    move |err| {
        if is_busy(&err) {
            AtomError::ConcurrencyConflict { attempts: 1 }
        } else {
            AtomError::Storage(format!("{}: {}", context, err))
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// A UNIQUE or PRIMARY KEY clash, the only constraint failure a concurrent
/// writer can cause. Foreign-key, CHECK and NOT NULL failures are not.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
    )
}

pub(crate) fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<Timestamp> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(ts) => Ok(ts),
        _ => Err(AtomError::Integrity(format!("invalid stored timestamp: {}", ms))),
    }
}

pub(crate) fn from_opt_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}
