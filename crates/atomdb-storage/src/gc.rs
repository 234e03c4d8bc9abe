//! Garbage collection of released atoms.
//!
//! Atoms whose refcount dropped to zero are kept for a retention window so
//! in-flight readers can finish. A sweep hard-deletes the ones past the
//! window (embeddings and spatial keys go with them via cascade), then drops
//! blobs no surviving atom points at. The whole sweep is one transaction: a
//! cancelled sweep leaves the store untouched.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rusqlite::params;
use tracing::info;

use atomdb_core::budget::{Budget, Interrupt};
use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{AtomId, Timestamp};

use crate::db::{sql_err, to_millis, Database};

/// Outcome of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Atoms deleted.
    pub collected: Vec<AtomId>,
    /// Overflow blobs deleted because nothing referenced them any more.
    pub blobs_deleted: usize,
    /// Bytes of atom content reclaimed.
    pub bytes_reclaimed: u64,
}

/// Hard-deletes zero-refcount atoms past the retention window.
pub struct GarbageCollector {
    db: Arc<Database>,
    retention: Duration,
    batch_size: usize,
}

impl GarbageCollector {
    pub fn new(db: Arc<Database>, retention_secs: u64, batch_size: usize) -> Self {
        Self {
            db,
            retention: Duration::seconds(retention_secs.min(i64::MAX as u64) as i64),
            batch_size: batch_size.max(1),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Sweep relative to the current time.
    pub fn sweep(&self, budget: &Budget) -> Result<SweepReport> {
        self.sweep_at(Utc::now(), budget)
    }

    /// Sweep as if the clock read `now`.
    ///
    /// Returns `Cancelled` (with nothing deleted) if the budget runs out
    /// before the sweep commits.
    pub fn sweep_at(&self, now: Timestamp, budget: &Budget) -> Result<SweepReport> {
        let cutoff = to_millis(now - self.retention);

        let report = self.db.with_tx(|conn| {
            let candidates: Vec<(i64, i64)> = {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, byte_len FROM atoms
                         WHERE refcount = 0 AND released_at IS NOT NULL AND released_at <= ?1
                         ORDER BY id",
                    )
                    .map_err(sql_err("prepare gc scan"))?;
                let rows = stmt
                    .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(sql_err("gc scan"))?;
                rows.collect::<std::result::Result<_, _>>()
                    .map_err(sql_err("read gc scan"))?
            };

            let mut report = SweepReport::default();
            for batch in candidates.chunks(self.batch_size) {
                check(budget)?;
                for &(id, byte_len) in batch {
                    // Guard on refcount again: a revival may have raced the scan.
                    let deleted = conn
                        .execute(
                            "DELETE FROM atoms WHERE id = ?1 AND refcount = 0",
                            params![id],
                        )
                        .map_err(sql_err("delete atom"))?;
                    if deleted > 0 {
                        report.collected.push(AtomId(id));
                        report.bytes_reclaimed += byte_len as u64;
                    }
                }
            }

            check(budget)?;
            report.blobs_deleted = conn
                .execute(
                    "DELETE FROM blobs
                     WHERE key NOT IN (SELECT overflow_key FROM atoms WHERE overflow_key IS NOT NULL)",
                    [],
                )
                .map_err(sql_err("delete orphan blobs"))?;

            Ok(report)
        })?;

        info!(
            atoms = report.collected.len(),
            blobs = report.blobs_deleted,
            bytes = report.bytes_reclaimed,
            "Garbage sweep complete"
        );
        Ok(report)
    }
}

fn check(budget: &Budget) -> Result<()> {
    match budget.check() {
        None => Ok(()),
        Some(Interrupt::Cancelled) | Some(Interrupt::DeadlineExceeded) => Err(AtomError::Cancelled),
    }
}
