//! Content-addressed atom table.
//!
//! `put` resolves content to an atom id by SHA-256 fingerprint, scoped by
//! tenant. The lookup, collision check and insert-or-increment run inside
//! one IMMEDIATE transaction, so concurrent puts of identical bytes converge
//! on a single row whose refcount reflects every call. Transient busy/lock
//! failures are retried a bounded number of times.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, error};

use atomdb_core::config::StoreConfig;
use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{Atom, AtomId, AtomRef, Fingerprint, Modality, StoredValue, Timestamp};

use crate::db::{from_millis, from_opt_millis, is_unique_violation, sql_err, to_millis, Database};
use crate::overflow::OverflowCodec;

/// One unique piece of content to be written with a given multiplicity.
#[derive(Debug, Clone, Copy)]
pub struct PutEntry<'a> {
    pub content: &'a [u8],
    pub modality: Modality,
    /// How many references this write adds.
    pub occurrences: u64,
}

/// Aggregate counters over the atom table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub atoms: u64,
    pub live: u64,
    pub awaiting_sweep: u64,
    pub overflow: u64,
    pub blobs: u64,
    pub total_bytes: u64,
}

/// Deduplicating atom store backed by SQLite.
pub struct FingerprintStore {
    db: Arc<Database>,
    codec: OverflowCodec,
    max_attempts: u32,
}

const ATOM_COLUMNS: &str = "id, tenant, fingerprint, modality, byte_len, inline_value, overflow_key,
                            refcount, created_at, last_accessed_at, released_at";

impl FingerprintStore {
    pub fn new(db: Arc<Database>, config: &StoreConfig) -> Self {
        Self {
            db,
            codec: OverflowCodec::from_config(config),
            max_attempts: config.max_conflict_retries.max(1),
        }
    }

    pub fn codec(&self) -> &OverflowCodec {
        &self.codec
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Store content, or add a reference to the atom that already holds it.
    pub fn put(&self, tenant: &str, content: &[u8], modality: Modality) -> Result<AtomRef> {
        let entry = PutEntry {
            content,
            modality,
            occurrences: 1,
        };
        let mut refs = self.put_many(tenant, &[entry])?;
        refs.pop()
            .ok_or_else(|| AtomError::Storage("put produced no atom reference".to_string()))
    }

    /// Apply several puts in one transaction.
    ///
    /// Entries must already be unique by content; each adds `occurrences`
    /// references. Either every entry is applied or none is.
    pub fn put_many(&self, tenant: &str, entries: &[PutEntry<'_>]) -> Result<Vec<AtomRef>> {
        if tenant.is_empty() {
            return Err(AtomError::Validation("tenant must not be empty".to_string()));
        }
        if let Some(entry) = entries.iter().find(|e| e.occurrences == 0) {
            return Err(AtomError::Validation(format!(
                "put of {} bytes with zero occurrences",
                entry.content.len()
            )));
        }
        let fingerprints: Vec<Fingerprint> =
            entries.iter().map(|e| Fingerprint::of(e.content)).collect();

        self.with_retry(|| {
            self.db.with_tx(|conn| {
                let now = Utc::now();
                entries
                    .iter()
                    .zip(&fingerprints)
                    .map(|(entry, fp)| self.upsert(conn, tenant, fp, entry, now))
                    .collect()
            })
        })
    }

    /// Insert-or-increment for one unique entry. Runs inside a transaction.
    fn upsert(
        &self,
        conn: &Connection,
        tenant: &str,
        fingerprint: &Fingerprint,
        entry: &PutEntry<'_>,
        now: Timestamp,
    ) -> Result<AtomRef> {
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {} FROM atoms WHERE tenant = ?1 AND fingerprint = ?2",
                    ATOM_COLUMNS
                ),
                params![tenant, fingerprint.as_bytes()],
                |row| Ok(row_to_atom(row)),
            )
            .optional()
            .map_err(sql_err("look up fingerprint"))?
            .transpose()?;

        if let Some(atom) = existing {
            if !self.codec.matches(&atom.value, atom.byte_len, entry.content) {
                error!(
                    atom_id = %atom.id,
                    fingerprint = %fingerprint,
                    "Fingerprint collision: different content maps to an existing atom"
                );
                return Err(AtomError::Integrity(format!(
                    "fingerprint {} already holds different content (atom {})",
                    fingerprint, atom.id
                )));
            }

            conn.execute(
                "UPDATE atoms SET refcount = refcount + ?1, released_at = NULL, last_accessed_at = ?2
                 WHERE id = ?3",
                params![entry.occurrences as i64, to_millis(now), atom.id.0],
            )
            .map_err(sql_err("increment refcount"))?;

            debug!(atom_id = %atom.id, added = entry.occurrences, "Existing atom referenced");
            return Ok(AtomRef {
                id: atom.id,
                is_new: false,
                refcount: atom.refcount + entry.occurrences,
                fingerprint: *fingerprint,
            });
        }

        let value = self.codec.encode(fingerprint, entry.content);
        let (inline_value, overflow_key) = match &value {
            StoredValue::Inline(bytes) => (bytes.as_slice(), None),
            StoredValue::Overflow { key, prefix } => {
                self.store_blob(conn, key, entry.content, now)?;
                (prefix.as_slice(), Some(key.as_str()))
            }
        };

        conn.execute(
            "INSERT INTO atoms (tenant, fingerprint, modality, byte_len, inline_value, overflow_key,
                                refcount, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                tenant,
                fingerprint.as_bytes(),
                entry.modality.as_str(),
                entry.content.len() as i64,
                inline_value,
                overflow_key,
                entry.occurrences as i64,
                to_millis(now),
            ],
        )
        .map_err(|e| {
            // Another writer won the insert; retrying turns this call into an increment.
            if is_unique_violation(&e) {
                AtomError::ConcurrencyConflict { attempts: 1 }
            } else {
                sql_err("insert atom")(e)
            }
        })?;

        let id = AtomId(conn.last_insert_rowid());
        debug!(atom_id = %id, bytes = entry.content.len(), overflow = overflow_key.is_some(), "Atom created");
        Ok(AtomRef {
            id,
            is_new: true,
            refcount: entry.occurrences,
            fingerprint: *fingerprint,
        })
    }

    fn store_blob(&self, conn: &Connection, key: &str, content: &[u8], now: Timestamp) -> Result<()> {
        let existing_len: Option<i64> = conn
            .query_row(
                "SELECT byte_len FROM blobs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err("look up blob"))?;

        match existing_len {
            Some(len) if len as usize == content.len() => Ok(()),
            Some(len) => Err(AtomError::Integrity(format!(
                "blob {} holds {} bytes, new content has {}",
                key,
                len,
                content.len()
            ))),
            None => {
                conn.execute(
                    "INSERT INTO blobs (key, content, byte_len, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![key, content, content.len() as i64, to_millis(now)],
                )
                .map_err(sql_err("insert blob"))?;
                Ok(())
            }
        }
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    debug!(attempt, "Retrying atom write after conflict");
                    std::thread::sleep(Duration::from_millis(1 << attempt.min(6)));
                }
                Err(e) if e.is_retryable() => {
                    return Err(AtomError::ConcurrencyConflict { attempts: attempt });
                }
                other => return other,
            }
        }
    }

    /// Reconstruct an atom's original bytes and record the access.
    pub fn get(&self, id: AtomId) -> Result<Vec<u8>> {
        self.db.with_conn(|conn| {
            let atom = load_atom(conn, id)?
                .ok_or_else(|| AtomError::NotFound(format!("atom {}", id)))?;

            let blob: Option<Vec<u8>> = match &atom.value {
                StoredValue::Inline(_) => None,
                StoredValue::Overflow { key, .. } => conn
                    .query_row(
                        "SELECT content FROM blobs WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(sql_err("load blob"))?,
            };

            let content = self
                .codec
                .decode(&atom.fingerprint, atom.byte_len, &atom.value, blob.as_deref())
                .inspect_err(|e| error!(atom_id = %id, error = %e, "Corrupted atom record"))?;

            conn.execute(
                "UPDATE atoms SET last_accessed_at = ?1 WHERE id = ?2",
                params![to_millis(Utc::now()), id.0],
            )
            .map_err(sql_err("touch atom"))?;

            Ok(content)
        })
    }

    /// Atom metadata without touching it.
    pub fn atom(&self, id: AtomId) -> Result<Option<Atom>> {
        self.db.with_conn(|conn| load_atom(conn, id))
    }

    pub fn find_by_fingerprint(&self, tenant: &str, fingerprint: &Fingerprint) -> Result<Option<Atom>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM atoms WHERE tenant = ?1 AND fingerprint = ?2",
                    ATOM_COLUMNS
                ),
                params![tenant, fingerprint.as_bytes()],
                |row| Ok(row_to_atom(row)),
            )
            .optional()
            .map_err(sql_err("find by fingerprint"))?
            .transpose()
        })
    }

    /// Drop one reference. Returns the remaining count.
    ///
    /// At zero the atom is stamped with `released_at` and left for the
    /// garbage sweep; it stays readable until then.
    pub fn release(&self, id: AtomId) -> Result<u64> {
        self.with_retry(|| {
            self.db.with_tx(|conn| {
                let now = to_millis(Utc::now());
                let changed = conn
                    .execute(
                        "UPDATE atoms
                         SET refcount = refcount - 1,
                             released_at = CASE WHEN refcount = 1 THEN ?1 ELSE released_at END
                         WHERE id = ?2 AND refcount > 0",
                        params![now, id.0],
                    )
                    .map_err(sql_err("decrement refcount"))?;

                let refcount: Option<i64> = conn
                    .query_row("SELECT refcount FROM atoms WHERE id = ?1", params![id.0], |row| {
                        row.get(0)
                    })
                    .optional()
                    .map_err(sql_err("read refcount"))?;

                match (changed, refcount) {
                    (_, None) => Err(AtomError::NotFound(format!("atom {}", id))),
                    (0, Some(_)) => Err(AtomError::Validation(format!(
                        "atom {} has no outstanding references",
                        id
                    ))),
                    (_, Some(count)) => {
                        debug!(atom_id = %id, refcount = count, "Atom reference released");
                        Ok(count as u64)
                    }
                }
            })
        })
    }

    pub fn count(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM atoms", [], |row| row.get(0))
                .map_err(sql_err("count atoms"))?;
            Ok(count as u64)
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.db.with_conn(|conn| {
            let (atoms, live, awaiting_sweep, overflow, total_bytes): (i64, i64, i64, i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(refcount > 0), 0),
                            COALESCE(SUM(refcount = 0), 0),
                            COALESCE(SUM(overflow_key IS NOT NULL), 0),
                            COALESCE(SUM(byte_len), 0)
                     FROM atoms",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .map_err(sql_err("atom stats"))?;
            let blobs: i64 = conn
                .query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))
                .map_err(sql_err("blob stats"))?;
            Ok(StoreStats {
                atoms: atoms as u64,
                live: live as u64,
                awaiting_sweep: awaiting_sweep as u64,
                overflow: overflow as u64,
                blobs: blobs as u64,
                total_bytes: total_bytes as u64,
            })
        })
    }
}

fn load_atom(conn: &Connection, id: AtomId) -> Result<Option<Atom>> {
    conn.query_row(
        &format!("SELECT {} FROM atoms WHERE id = ?1", ATOM_COLUMNS),
        params![id.0],
        |row| Ok(row_to_atom(row)),
    )
    .optional()
    .map_err(sql_err("load atom"))?
    .transpose()
}

/// Convert a row into an Atom. Column order follows `ATOM_COLUMNS`.
fn row_to_atom(row: &Row<'_>) -> Result<Atom> {
    let get_err = |e: rusqlite::Error| AtomError::Storage(e.to_string());

    let fingerprint: Vec<u8> = row.get(2).map_err(get_err)?;
    let modality: String = row.get(3).map_err(get_err)?;
    let inline_value: Vec<u8> = row.get(5).map_err(get_err)?;
    let overflow_key: Option<String> = row.get(6).map_err(get_err)?;

    let value = match overflow_key {
        Some(key) => StoredValue::Overflow {
            key,
            prefix: inline_value,
        },
        None => StoredValue::Inline(inline_value),
    };

    Ok(Atom {
        id: AtomId(row.get(0).map_err(get_err)?),
        tenant: row.get(1).map_err(get_err)?,
        fingerprint: Fingerprint::from_slice(&fingerprint)?,
        modality: modality.parse()?,
        byte_len: row.get::<_, i64>(4).map_err(get_err)? as u64,
        value,
        refcount: row.get::<_, i64>(7).map_err(get_err)? as u64,
        created_at: from_millis(row.get(8).map_err(get_err)?)?,
        last_accessed_at: from_millis(row.get(9).map_err(get_err)?)?,
        released_at: from_opt_millis(row.get(10).map_err(get_err)?)?,
    })
}
