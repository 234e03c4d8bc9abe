//! Database schema migrations.
//!
//! Applies the initial schema: atoms, blobs, embeddings, spatial_keys, the
//! append-only landmark_sets and partition_sets version logs, and the
//! schema_migrations tracking table.

use rusqlite::Connection;
use tracing::info;

use atomdb_core::error::Result;

use crate::db::sql_err;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(sql_err("create migrations table"))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(sql_err("query migration version"))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- One row per unique (tenant, content) pair.
        CREATE TABLE IF NOT EXISTS atoms (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant            TEXT NOT NULL,
            fingerprint       BLOB NOT NULL CHECK (length(fingerprint) = 32),
            modality          TEXT NOT NULL
                              CHECK (modality IN ('text', 'image', 'audio', 'weight', 'code', 'binary')),
            byte_len          INTEGER NOT NULL,
            inline_value      BLOB NOT NULL,
            overflow_key      TEXT,
            refcount          INTEGER NOT NULL DEFAULT 1 CHECK (refcount >= 0),
            created_at        INTEGER NOT NULL,
            last_accessed_at  INTEGER NOT NULL,
            released_at       INTEGER,
            UNIQUE (tenant, fingerprint)
        );

        CREATE INDEX IF NOT EXISTS idx_atoms_released
            ON atoms (released_at)
            WHERE refcount = 0;

        CREATE INDEX IF NOT EXISTS idx_atoms_overflow_key
            ON atoms (overflow_key)
            WHERE overflow_key IS NOT NULL;

        -- Canonical storage for values above the inline threshold.
        CREATE TABLE IF NOT EXISTS blobs (
            key         TEXT PRIMARY KEY NOT NULL,
            content     BLOB NOT NULL,
            byte_len    INTEGER NOT NULL,
            created_at  INTEGER NOT NULL
        );

        -- Full-precision vectors, one per (atom, model version).
        CREATE TABLE IF NOT EXISTS embeddings (
            atom_id     INTEGER NOT NULL,
            model       TEXT NOT NULL,
            dimension   INTEGER NOT NULL,
            vector      BLOB NOT NULL,
            created_at  INTEGER NOT NULL,
            PRIMARY KEY (atom_id, model),
            FOREIGN KEY (atom_id) REFERENCES atoms(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_embeddings_model
            ON embeddings (model);

        -- Projected keys, one per (atom, model, landmark version).
        CREATE TABLE IF NOT EXISTS spatial_keys (
            atom_id            INTEGER NOT NULL,
            model              TEXT NOT NULL,
            landmark_version   INTEGER NOT NULL,
            coords             BLOB NOT NULL,
            partition_id       INTEGER NOT NULL,
            partition_version  INTEGER NOT NULL,
            locality_key       BLOB NOT NULL,
            PRIMARY KEY (atom_id, model, landmark_version),
            FOREIGN KEY (atom_id) REFERENCES atoms(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_spatial_keys_layout
            ON spatial_keys (model, landmark_version, partition_id, locality_key);

        -- Append-only landmark basis versions.
        CREATE TABLE IF NOT EXISTS landmark_sets (
            version         INTEGER PRIMARY KEY NOT NULL,
            dimension       INTEGER NOT NULL,
            landmark_count  INTEGER NOT NULL,
            vectors         BLOB NOT NULL,
            valid_from      INTEGER NOT NULL
        );

        -- Append-only partition centroid versions, per model.
        CREATE TABLE IF NOT EXISTS partition_sets (
            model             TEXT NOT NULL,
            version           INTEGER NOT NULL,
            landmark_version  INTEGER NOT NULL,
            key_dimension     INTEGER NOT NULL,
            centroid_count    INTEGER NOT NULL,
            centroids         BLOB NOT NULL,
            iterations        INTEGER NOT NULL,
            converged         INTEGER NOT NULL,
            valid_from        INTEGER NOT NULL,
            PRIMARY KEY (model, version),
            FOREIGN KEY (landmark_version) REFERENCES landmark_sets(version)
        );

        INSERT INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(sql_err("apply migration v1"))?;

    Ok(())
}
