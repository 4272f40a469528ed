//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::SealError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), SealError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.execute_batch(TABLES_SCHEMA)?;
        conn.execute_batch(INDEXES_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, SealError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), SealError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

const TABLES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS document_versions (
    id BLOB PRIMARY KEY,
    document_id BLOB NOT NULL,
    storage_key TEXT NOT NULL,
    original_storage_key TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS signature_stamps (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL COLLATE NOCASE UNIQUE,
    image_ref TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_by BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS signature_requests (
    id BLOB PRIMARY KEY,
    document_version_id BLOB NOT NULL REFERENCES document_versions(id) ON DELETE CASCADE,
    requester_id BLOB NOT NULL,
    approver_id BLOB,
    signature_type TEXT NOT NULL,
    status TEXT NOT NULL,
    requested_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    signed_at INTEGER,
    reason TEXT NOT NULL,
    cancel_reason TEXT
);

CREATE TABLE IF NOT EXISTS digital_signatures (
    id BLOB PRIMARY KEY,
    document_version_id BLOB NOT NULL REFERENCES document_versions(id) ON DELETE CASCADE,
    signer_id BLOB NOT NULL,
    signature_stamp_id BLOB REFERENCES signature_stamps(id),
    document_hash TEXT,
    signature_hash TEXT,
    signature_status TEXT NOT NULL,
    signed_at INTEGER NOT NULL,
    verified_at INTEGER,
    signature_data TEXT NOT NULL,
    artifact_key TEXT NOT NULL,
    UNIQUE (document_version_id, signer_id)
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_requests_version ON signature_requests(document_version_id, requested_at);
CREATE INDEX IF NOT EXISTS idx_requests_expiry ON signature_requests(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_signatures_stamp ON digital_signatures(signature_stamp_id);
"#;
