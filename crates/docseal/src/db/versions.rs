//! Document version registry lookups and the two fields this service writes.

use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::error::SealError;
use crate::model::{DocumentVersion, VersionStatus};

const VERSION_COLUMNS: &str =
    "id, document_id, storage_key, original_storage_key, mime_type, status";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentVersion> {
    Ok(DocumentVersion {
        id: row.get(0)?,
        document_id: row.get(1)?,
        storage_key: row.get(2)?,
        original_storage_key: row.get(3)?,
        mime_type: row.get(4)?,
        status: row.get(5)?,
    })
}

pub fn insert_version(conn: &Connection, version: &DocumentVersion) -> Result<(), SealError> {
    conn.execute(
        "INSERT INTO document_versions (id, document_id, storage_key, original_storage_key, mime_type, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            version.id,
            version.document_id,
            version.storage_key,
            version.original_storage_key,
            version.mime_type,
            version.status,
        ],
    )?;
    Ok(())
}

pub fn get_version(conn: &Connection, id: Uuid) -> Result<Option<DocumentVersion>, SealError> {
    let sql = format!("SELECT {VERSION_COLUMNS} FROM document_versions WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], version_from_row).optional()?)
}

pub fn require_version(conn: &Connection, id: Uuid) -> Result<DocumentVersion, SealError> {
    get_version(conn, id)?.ok_or_else(|| SealError::not_found("document version", id))
}

pub fn set_status(conn: &Connection, id: Uuid, status: VersionStatus) -> Result<(), SealError> {
    let updated = conn.execute(
        "UPDATE document_versions SET status = ?2 WHERE id = ?1",
        params![id, status],
    )?;
    if updated == 0 {
        return Err(SealError::not_found("document version", id));
    }
    Ok(())
}

/// Points the version at a new canonical artifact, but only if it still
/// points at `expected_key`. Returns whether the swap happened.
pub fn swap_canonical_artifact(
    conn: &Connection,
    id: Uuid,
    expected_key: &str,
    new_key: &str,
) -> Result<bool, SealError> {
    let updated = conn.execute(
        "UPDATE document_versions SET storage_key = ?3 WHERE id = ?1 AND storage_key = ?2",
        params![id, expected_key, new_key],
    )?;
    Ok(updated == 1)
}
