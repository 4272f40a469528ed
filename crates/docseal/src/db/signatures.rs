use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::{optional_time_column, time_column, to_millis};
use crate::error::SealError;
use crate::integrity::SignedDigest;
use crate::model::{DigitalSignature, SignatureData, SignatureStatus};

const SIGNATURE_COLUMNS: &str = "id, document_version_id, signer_id, signature_stamp_id, \
     document_hash, signature_hash, signature_status, signed_at, verified_at, signature_data, artifact_key";

fn signature_from_row(row: &Row<'_>) -> rusqlite::Result<DigitalSignature> {
    Ok(DigitalSignature {
        id: row.get(0)?,
        document_version_id: row.get(1)?,
        signer_id: row.get(2)?,
        signature_stamp_id: row.get(3)?,
        document_hash: row.get(4)?,
        signature_hash: row.get(5)?,
        signature_status: row.get(6)?,
        signed_at: time_column(row, 7)?,
        verified_at: optional_time_column(row, 8)?,
        signature_data: row.get(9)?,
        artifact_key: row.get(10)?,
    })
}

/// Everything needed to record one signer's attestation of a version.
#[derive(Debug, Clone)]
pub struct SignatureRecord {
    pub document_version_id: Uuid,
    pub signer_id: Uuid,
    pub stamp_id: Option<Uuid>,
    pub digest: Option<SignedDigest>,
    pub data: SignatureData,
    pub artifact_key: String,
    pub signed_at: DateTime<Utc>,
}

/// Inserts or overwrites the signer's row for the version in one statement.
///
/// The unique index on (document_version_id, signer_id) arbitrates; the id of
/// the surviving row is returned. A re-sign resets verification state.
pub fn upsert_signature(conn: &Connection, record: &SignatureRecord) -> Result<Uuid, SealError> {
    let (document_hash, signature_hash) = match &record.digest {
        Some(digest) => (Some(digest.hash.as_str()), Some(digest.signature.as_str())),
        None => (None, None),
    };
    let id = conn.query_row(
        "INSERT INTO digital_signatures (id, document_version_id, signer_id, signature_stamp_id,
             document_hash, signature_hash, signature_status, signed_at, verified_at, signature_data, artifact_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10)
         ON CONFLICT (document_version_id, signer_id) DO UPDATE SET
             signature_stamp_id = excluded.signature_stamp_id,
             document_hash = excluded.document_hash,
             signature_hash = excluded.signature_hash,
             signature_status = excluded.signature_status,
             signed_at = excluded.signed_at,
             verified_at = NULL,
             signature_data = excluded.signature_data,
             artifact_key = excluded.artifact_key
         RETURNING id",
        params![
            Uuid::new_v4(),
            record.document_version_id,
            record.signer_id,
            record.stamp_id,
            document_hash,
            signature_hash,
            SignatureStatus::Valid,
            to_millis(record.signed_at),
            record.data,
            record.artifact_key,
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn get_signature(conn: &Connection, id: Uuid) -> Result<Option<DigitalSignature>, SealError> {
    let sql = format!("SELECT {SIGNATURE_COLUMNS} FROM digital_signatures WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], signature_from_row).optional()?)
}

pub fn require_signature(conn: &Connection, id: Uuid) -> Result<DigitalSignature, SealError> {
    get_signature(conn, id)?.ok_or_else(|| SealError::not_found("digital signature", id))
}

pub fn list_for_version(
    conn: &Connection,
    version_id: Uuid,
) -> Result<Vec<DigitalSignature>, SealError> {
    let sql = format!(
        "SELECT {SIGNATURE_COLUMNS} FROM digital_signatures WHERE document_version_id = ?1
         ORDER BY signed_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([version_id], signature_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn delete_for_version(conn: &Connection, version_id: Uuid) -> Result<usize, SealError> {
    Ok(conn.execute(
        "DELETE FROM digital_signatures WHERE document_version_id = ?1",
        [version_id],
    )?)
}

pub fn record_verification(
    conn: &Connection,
    id: Uuid,
    status: SignatureStatus,
    at: DateTime<Utc>,
) -> Result<(), SealError> {
    let updated = conn.execute(
        "UPDATE digital_signatures SET signature_status = ?2, verified_at = ?3 WHERE id = ?1",
        params![id, status, to_millis(at)],
    )?;
    if updated == 0 {
        return Err(SealError::not_found("digital signature", id));
    }
    Ok(())
}
