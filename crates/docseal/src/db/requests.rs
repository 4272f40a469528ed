//! Signature request rows. Status changes are conditional updates so that a
//! row only moves when it is still in the state the caller expects.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::{optional_time_column, time_column, to_millis};
use crate::error::SealError;
use crate::model::{RequestStatus, SignatureRequest};

const REQUEST_COLUMNS: &str = "id, document_version_id, requester_id, approver_id, signature_type, \
     status, requested_at, expires_at, signed_at, reason, cancel_reason";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<SignatureRequest> {
    Ok(SignatureRequest {
        id: row.get(0)?,
        document_version_id: row.get(1)?,
        requester_id: row.get(2)?,
        approver_id: row.get(3)?,
        signature_type: row.get(4)?,
        status: row.get(5)?,
        requested_at: time_column(row, 6)?,
        expires_at: time_column(row, 7)?,
        signed_at: optional_time_column(row, 8)?,
        reason: row.get(9)?,
        cancel_reason: row.get(10)?,
    })
}

pub fn insert_request(conn: &Connection, request: &SignatureRequest) -> Result<(), SealError> {
    conn.execute(
        "INSERT INTO signature_requests (id, document_version_id, requester_id, approver_id, signature_type,
             status, requested_at, expires_at, signed_at, reason, cancel_reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            request.id,
            request.document_version_id,
            request.requester_id,
            request.approver_id,
            request.signature_type,
            request.status,
            to_millis(request.requested_at),
            to_millis(request.expires_at),
            request.signed_at.map(to_millis),
            request.reason,
            request.cancel_reason,
        ],
    )?;
    Ok(())
}

pub fn get_request(conn: &Connection, id: Uuid) -> Result<Option<SignatureRequest>, SealError> {
    let sql = format!("SELECT {REQUEST_COLUMNS} FROM signature_requests WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], request_from_row).optional()?)
}

pub fn require_request(conn: &Connection, id: Uuid) -> Result<SignatureRequest, SealError> {
    get_request(conn, id)?.ok_or_else(|| SealError::not_found("signature request", id))
}

/// The most recent request for a version, which callers treat as authoritative.
pub fn latest_for_version(
    conn: &Connection,
    version_id: Uuid,
) -> Result<Option<SignatureRequest>, SealError> {
    let sql = format!(
        "SELECT {REQUEST_COLUMNS} FROM signature_requests WHERE document_version_id = ?1
         ORDER BY requested_at DESC, rowid DESC LIMIT 1"
    );
    Ok(conn.query_row(&sql, [version_id], request_from_row).optional()?)
}

pub fn list_for_version(
    conn: &Connection,
    version_id: Uuid,
) -> Result<Vec<SignatureRequest>, SealError> {
    let sql = format!(
        "SELECT {REQUEST_COLUMNS} FROM signature_requests WHERE document_version_id = ?1
         ORDER BY requested_at DESC, rowid DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([version_id], request_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// PENDING → SIGNED. Returns whether the row moved.
pub fn mark_signed(conn: &Connection, id: Uuid, at: DateTime<Utc>) -> Result<bool, SealError> {
    let updated = conn.execute(
        "UPDATE signature_requests SET status = ?2, signed_at = ?3 WHERE id = ?1 AND status = ?4",
        params![id, RequestStatus::Signed, to_millis(at), RequestStatus::Pending],
    )?;
    Ok(updated == 1)
}

/// PENDING → CANCELLED. Returns whether the row moved.
pub fn mark_cancelled(conn: &Connection, id: Uuid, reason: &str) -> Result<bool, SealError> {
    let updated = conn.execute(
        "UPDATE signature_requests SET status = ?2, cancel_reason = ?3 WHERE id = ?1 AND status = ?4",
        params![id, RequestStatus::Cancelled, reason, RequestStatus::Pending],
    )?;
    Ok(updated == 1)
}

/// SIGNED → PENDING, clearing the signing time. Returns whether the row moved.
pub fn reopen(conn: &Connection, id: Uuid) -> Result<bool, SealError> {
    let updated = conn.execute(
        "UPDATE signature_requests SET status = ?2, signed_at = NULL WHERE id = ?1 AND status = ?3",
        params![id, RequestStatus::Pending, RequestStatus::Signed],
    )?;
    Ok(updated == 1)
}

/// PENDING → EXPIRED for a single row. Returns whether the row moved.
pub fn mark_expired(conn: &Connection, id: Uuid) -> Result<bool, SealError> {
    let updated = conn.execute(
        "UPDATE signature_requests SET status = ?2 WHERE id = ?1 AND status = ?3",
        params![id, RequestStatus::Expired, RequestStatus::Pending],
    )?;
    Ok(updated == 1)
}

/// Bulk PENDING → EXPIRED for every row past its expiry. Idempotent.
pub fn expire_pending(conn: &Connection, now: DateTime<Utc>) -> Result<usize, SealError> {
    let updated = conn.execute(
        "UPDATE signature_requests SET status = ?1 WHERE status = ?2 AND expires_at < ?3",
        params![RequestStatus::Expired, RequestStatus::Pending, to_millis(now)],
    )?;
    Ok(updated)
}
