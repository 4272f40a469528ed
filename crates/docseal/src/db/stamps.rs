use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::{is_constraint_violation, time_column, to_millis};
use crate::error::SealError;
use crate::model::SignatureStamp;

const STAMP_COLUMNS: &str = "id, name, image_ref, mime_type, is_active, created_by, created_at";

fn stamp_from_row(row: &Row<'_>) -> rusqlite::Result<SignatureStamp> {
    Ok(SignatureStamp {
        id: row.get(0)?,
        name: row.get(1)?,
        image_ref: row.get(2)?,
        mime_type: row.get(3)?,
        is_active: row.get(4)?,
        created_by: row.get(5)?,
        created_at: time_column(row, 6)?,
    })
}

/// Inserts a stamp. A name clash (ignoring case) is a `Conflict`.
pub fn insert_stamp(conn: &Connection, stamp: &SignatureStamp) -> Result<(), SealError> {
    let result = conn.execute(
        "INSERT INTO signature_stamps (id, name, image_ref, mime_type, is_active, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            stamp.id,
            stamp.name,
            stamp.image_ref,
            stamp.mime_type,
            stamp.is_active,
            stamp.created_by,
            to_millis(stamp.created_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => Err(SealError::Conflict(format!(
            "a stamp named {:?} already exists",
            stamp.name
        ))),
        Err(e) => Err(e.into()),
    }
}

pub fn get_stamp(conn: &Connection, id: Uuid) -> Result<Option<SignatureStamp>, SealError> {
    let sql = format!("SELECT {STAMP_COLUMNS} FROM signature_stamps WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], stamp_from_row).optional()?)
}

pub fn require_stamp(conn: &Connection, id: Uuid) -> Result<SignatureStamp, SealError> {
    get_stamp(conn, id)?.ok_or_else(|| SealError::not_found("stamp", id))
}

pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<SignatureStamp>, SealError> {
    let sql = format!("SELECT {STAMP_COLUMNS} FROM signature_stamps WHERE name = ?1");
    Ok(conn.query_row(&sql, [name], stamp_from_row).optional()?)
}

pub fn list_stamps(conn: &Connection) -> Result<Vec<SignatureStamp>, SealError> {
    let sql = format!("SELECT {STAMP_COLUMNS} FROM signature_stamps ORDER BY name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], stamp_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn set_active(conn: &Connection, id: Uuid, active: bool) -> Result<bool, SealError> {
    let updated = conn.execute(
        "UPDATE signature_stamps SET is_active = ?2 WHERE id = ?1",
        params![id, active],
    )?;
    Ok(updated == 1)
}

pub fn is_referenced(conn: &Connection, id: Uuid) -> Result<bool, SealError> {
    let referenced: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM digital_signatures WHERE signature_stamp_id = ?1)",
        [id],
        |row| row.get(0),
    )?;
    Ok(referenced)
}

pub fn delete_stamp(conn: &Connection, id: Uuid) -> Result<bool, SealError> {
    let deleted = conn.execute("DELETE FROM signature_stamps WHERE id = ?1", [id])?;
    Ok(deleted == 1)
}
