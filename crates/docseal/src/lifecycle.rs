//! Signature request state machine.
//!
//! ```text
//! PENDING ──sign──▶ SIGNED ──revoke──▶ PENDING
//!    │
//!    ├──sweep───▶ EXPIRED
//!    └──cancel──▶ CANCELLED
//! ```
//!
//! Every function here takes the caller's open connection or transaction, so
//! the orchestrator can commit a transition together with the signature row
//! and version update it belongs to.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use crate::db::{requests, signatures, versions};
use crate::error::SealError;
use crate::model::{Actor, RequestStatus, SignatureRequest, SignatureType, VersionStatus};
use crate::policy::{self, Action, Resource};

/// Whether the machine has an edge from `from` to `to`.
pub fn allowed(from: RequestStatus, to: RequestStatus) -> bool {
    use RequestStatus::*;
    matches!(
        (from, to),
        (Pending, Signed) | (Pending, Expired) | (Pending, Cancelled) | (Signed, Pending)
    )
}

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub document_version_id: Uuid,
    pub signature_type: SignatureType,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
    pub approver_id: Option<Uuid>,
}

/// Opens a PENDING request and moves the version to PENDING_APPROVAL.
pub fn create(
    conn: &Connection,
    actor: &Actor,
    new: NewRequest,
    now: DateTime<Utc>,
) -> Result<SignatureRequest, SealError> {
    if new.expires_at <= now {
        return Err(SealError::Validation(format!(
            "expiry {} is not in the future",
            new.expires_at.to_rfc3339()
        )));
    }
    policy::ensure(actor, &Resource::Version, Action::CreateRequest)?;
    versions::require_version(conn, new.document_version_id)?;

    if let Some(latest) = requests::latest_for_version(conn, new.document_version_id)? {
        if latest.status == RequestStatus::Signed {
            return Err(SealError::AlreadySigned(new.document_version_id));
        }
    }

    let request = SignatureRequest {
        id: Uuid::new_v4(),
        document_version_id: new.document_version_id,
        requester_id: actor.user_id,
        approver_id: new.approver_id,
        signature_type: new.signature_type,
        status: RequestStatus::Pending,
        requested_at: now,
        expires_at: new.expires_at,
        signed_at: None,
        reason: new.reason,
        cancel_reason: None,
    };
    requests::insert_request(conn, &request)?;
    versions::set_status(conn, request.document_version_id, VersionStatus::PendingApproval)?;

    info!(
        request_id = %request.id,
        version_id = %request.document_version_id,
        requester_id = %actor.user_id,
        "Signature request created"
    );
    Ok(request)
}

/// PENDING → SIGNED. Anything else is `NotPending`.
pub fn mark_signed(
    conn: &Connection,
    request: &SignatureRequest,
    at: DateTime<Utc>,
) -> Result<(), SealError> {
    if requests::mark_signed(conn, request.id, at)? {
        return Ok(());
    }
    let current = requests::require_request(conn, request.id)?;
    Err(SealError::NotPending {
        id: current.id,
        status: current.status,
    })
}

/// Sweeps every PENDING request whose expiry has passed.
pub fn mark_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize, SealError> {
    let expired = requests::expire_pending(conn, now)?;
    if expired > 0 {
        info!(count = expired, "Expired stale signature requests");
    }
    Ok(expired)
}

pub fn cancel(
    conn: &Connection,
    actor: &Actor,
    request_id: Uuid,
    reason: &str,
) -> Result<SignatureRequest, SealError> {
    let request = requests::require_request(conn, request_id)?;
    policy::ensure(actor, &Resource::Request(&request), Action::Cancel)?;

    if !allowed(request.status, RequestStatus::Cancelled) {
        return Err(not_cancellable(&request));
    }
    if !requests::mark_cancelled(conn, request.id, reason)? {
        // Lost a race with a signer or the sweeper.
        let current = requests::require_request(conn, request.id)?;
        return Err(not_cancellable(&current));
    }

    info!(request_id = %request.id, actor_id = %actor.user_id, "Signature request cancelled");
    requests::require_request(conn, request.id)
}

fn not_cancellable(request: &SignatureRequest) -> SealError {
    match request.status {
        RequestStatus::Signed => SealError::State(format!(
            "signature request {} is signed; revoke it instead",
            request.id
        )),
        status => SealError::NotPending {
            id: request.id,
            status,
        },
    }
}

/// SIGNED → PENDING. Drops every signature on the version and puts it back
/// into PENDING_APPROVAL.
pub fn revoke(
    conn: &Connection,
    actor: &Actor,
    request_id: Uuid,
) -> Result<SignatureRequest, SealError> {
    let request = requests::require_request(conn, request_id)?;
    policy::ensure(actor, &Resource::Request(&request), Action::Revoke)?;

    if !allowed(request.status, RequestStatus::Pending) || !requests::reopen(conn, request.id)? {
        return Err(SealError::State(format!(
            "only signed requests can be revoked; {} is {}",
            request.id, request.status
        )));
    }
    let removed = signatures::delete_for_version(conn, request.document_version_id)?;
    versions::set_status(conn, request.document_version_id, VersionStatus::PendingApproval)?;

    info!(
        request_id = %request.id,
        version_id = %request.document_version_id,
        removed_signatures = removed,
        "Signature request revoked"
    );
    requests::require_request(conn, request.id)
}

/// Drives the version's authoritative request to SIGNED after a signature
/// row was written outside the request workflow.
///
/// A SIGNED request is left alone. A live PENDING one is signed, provided
/// the signer may stamp it. A PENDING one past its expiry is expired first,
/// and then, as for a version with no request or only a closed one, a fresh
/// SIGNED request is recorded on behalf of the signer.
pub fn settle_for_signature(
    conn: &Connection,
    version_id: Uuid,
    signer: &Actor,
    signature_type: SignatureType,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<SignatureRequest, SealError> {
    match requests::latest_for_version(conn, version_id)? {
        Some(latest) if latest.status == RequestStatus::Signed => return Ok(latest),
        Some(latest) if latest.status == RequestStatus::Pending => {
            if !latest.is_expired(now) {
                policy::ensure(signer, &Resource::Request(&latest), Action::ApplyStamp)?;
                mark_signed(conn, &latest, now)?;
                return requests::require_request(conn, latest.id);
            }
            requests::mark_expired(conn, latest.id)?;
            info!(request_id = %latest.id, "Expired stale request before recording signature");
        }
        _ => {}
    }

    let request = SignatureRequest {
        id: Uuid::new_v4(),
        document_version_id: version_id,
        requester_id: signer.user_id,
        approver_id: None,
        signature_type,
        status: RequestStatus::Signed,
        requested_at: now,
        expires_at: now + ttl,
        signed_at: Some(now),
        reason: "Signed on stamp application".into(),
        cancel_reason: None,
    };
    requests::insert_request(conn, &request)?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SignatureDb;
    use crate::db::signatures::{SignatureRecord, upsert_signature};
    use crate::model::{DocumentVersion, Role, SignatureData};

    fn setup() -> (SignatureDb, Uuid) {
        let db = SignatureDb::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        let version = DocumentVersion {
            id,
            document_id: Uuid::new_v4(),
            storage_key: "v.pdf".into(),
            original_storage_key: "v.pdf".into(),
            mime_type: "application/pdf".into(),
            status: VersionStatus::Draft,
        };
        db.with_tx(|tx| versions::insert_version(tx, &version)).unwrap();
        (db, id)
    }

    fn member() -> Actor {
        Actor::new(Uuid::new_v4(), Role::Member)
    }

    fn new_request(version_id: Uuid, expires_at: DateTime<Utc>) -> NewRequest {
        NewRequest {
            document_version_id: version_id,
            signature_type: SignatureType::Digital,
            expires_at,
            reason: "quarterly report".into(),
            approver_id: None,
        }
    }

    fn version_status(db: &SignatureDb, id: Uuid) -> VersionStatus {
        db.with_conn(|conn| versions::require_version(conn, id)).unwrap().status
    }

    #[test]
    fn transition_table() {
        use RequestStatus::*;
        assert!(allowed(Pending, Signed));
        assert!(allowed(Pending, Expired));
        assert!(allowed(Pending, Cancelled));
        assert!(allowed(Signed, Pending));
        assert!(!allowed(Signed, Cancelled));
        assert!(!allowed(Expired, Pending));
        assert!(!allowed(Cancelled, Signed));
        assert!(!allowed(Pending, Pending));
    }

    #[test]
    fn create_requires_future_expiry() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let err = db
            .with_tx(|tx| create(tx, &member(), new_request(version_id, now), now))
            .unwrap_err();
        assert!(matches!(err, SealError::Validation(_)));
    }

    #[test]
    fn create_requires_existing_version() {
        let (db, _) = setup();
        let now = Utc::now();
        let err = db
            .with_tx(|tx| {
                create(tx, &member(), new_request(Uuid::new_v4(), now + Duration::days(1)), now)
            })
            .unwrap_err();
        assert!(matches!(err, SealError::NotFound { .. }));
    }

    #[test]
    fn create_moves_version_to_pending_approval() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let actor = member();
        let request = db
            .with_tx(|tx| create(tx, &actor, new_request(version_id, now + Duration::days(1)), now))
            .unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.requester_id, actor.user_id);
        assert_eq!(version_status(&db, version_id), VersionStatus::PendingApproval);
    }

    #[test]
    fn create_refuses_when_latest_is_signed() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let actor = member();
        let request = db
            .with_tx(|tx| create(tx, &actor, new_request(version_id, now + Duration::days(1)), now))
            .unwrap();
        db.with_tx(|tx| mark_signed(tx, &request, now)).unwrap();

        let err = db
            .with_tx(|tx| create(tx, &actor, new_request(version_id, now + Duration::days(1)), now))
            .unwrap_err();
        assert!(matches!(err, SealError::AlreadySigned(id) if id == version_id));
    }

    #[test]
    fn signing_twice_is_not_pending() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let request = db
            .with_tx(|tx| create(tx, &member(), new_request(version_id, now + Duration::days(1)), now))
            .unwrap();
        db.with_tx(|tx| mark_signed(tx, &request, now)).unwrap();
        let err = db.with_tx(|tx| mark_signed(tx, &request, now)).unwrap_err();
        assert!(matches!(
            err,
            SealError::NotPending {
                status: RequestStatus::Signed,
                ..
            }
        ));
    }

    #[test]
    fn cancel_rules() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let requester = member();
        let request = db
            .with_tx(|tx| create(tx, &requester, new_request(version_id, now + Duration::days(1)), now))
            .unwrap();

        let err = db.with_tx(|tx| cancel(tx, &member(), request.id, "no")).unwrap_err();
        assert!(matches!(err, SealError::PermissionDenied(_)));

        let cancelled = db
            .with_tx(|tx| cancel(tx, &requester, request.id, "superseded"))
            .unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("superseded"));

        let err = db
            .with_tx(|tx| cancel(tx, &requester, request.id, "again"))
            .unwrap_err();
        assert!(matches!(
            err,
            SealError::NotPending {
                status: RequestStatus::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn cancelling_a_signed_request_is_a_state_error() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let requester = member();
        let request = db
            .with_tx(|tx| create(tx, &requester, new_request(version_id, now + Duration::days(1)), now))
            .unwrap();
        db.with_tx(|tx| mark_signed(tx, &request, now)).unwrap();

        let err = db
            .with_tx(|tx| cancel(tx, &requester, request.id, "too late"))
            .unwrap_err();
        assert!(matches!(err, SealError::State(_)));
    }

    #[test]
    fn revoke_reopens_and_drops_signatures() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let requester = member();
        let request = db
            .with_tx(|tx| create(tx, &requester, new_request(version_id, now + Duration::days(1)), now))
            .unwrap();

        let err = db.with_tx(|tx| revoke(tx, &requester, request.id)).unwrap_err();
        assert!(matches!(err, SealError::State(_)));

        db.with_tx(|tx| {
            upsert_signature(
                tx,
                &SignatureRecord {
                    document_version_id: version_id,
                    signer_id: requester.user_id,
                    stamp_id: None,
                    digest: None,
                    data: SignatureData::HashSigned {
                        algorithm: "rsa-pkcs1v15-sha256".into(),
                        timestamp: now,
                        reason: None,
                    },
                    artifact_key: "v.pdf".into(),
                    signed_at: now,
                },
            )?;
            mark_signed(tx, &request, now)?;
            versions::set_status(tx, version_id, VersionStatus::Approved)
        })
        .unwrap();

        let reopened = db.with_tx(|tx| revoke(tx, &requester, request.id)).unwrap();
        assert_eq!(reopened.status, RequestStatus::Pending);
        assert_eq!(reopened.signed_at, None);
        assert_eq!(version_status(&db, version_id), VersionStatus::PendingApproval);
        assert!(
            db.with_conn(|conn| signatures::list_for_version(conn, version_id))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn settle_creates_signed_request_when_none_exists() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let signer = member();
        let settled = db
            .with_tx(|tx| {
                settle_for_signature(tx, version_id, &signer, SignatureType::Digital, Duration::days(30), now)
            })
            .unwrap();
        assert_eq!(settled.status, RequestStatus::Signed);
        assert_eq!(settled.requester_id, signer.user_id);
        assert_eq!(settled.expires_at, now + Duration::days(30));
        assert_eq!(settled.signed_at, Some(now));
    }

    #[test]
    fn settle_signs_live_pending_request() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let requester = member();
        let request = db
            .with_tx(|tx| create(tx, &requester, new_request(version_id, now + Duration::days(1)), now))
            .unwrap();
        let settled = db
            .with_tx(|tx| {
                settle_for_signature(tx, version_id, &requester, SignatureType::Digital, Duration::days(30), now)
            })
            .unwrap();
        assert_eq!(settled.id, request.id);
        assert_eq!(settled.status, RequestStatus::Signed);
    }

    #[test]
    fn settle_expires_stale_pending_request_first() {
        let (db, version_id) = setup();
        let created = Utc::now();
        let requester = member();
        let request = db
            .with_tx(|tx| {
                create(tx, &requester, new_request(version_id, created + Duration::hours(1)), created)
            })
            .unwrap();

        let later = created + Duration::hours(2);
        let settled = db
            .with_tx(|tx| {
                settle_for_signature(tx, version_id, &requester, SignatureType::Electronic, Duration::days(30), later)
            })
            .unwrap();
        assert_ne!(settled.id, request.id);
        assert_eq!(settled.status, RequestStatus::Signed);

        let stale = db.with_conn(|conn| requests::require_request(conn, request.id)).unwrap();
        assert_eq!(stale.status, RequestStatus::Expired);
        assert_eq!(stale.signed_at, None);
    }

    #[test]
    fn settle_leaves_signed_request_alone() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let requester = member();
        let request = db
            .with_tx(|tx| create(tx, &requester, new_request(version_id, now + Duration::days(1)), now))
            .unwrap();
        db.with_tx(|tx| mark_signed(tx, &request, now)).unwrap();

        let settled = db
            .with_tx(|tx| {
                settle_for_signature(tx, version_id, &member(), SignatureType::Digital, Duration::days(30), now)
            })
            .unwrap();
        assert_eq!(settled.id, request.id);
        assert_eq!(
            db.with_conn(|conn| requests::list_for_version(conn, version_id)).unwrap().len(),
            1
        );
    }

    #[test]
    fn settle_refuses_a_stranger_on_a_live_request() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let requester = member();
        let mut new = new_request(version_id, now + Duration::days(1));
        new.approver_id = Some(Uuid::new_v4());
        let request = db.with_tx(|tx| create(tx, &requester, new, now)).unwrap();

        let err = db
            .with_tx(|tx| {
                settle_for_signature(tx, version_id, &member(), SignatureType::Digital, Duration::days(30), now)
            })
            .unwrap_err();
        assert!(matches!(err, SealError::PermissionDenied(_)));

        let untouched = db.with_conn(|conn| requests::require_request(conn, request.id)).unwrap();
        assert_eq!(untouched.status, RequestStatus::Pending);
        assert_eq!(untouched.signed_at, None);
    }

    #[test]
    fn settle_lets_the_approver_sign_a_live_request() {
        let (db, version_id) = setup();
        let now = Utc::now();
        let approver = member();
        let mut new = new_request(version_id, now + Duration::days(1));
        new.approver_id = Some(approver.user_id);
        let request = db.with_tx(|tx| create(tx, &member(), new, now)).unwrap();

        let settled = db
            .with_tx(|tx| {
                settle_for_signature(tx, version_id, &approver, SignatureType::Digital, Duration::days(30), now)
            })
            .unwrap();
        assert_eq!(settled.id, request.id);
        assert_eq!(settled.status, RequestStatus::Signed);
    }
}
