//! Signature workflows: stamping, signing by hash, revocation and
//! verification, plus stamp catalogue management.
//!
//! Each workflow does its checks against the database first, then storage
//! I/O, then one transaction for every row it touches. SQLite, PDF work and
//! RSA run on the blocking pool.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::compositor::{self, StampImageFormat};
use crate::db::signatures::SignatureRecord;
use crate::db::{SignatureDb, requests, signatures, stamps, versions};
use crate::error::SealError;
use crate::integrity::{IntegrityEngine, IntegrityReport};
use crate::lifecycle::{self, NewRequest};
use crate::model::{
    Actor, DigitalSignature, DocumentVersion, RequestStatus, SignatureData, SignatureRequest,
    SignatureStamp, SignatureStatus, SignatureType, StampMode, VersionStatus,
};
use crate::policy::{self, Action, Resource};
use crate::storage::ObjectStore;

const PDF_MIME: &str = "application/pdf";

/// Composite passes before a version whose artifact keeps moving is
/// reported as a conflict.
const MAX_STAMP_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Lifetime of requests created implicitly when a stamp is applied.
    pub request_ttl: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            request_ttl: Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStamp {
    pub name: String,
    pub mime_type: String,
    pub image: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSignatureRequest {
    pub signature_type: SignatureType,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub approver_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyStamp {
    pub stamp_id: Uuid,
    pub mode: StampMode,
    #[serde(default)]
    pub reason: Option<String>,
}

/// What the signer attests to when signing by hash.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignEvidence {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    pub is_valid: bool,
    pub status: SignatureStatus,
    pub message: String,
    pub details: Option<IntegrityReport>,
}

/// Everything an apply_stamp pass needs that does not change between passes.
struct StampJob {
    version_id: Uuid,
    stamp: SignatureStamp,
    image: Vec<u8>,
    format: StampImageFormat,
    mode: StampMode,
    reason: Option<String>,
}

enum StampAttempt {
    Landed(DigitalSignature),
    /// The canonical artifact was swapped by someone else; holds its new key.
    Moved(String),
}

#[derive(Clone)]
pub struct SignatureService {
    db: Arc<SignatureDb>,
    storage: Arc<dyn ObjectStore>,
    engine: IntegrityEngine,
    settings: ServiceSettings,
}

async fn blocking<F, T>(f: F) -> Result<T, SealError>
where
    F: FnOnce() -> Result<T, SealError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SealError::Unexpected(eyre::eyre!("blocking task failed: {e}")))?
}

impl SignatureService {
    pub fn new(
        db: Arc<SignatureDb>,
        storage: Arc<dyn ObjectStore>,
        engine: IntegrityEngine,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            db,
            storage,
            engine,
            settings,
        }
    }

    pub fn engine(&self) -> &IntegrityEngine {
        &self.engine
    }

    async fn discard_artifact(&self, key: &str) {
        if let Err(e) = self.storage.delete(key).await {
            warn!(key, error = %e, "Failed to clean up orphaned artifact");
        }
    }

    /// Stores an uploaded PDF and records it as a DRAFT version.
    pub async fn register_version(
        &self,
        document_id: Uuid,
        pdf: Vec<u8>,
    ) -> Result<DocumentVersion, SealError> {
        let id = Uuid::new_v4();
        let key = format!("versions/{id}/original.pdf");
        self.storage.put(pdf, &key, PDF_MIME).await?;

        let version = DocumentVersion {
            id,
            document_id,
            storage_key: key.clone(),
            original_storage_key: key.clone(),
            mime_type: PDF_MIME.into(),
            status: VersionStatus::Draft,
        };
        let db = self.db.clone();
        let row = version.clone();
        if let Err(e) = blocking(move || db.with_tx(|tx| versions::insert_version(tx, &row))).await {
            self.discard_artifact(&key).await;
            return Err(e);
        }
        info!(version_id = %id, %document_id, "Document version registered");
        Ok(version)
    }

    pub async fn get_version(&self, actor: &Actor, id: Uuid) -> Result<DocumentVersion, SealError> {
        policy::ensure(actor, &Resource::Version, Action::Read)?;
        let db = self.db.clone();
        blocking(move || db.with_conn(|conn| versions::require_version(conn, id))).await
    }

    // Stamp catalogue

    pub async fn create_stamp(
        &self,
        actor: &Actor,
        new: NewStamp,
    ) -> Result<SignatureStamp, SealError> {
        policy::ensure(actor, &Resource::Stamps, Action::ManageStamps)?;
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(SealError::Validation("stamp name must not be empty".into()));
        }
        let format = StampImageFormat::from_mime(&new.mime_type)?;

        let image = new.image;
        let image = blocking(move || {
            compositor::decode_stamp(&image, format)
                .map_err(|e| SealError::Validation(format!("unreadable stamp image: {e}")))?;
            Ok(image)
        })
        .await?;

        let db = self.db.clone();
        let lookup = name.clone();
        if blocking(move || db.with_conn(|conn| stamps::find_by_name(conn, &lookup)))
            .await?
            .is_some()
        {
            return Err(SealError::Conflict(format!("a stamp named {name:?} already exists")));
        }

        let id = Uuid::new_v4();
        let stamp = SignatureStamp {
            id,
            name,
            image_ref: format!("stamps/{id}.{}", format.extension()),
            mime_type: format.mime().into(),
            is_active: true,
            created_by: actor.user_id,
            created_at: Utc::now(),
        };
        self.storage.put(image, &stamp.image_ref, format.mime()).await?;

        let db = self.db.clone();
        let row = stamp.clone();
        if let Err(e) = blocking(move || db.with_tx(|tx| stamps::insert_stamp(tx, &row))).await {
            self.discard_artifact(&stamp.image_ref).await;
            return Err(e);
        }
        info!(stamp_id = %stamp.id, name = %stamp.name, "Stamp created");
        Ok(stamp)
    }

    pub async fn list_stamps(&self, actor: &Actor) -> Result<Vec<SignatureStamp>, SealError> {
        policy::ensure(actor, &Resource::Stamps, Action::Read)?;
        let db = self.db.clone();
        blocking(move || db.with_conn(stamps::list_stamps)).await
    }

    pub async fn set_stamp_active(
        &self,
        actor: &Actor,
        id: Uuid,
        active: bool,
    ) -> Result<SignatureStamp, SealError> {
        policy::ensure(actor, &Resource::Stamps, Action::ManageStamps)?;
        let db = self.db.clone();
        let stamp = blocking(move || {
            db.with_tx(|tx| {
                if !stamps::set_active(tx, id, active)? {
                    return Err(SealError::not_found("stamp", id));
                }
                stamps::require_stamp(tx, id)
            })
        })
        .await?;
        info!(stamp_id = %id, active, "Stamp activation changed");
        Ok(stamp)
    }

    /// Hard delete. Refused while any signature still references the stamp.
    pub async fn delete_stamp(&self, actor: &Actor, id: Uuid) -> Result<(), SealError> {
        policy::ensure(actor, &Resource::Stamps, Action::ManageStamps)?;
        let db = self.db.clone();
        let stamp = blocking(move || {
            db.with_tx(|tx| {
                let stamp = stamps::require_stamp(tx, id)?;
                if stamps::is_referenced(tx, id)? {
                    return Err(SealError::Conflict(format!(
                        "stamp {id} is referenced by existing signatures; deactivate it instead"
                    )));
                }
                stamps::delete_stamp(tx, id)?;
                Ok(stamp)
            })
        })
        .await?;

        if let Err(e) = self.storage.delete(&stamp.image_ref).await {
            warn!(stamp_id = %id, key = %stamp.image_ref, error = %e, "Stamp image left behind");
        }
        info!(stamp_id = %id, "Stamp deleted");
        Ok(())
    }

    // Requests

    pub async fn create_signature_request(
        &self,
        actor: &Actor,
        version_id: Uuid,
        new: NewSignatureRequest,
    ) -> Result<SignatureRequest, SealError> {
        let db = self.db.clone();
        let actor = actor.clone();
        let new = NewRequest {
            document_version_id: version_id,
            signature_type: new.signature_type,
            expires_at: new.expires_at,
            reason: new.reason,
            approver_id: new.approver_id,
        };
        blocking(move || db.with_tx(|tx| lifecycle::create(tx, &actor, new, Utc::now()))).await
    }

    pub async fn cancel(
        &self,
        actor: &Actor,
        request_id: Uuid,
        reason: String,
    ) -> Result<SignatureRequest, SealError> {
        let db = self.db.clone();
        let actor = actor.clone();
        blocking(move || db.with_tx(|tx| lifecycle::cancel(tx, &actor, request_id, &reason))).await
    }

    pub async fn revoke(
        &self,
        actor: &Actor,
        request_id: Uuid,
    ) -> Result<SignatureRequest, SealError> {
        let db = self.db.clone();
        let actor = actor.clone();
        blocking(move || db.with_tx(|tx| lifecycle::revoke(tx, &actor, request_id))).await
    }

    /// Administrative sweep of expired PENDING requests.
    pub async fn mark_expired_requests(&self, actor: &Actor) -> Result<usize, SealError> {
        policy::ensure(actor, &Resource::Requests, Action::SweepExpired)?;
        self.sweep_expired(Utc::now()).await
    }

    /// Sweep without a caller, used by the background task.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, SealError> {
        let db = self.db.clone();
        blocking(move || db.with_tx(|tx| lifecycle::mark_expired(tx, now))).await
    }

    pub async fn get_request(
        &self,
        actor: &Actor,
        id: Uuid,
    ) -> Result<SignatureRequest, SealError> {
        policy::ensure(actor, &Resource::Requests, Action::Read)?;
        let db = self.db.clone();
        blocking(move || db.with_conn(|conn| requests::require_request(conn, id))).await
    }

    pub async fn list_requests(
        &self,
        actor: &Actor,
        version_id: Uuid,
    ) -> Result<Vec<SignatureRequest>, SealError> {
        policy::ensure(actor, &Resource::Requests, Action::Read)?;
        let db = self.db.clone();
        blocking(move || {
            db.with_conn(|conn| {
                versions::require_version(conn, version_id)?;
                requests::list_for_version(conn, version_id)
            })
        })
        .await
    }

    // Signing

    /// Composites the stamp onto page 1 of the version's canonical artifact,
    /// optionally hashes and signs the result, and makes it the new canonical
    /// artifact.
    ///
    /// When another signer moves the canonical artifact first, the stamp is
    /// composited again onto theirs, so concurrent signers each keep a row
    /// and the last one to commit owns the canonical artifact.
    pub async fn apply_stamp(
        &self,
        actor: &Actor,
        version_id: Uuid,
        apply: ApplyStamp,
    ) -> Result<DigitalSignature, SealError> {
        let db = self.db.clone();
        let checker = actor.clone();
        let stamp_id = apply.stamp_id;
        let checked_at = Utc::now();
        let (stamp, version) = blocking(move || {
            db.with_conn(|conn| {
                let stamp = stamps::require_stamp(conn, stamp_id)?;
                if !stamp.is_active {
                    return Err(SealError::InactiveStamp(stamp.id));
                }
                let version = versions::require_version(conn, version_id)?;
                match requests::latest_for_version(conn, version_id)? {
                    Some(latest)
                        if latest.status == RequestStatus::Pending
                            && !latest.is_expired(checked_at) =>
                    {
                        policy::ensure(&checker, &Resource::Request(&latest), Action::ApplyStamp)?
                    }
                    _ => policy::ensure(&checker, &Resource::Version, Action::ApplyStamp)?,
                }
                Ok((stamp, version))
            })
        })
        .await?;

        let format = StampImageFormat::from_mime(&stamp.mime_type)?;
        let image = self.storage.get(&stamp.image_ref).await?;
        let job = StampJob {
            version_id,
            stamp,
            image,
            format,
            mode: apply.mode,
            reason: apply.reason,
        };

        let mut canonical = version.storage_key;
        for attempt in 1..=MAX_STAMP_ATTEMPTS {
            match self.land_stamp(actor, &job, &canonical).await? {
                StampAttempt::Landed(signature) => return Ok(signature),
                StampAttempt::Moved(current) => {
                    info!(%version_id, attempt, "Canonical artifact moved, stamping again");
                    canonical = current;
                }
            }
        }
        Err(SealError::Conflict(format!(
            "document version {version_id} kept changing while the stamp was applied"
        )))
    }

    /// One composite-store-commit pass over `canonical`.
    async fn land_stamp(
        &self,
        actor: &Actor,
        job: &StampJob,
        canonical: &str,
    ) -> Result<StampAttempt, SealError> {
        let pdf = self.storage.get(canonical).await?;

        let engine = self.engine.clone();
        let image = job.image.clone();
        let (format, mode) = (job.format, job.mode);
        let (stamped, digest) = blocking(move || {
            let stamped = compositor::composite_stamp(&pdf, &image, format)?;
            let digest = match mode {
                StampMode::HashAndSign => Some(engine.hash_and_sign(&stamped)?),
                StampMode::StampOnly => None,
            };
            Ok((stamped, digest))
        })
        .await?;

        let version_id = job.version_id;
        let artifact_key = format!("versions/{version_id}/stamped-{}.pdf", Uuid::new_v4());
        self.storage.put(stamped, &artifact_key, PDF_MIME).await?;

        let now = Utc::now();
        let record = SignatureRecord {
            document_version_id: version_id,
            signer_id: actor.user_id,
            stamp_id: Some(job.stamp.id),
            data: SignatureData::StampApplied {
                stamp_id: job.stamp.id,
                stamp_name: job.stamp.name.clone(),
                algorithm: digest.as_ref().map(|_| self.engine.algorithm().to_string()),
                timestamp: now,
                reason: job.reason.clone(),
            },
            digest,
            artifact_key: artifact_key.clone(),
            signed_at: now,
        };
        let signature_type = match mode {
            StampMode::HashAndSign => SignatureType::Digital,
            StampMode::StampOnly => SignatureType::Electronic,
        };

        let db = self.db.clone();
        let signer = actor.clone();
        let ttl = self.settings.request_ttl;
        let previous_key = canonical.to_string();
        let new_key = artifact_key.clone();
        let committed = blocking(move || {
            db.with_tx(|tx| {
                if !versions::swap_canonical_artifact(tx, version_id, &previous_key, &new_key)? {
                    let current = versions::require_version(tx, version_id)?;
                    return Ok(StampAttempt::Moved(current.storage_key));
                }
                let id = signatures::upsert_signature(tx, &record)?;
                lifecycle::settle_for_signature(tx, version_id, &signer, signature_type, ttl, now)?;
                versions::set_status(tx, version_id, VersionStatus::Approved)?;
                Ok(StampAttempt::Landed(signatures::require_signature(tx, id)?))
            })
        })
        .await;

        match committed {
            Ok(StampAttempt::Landed(signature)) => {
                info!(
                    signature_id = %signature.id,
                    %version_id,
                    stamp_id = %job.stamp.id,
                    signer_id = %actor.user_id,
                    mode = %mode,
                    artifact = %artifact_key,
                    "Stamp applied"
                );
                Ok(StampAttempt::Landed(signature))
            }
            Ok(moved) => {
                self.discard_artifact(&artifact_key).await;
                Ok(moved)
            }
            Err(e) => {
                self.discard_artifact(&artifact_key).await;
                Err(e)
            }
        }
    }

    /// Hashes and signs the version's canonical artifact on behalf of a
    /// PENDING request's requester, approver or an administrator.
    pub async fn sign_by_hash(
        &self,
        actor: &Actor,
        request_id: Uuid,
        evidence: SignEvidence,
    ) -> Result<DigitalSignature, SealError> {
        let db = self.db.clone();
        let checker = actor.clone();
        let now = Utc::now();
        let (request, version) = blocking(move || {
            db.with_conn(|conn| {
                let request = requests::require_request(conn, request_id)?;
                match request.status {
                    RequestStatus::Pending if request.is_expired(now) => {
                        return Err(SealError::AlreadyExpired(request.id));
                    }
                    RequestStatus::Pending => {}
                    RequestStatus::Expired => return Err(SealError::AlreadyExpired(request.id)),
                    status => {
                        return Err(SealError::NotPending {
                            id: request.id,
                            status,
                        });
                    }
                }
                policy::ensure(&checker, &Resource::Request(&request), Action::Sign)?;
                let version = versions::require_version(conn, request.document_version_id)?;
                Ok((request, version))
            })
        })
        .await?;

        let bytes = self.storage.get(&version.storage_key).await?;
        let engine = self.engine.clone();
        let digest = blocking(move || engine.hash_and_sign(&bytes)).await?;

        let version_id = version.id;
        let record = SignatureRecord {
            document_version_id: version_id,
            signer_id: actor.user_id,
            stamp_id: None,
            digest: Some(digest),
            data: SignatureData::HashSigned {
                algorithm: self.engine.algorithm().to_string(),
                timestamp: now,
                reason: evidence.reason,
            },
            artifact_key: version.storage_key.clone(),
            signed_at: now,
        };

        let db = self.db.clone();
        let signed_key = version.storage_key;
        let signature = blocking(move || {
            db.with_tx(|tx| {
                let current = versions::require_version(tx, version_id)?;
                if current.storage_key != signed_key {
                    return Err(SealError::Conflict(format!(
                        "document version {version_id} changed while it was being signed"
                    )));
                }
                let id = signatures::upsert_signature(tx, &record)?;
                lifecycle::mark_signed(tx, &request, now)?;
                versions::set_status(tx, version_id, VersionStatus::Approved)?;
                signatures::require_signature(tx, id)
            })
        })
        .await?;

        info!(
            signature_id = %signature.id,
            %request_id,
            %version_id,
            signer_id = %actor.user_id,
            "Signed by hash"
        );
        Ok(signature)
    }

    // Verification and read models

    /// Re-hashes the artifact a signature names and checks it against the
    /// recorded hash and signature. Findings are results; storage trouble is
    /// recorded as ERROR rather than returned.
    pub async fn verify_signature(
        &self,
        actor: &Actor,
        signature_id: Uuid,
    ) -> Result<VerificationOutcome, SealError> {
        let signature = self.get_signature(actor, signature_id).await?;

        let (Some(hash), Some(signed)) = (
            signature.document_hash.clone(),
            signature.signature_hash.clone(),
        ) else {
            return Ok(VerificationOutcome {
                is_valid: false,
                status: signature.signature_status,
                message: "Signature carries no cryptographic hash to verify".into(),
                details: None,
            });
        };

        let bytes = match self.storage.get(&signature.artifact_key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%signature_id, key = %signature.artifact_key, error = %e, "Signed artifact unreadable");
                self.record_verification(signature_id, SignatureStatus::Error).await?;
                return Ok(VerificationOutcome {
                    is_valid: false,
                    status: SignatureStatus::Error,
                    message: format!("Could not read signed artifact: {e}"),
                    details: None,
                });
            }
        };

        let engine = self.engine.clone();
        let report = blocking(move || Ok(engine.verify_integrity(&bytes, &hash, &signed))).await?;

        let (status, message) = if report.is_valid {
            (SignatureStatus::Valid, "Signature is valid".to_string())
        } else if !report.hash_match {
            (
                SignatureStatus::Invalid,
                "Document has been modified since signing".to_string(),
            )
        } else {
            (
                SignatureStatus::Invalid,
                "Signature does not match the recorded hash".to_string(),
            )
        };
        if !report.is_valid {
            warn!(
                %signature_id,
                hash_match = report.hash_match,
                signature_valid = report.signature_valid,
                "Signature failed verification"
            );
        }
        self.record_verification(signature_id, status).await?;

        Ok(VerificationOutcome {
            is_valid: report.is_valid,
            status,
            message,
            details: Some(report),
        })
    }

    async fn record_verification(
        &self,
        id: Uuid,
        status: SignatureStatus,
    ) -> Result<(), SealError> {
        let db = self.db.clone();
        blocking(move || {
            db.with_tx(|tx| signatures::record_verification(tx, id, status, Utc::now()))
        })
        .await
    }

    pub async fn get_signature(
        &self,
        actor: &Actor,
        id: Uuid,
    ) -> Result<DigitalSignature, SealError> {
        policy::ensure(actor, &Resource::Version, Action::Read)?;
        let db = self.db.clone();
        blocking(move || db.with_conn(|conn| signatures::require_signature(conn, id))).await
    }

    pub async fn list_signatures(
        &self,
        actor: &Actor,
        version_id: Uuid,
    ) -> Result<Vec<DigitalSignature>, SealError> {
        policy::ensure(actor, &Resource::Version, Action::Read)?;
        let db = self.db.clone();
        blocking(move || {
            db.with_conn(|conn| {
                versions::require_version(conn, version_id)?;
                signatures::list_for_version(conn, version_id)
            })
        })
        .await
    }
}
