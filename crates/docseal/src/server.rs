pub mod actor;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::SealError;
use crate::model::{Actor, DigitalSignature, SignatureRequest, SignatureStamp};
use crate::orchestrator::{
    ApplyStamp, NewSignatureRequest, NewStamp, SignEvidence, SignatureService,
    VerificationOutcome,
};

#[derive(Clone)]
pub struct AppState {
    pub service: SignatureService,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(|| async move { (StatusCode::OK, "Ok").into_response() }))
        .route("/public-key", get(public_key))
        .route("/stamps", post(create_stamp).get(list_stamps))
        .route("/stamps/{id}", patch(set_stamp_active).delete(delete_stamp))
        .route(
            "/versions/{id}/signature-requests",
            post(create_signature_request).get(list_signature_requests),
        )
        .route("/versions/{id}/stamp", post(apply_stamp))
        .route("/versions/{id}/signatures", get(list_signatures))
        .route("/signature-requests/expire", post(expire_requests))
        .route("/signature-requests/{id}/sign", post(sign_by_hash))
        .route("/signature-requests/{id}/cancel", post(cancel_request))
        .route("/signature-requests/{id}/revoke", post(revoke_request))
        .route("/signatures/{id}", get(get_signature))
        .route("/signatures/{id}/verify", post(verify_signature))
        .with_state(state)
}

pub async fn run(host: String, port: u16, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    info!(address = %listener.local_addr()?, "Listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serving HTTP")?;

    Ok(())
}

/// Runs the expiration sweep every `period` until the runtime shuts down.
pub fn spawn_expiry_sweeper(service: SignatureService, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = service.sweep_expired(Utc::now()).await {
                error!(error = %e, "Expiration sweep failed");
            }
        }
    })
}

/// PEM of the verification key, for use with the offline verifier.
async fn public_key(State(state): State<AppState>) -> Result<String, SealError> {
    state.service.engine().public_key_pem()
}

#[derive(Debug, Deserialize)]
pub struct CreateStampBody {
    pub name: String,
    pub mime_type: String,
    /// Standard base64 of the PNG or JPEG bytes.
    pub image_base64: String,
}

async fn create_stamp(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<CreateStampBody>,
) -> Result<(StatusCode, Json<SignatureStamp>), SealError> {
    let image = STANDARD
        .decode(body.image_base64.trim())
        .map_err(|e| SealError::Validation(format!("image_base64 is not valid base64: {e}")))?;
    let stamp = state
        .service
        .create_stamp(
            &actor,
            NewStamp {
                name: body.name,
                mime_type: body.mime_type,
                image,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(stamp)))
}

async fn list_stamps(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<Vec<SignatureStamp>>, SealError> {
    Ok(Json(state.service.list_stamps(&actor).await?))
}

#[derive(Debug, Deserialize)]
pub struct StampActivationBody {
    pub is_active: bool,
}

async fn set_stamp_active(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(body): Json<StampActivationBody>,
) -> Result<Json<SignatureStamp>, SealError> {
    Ok(Json(state.service.set_stamp_active(&actor, id, body.is_active).await?))
}

async fn delete_stamp(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, SealError> {
    state.service.delete_stamp(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_signature_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(version_id): Path<Uuid>,
    Json(body): Json<NewSignatureRequest>,
) -> Result<(StatusCode, Json<SignatureRequest>), SealError> {
    let request = state
        .service
        .create_signature_request(&actor, version_id, body)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn list_signature_requests(
    State(state): State<AppState>,
    actor: Actor,
    Path(version_id): Path<Uuid>,
) -> Result<Json<Vec<SignatureRequest>>, SealError> {
    Ok(Json(state.service.list_requests(&actor, version_id).await?))
}

async fn apply_stamp(
    State(state): State<AppState>,
    actor: Actor,
    Path(version_id): Path<Uuid>,
    Json(body): Json<ApplyStamp>,
) -> Result<Json<DigitalSignature>, SealError> {
    Ok(Json(state.service.apply_stamp(&actor, version_id, body).await?))
}

async fn list_signatures(
    State(state): State<AppState>,
    actor: Actor,
    Path(version_id): Path<Uuid>,
) -> Result<Json<Vec<DigitalSignature>>, SealError> {
    Ok(Json(state.service.list_signatures(&actor, version_id).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpiredCount {
    pub expired: usize,
}

async fn expire_requests(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<ExpiredCount>, SealError> {
    let expired = state.service.mark_expired_requests(&actor).await?;
    Ok(Json(ExpiredCount { expired }))
}

async fn sign_by_hash(
    State(state): State<AppState>,
    actor: Actor,
    Path(request_id): Path<Uuid>,
    Json(body): Json<SignEvidence>,
) -> Result<Json<DigitalSignature>, SealError> {
    Ok(Json(state.service.sign_by_hash(&actor, request_id, body).await?))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub reason: String,
}

async fn cancel_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(request_id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> Result<Json<SignatureRequest>, SealError> {
    Ok(Json(state.service.cancel(&actor, request_id, body.reason).await?))
}

async fn revoke_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(request_id): Path<Uuid>,
) -> Result<Json<SignatureRequest>, SealError> {
    Ok(Json(state.service.revoke(&actor, request_id).await?))
}

async fn get_signature(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<DigitalSignature>, SealError> {
    Ok(Json(state.service.get_signature(&actor, id).await?))
}

async fn verify_signature(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<VerificationOutcome>, SealError> {
    Ok(Json(state.service.verify_signature(&actor, id).await?))
}
