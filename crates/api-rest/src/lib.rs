//! # eRx REST API
//!
//! Thin HTTP layer over the core services:
//! - axum handlers for the auth and prescription endpoints
//! - bearer-token extraction (local verification, no network call)
//! - error-kind to HTTP status mapping
//! - OpenAPI documentation via utoipa
//!
//! All domain decisions live in `erx-core`; this crate only translates
//! between wire DTOs and core types.

pub mod clients;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use erx_core::{
    CredentialGate, Dispensability, MedicationItem, NewPrescription, Prescription,
    PrescriptionService,
};
use erx_token::{TokenPair, TokenService};
use erx_types::{ErrorKind, Identity, ServiceError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

/// Application state shared across REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<CredentialGate>,
    pub prescriptions: Arc<PrescriptionService>,
    pub tokens: Arc<TokenService>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        login,
        refresh,
        logout,
        create_prescription,
        sign_prescription,
        cancel_prescription,
        record_dispense,
        verify_dispensable
    ),
    components(schemas(
        HealthRes,
        LoginReq,
        RefreshReq,
        LogoutReq,
        TokenPairRes,
        CreatePrescriptionReq,
        MedicationItemDto,
        DispenseReq,
        PrescriptionRes,
        DispensabilityRes,
        ErrorRes
    ))
)]
pub struct ApiDoc;

/// Builds the REST router over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/prescriptions", post(create_prescription))
        .route("/prescriptions/:id/sign", post(sign_prescription))
        .route("/prescriptions/:id/cancel", post(cancel_prescription))
        .route("/prescriptions/:id/dispense", post(record_dispense))
        .route("/prescriptions/:id/dispensable", get(verify_dispensable))
        .with_state(state)
}

/// Error body returned for every failure: stable kind + message, nothing
/// internal leaks across the boundary.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorRes {
    pub error: String,
    pub message: String,
}

/// Wire wrapper translating [`ServiceError`] into an HTTP response.
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal details stay in the logs.
        let message = if self.0.kind == ErrorKind::Internal {
            tracing::error!(error = %self.0, "internal error");
            "internal error".to_owned()
        } else {
            self.0.message
        };
        let body = ErrorRes {
            error: self.0.kind.as_str().to_owned(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Verifies the `Authorization: Bearer` header locally and reconstructs the
/// caller identity. Any failure is a uniform 401.
fn bearer_identity(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let unauthorized = || ApiError(ServiceError::unauthorized("missing or invalid bearer token"));

    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;
    let token = value.strip_prefix("Bearer ").ok_or_else(unauthorized)?;
    state
        .tokens
        .verify_access(token)
        .map_err(|_| unauthorized())
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthRes {
    pub status: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginReq {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshReq {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogoutReq {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenPairRes {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
}

impl From<TokenPair> for TokenPairRes {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: pair.token_type,
            expires_in: pair.expires_in,
            scope: pair.scope,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MedicationItemDto {
    pub code: String,
    pub display: String,
    pub dosage: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePrescriptionReq {
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub medications: Vec<MedicationItemDto>,
    pub allowed_dispenses: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<CreatePrescriptionReq> for NewPrescription {
    fn from(req: CreatePrescriptionReq) -> Self {
        Self {
            patient_id: req.patient_id,
            patient_name: req.patient_name,
            medications: req
                .medications
                .into_iter()
                .map(|m| MedicationItem {
                    code: m.code,
                    display: m.display,
                    dosage: m.dosage,
                })
                .collect(),
            allowed_dispenses: req.allowed_dispenses,
            expires_at: req.expires_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DispenseReq {
    /// True when the fulfilment is partial; puts the prescription on hold.
    #[serde(default)]
    pub partial: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PrescriptionRes {
    pub id: String,
    pub prescription_number: String,
    pub status: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub prescriber_license: String,
    pub prescriber_name: Option<String>,
    pub allowed_dispenses: u32,
    pub remaining_dispenses: u32,
    pub signed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<Prescription> for PrescriptionRes {
    fn from(p: Prescription) -> Self {
        Self {
            id: p.id,
            prescription_number: p.prescription_number,
            status: p.status.as_str().to_owned(),
            patient_id: p.patient_id,
            patient_name: p.patient_name,
            prescriber_license: p.prescriber_license.as_str().to_owned(),
            prescriber_name: p.prescriber_name,
            allowed_dispenses: p.allowed_dispenses,
            remaining_dispenses: p.remaining_dispenses,
            signed_at: p.signed_at,
            created_at: p.created_at,
            updated_at: p.updated_at,
            expires_at: p.expires_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DispensabilityRes {
    pub allowed: bool,
    pub reason: Option<String>,
    pub remaining_dispenses: u32,
}

impl From<Dispensability> for DispensabilityRes {
    fn from(d: Dispensability) -> Self {
        Self {
            allowed: d.allowed,
            reason: d.reason,
            remaining_dispenses: d.remaining_dispenses,
        }
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthRes))
)]
async fn health() -> Json<HealthRes> {
    Json(HealthRes {
        status: "ok".to_owned(),
    })
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginReq,
    responses(
        (status = 200, description = "Token pair issued", body = TokenPairRes),
        (status = 401, description = "Bad credentials", body = ErrorRes),
        (status = 403, description = "Credential not verified or not active", body = ErrorRes),
        (status = 503, description = "Identity provider or registry unreachable", body = ErrorRes)
    )
)]
async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<Json<TokenPairRes>, ApiError> {
    let pair = state.gate.login(&req.username, &req.password).await?;
    Ok(Json(pair.into()))
}

#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshReq,
    responses(
        (status = 200, description = "Fresh token pair issued", body = TokenPairRes),
        (status = 401, description = "Invalid refresh token", body = ErrorRes),
        (status = 403, description = "Credential no longer active", body = ErrorRes)
    )
)]
async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshReq>,
) -> Result<Json<TokenPairRes>, ApiError> {
    let pair = state.gate.refresh(&req.refresh_token).await?;
    Ok(Json(pair.into()))
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutReq,
    responses((status = 204, description = "Logged out (best effort)"))
)]
async fn logout(State(state): State<AppState>, Json(req): Json<LogoutReq>) -> StatusCode {
    state.gate.logout(&req.refresh_token).await;
    StatusCode::NO_CONTENT
}

#[utoipa::path(
    post,
    path = "/prescriptions",
    request_body = CreatePrescriptionReq,
    responses(
        (status = 201, description = "Prescription created as draft", body = PrescriptionRes),
        (status = 400, description = "Invalid request", body = ErrorRes),
        (status = 401, description = "Missing or invalid token", body = ErrorRes),
        (status = 403, description = "Insufficient scope or no license", body = ErrorRes)
    )
)]
async fn create_prescription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreatePrescriptionReq>,
) -> Result<(StatusCode, Json<PrescriptionRes>), ApiError> {
    let identity = bearer_identity(&state, &headers)?;
    let prescription = state.prescriptions.create(&identity, req.into()).await?;
    Ok((StatusCode::CREATED, Json(prescription.into())))
}

#[utoipa::path(
    post,
    path = "/prescriptions/{id}/sign",
    params(("id" = String, Path, description = "Prescription id")),
    responses(
        (status = 200, description = "Prescription signed and active", body = PrescriptionRes),
        (status = 403, description = "Not the prescriber, or credential inactive", body = ErrorRes),
        (status = 404, description = "Unknown prescription", body = ErrorRes),
        (status = 409, description = "Not in a signable state", body = ErrorRes)
    )
)]
async fn sign_prescription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<PrescriptionRes>, ApiError> {
    let identity = bearer_identity(&state, &headers)?;
    let prescription = state.prescriptions.sign(&identity, &id).await?;
    Ok(Json(prescription.into()))
}

#[utoipa::path(
    post,
    path = "/prescriptions/{id}/cancel",
    params(("id" = String, Path, description = "Prescription id")),
    responses(
        (status = 200, description = "Prescription cancelled", body = PrescriptionRes),
        (status = 403, description = "Not the prescriber", body = ErrorRes),
        (status = 404, description = "Unknown prescription", body = ErrorRes),
        (status = 409, description = "Not in a cancellable state", body = ErrorRes)
    )
)]
async fn cancel_prescription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<PrescriptionRes>, ApiError> {
    let identity = bearer_identity(&state, &headers)?;
    let prescription = state.prescriptions.cancel(&identity, &id).await?;
    Ok(Json(prescription.into()))
}

#[utoipa::path(
    post,
    path = "/prescriptions/{id}/dispense",
    params(("id" = String, Path, description = "Prescription id")),
    request_body = DispenseReq,
    responses(
        (status = 200, description = "Dispense recorded", body = PrescriptionRes),
        (status = 404, description = "Unknown prescription", body = ErrorRes),
        (status = 409, description = "Exhausted, expired or wrong state", body = ErrorRes)
    )
)]
async fn record_dispense(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<DispenseReq>,
) -> Result<Json<PrescriptionRes>, ApiError> {
    let identity = bearer_identity(&state, &headers)?;
    let prescription = state
        .prescriptions
        .record_dispense(&identity, &id, req.partial)
        .await?;
    Ok(Json(prescription.into()))
}

#[utoipa::path(
    get,
    path = "/prescriptions/{id}/dispensable",
    params(("id" = String, Path, description = "Prescription id")),
    responses(
        (status = 200, description = "Dispensability verdict", body = DispensabilityRes),
        (status = 404, description = "Unknown prescription", body = ErrorRes)
    )
)]
async fn verify_dispensable(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DispensabilityRes>, ApiError> {
    let identity = bearer_identity(&state, &headers)?;
    let report = state.prescriptions.verify_dispensable(&identity, &id).await?;
    Ok(Json(report.into()))
}
