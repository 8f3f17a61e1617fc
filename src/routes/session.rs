use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::Utc;
use serde_json::json;
use validator::Validate;

use crate::dto::session_dto::{
    AnswersRequest, SessionResponse, SignalRequest, SignalResponse, StartSessionRequest,
    StartSessionResponse, SubmitRequest,
};
use crate::middleware::auth::{BearerToken, Claims};
use crate::services::media_capture::AttestedMediaDevices;
use crate::AppState;

#[axum::debug_handler]
pub async fn start_session(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Extension(bearer): Extension<BearerToken>,
    Json(req): Json<StartSessionRequest>,
) -> crate::error::Result<Response> {
    tracing::info!(%test_id, student_id = %claims.sub, consent = req.consent, "start requested");
    let backend = state.backend_for(&bearer.0);
    let handle = state.hub.open_session(&test_id, &claims.sub, backend).await?;
    let devices = Arc::new(AttestedMediaDevices::new(req.media));
    let receipt = handle.start(req.consent, devices).await?;
    Ok((StatusCode::OK, Json(StartSessionResponse::from(receipt))).into_response())
}

#[axum::debug_handler]
pub async fn signal(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SignalRequest>,
) -> crate::error::Result<Response> {
    let handle = state.hub.session(&test_id, &claims.sub)?;
    let outcome = handle.signal(req.signal).await?;
    Ok(Json(SignalResponse::from(outcome)).into_response())
}

#[axum::debug_handler]
pub async fn save_answers(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AnswersRequest>,
) -> crate::error::Result<Response> {
    req.validate()?;
    let handle = state.hub.session(&test_id, &claims.sub)?;
    handle.save_answers(req.answers).await?;
    Ok(Json(json!({ "saved": true, "timestamp": Utc::now() })).into_response())
}

#[axum::debug_handler]
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> crate::error::Result<Response> {
    let handle = state.hub.session(&test_id, &claims.sub)?;
    handle.heartbeat().await?;
    Ok(StatusCode::OK.into_response())
}

#[axum::debug_handler]
pub async fn submit(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Extension(claims): Extension<Claims>,
    body: Option<Json<SubmitRequest>>,
) -> crate::error::Result<Response> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    req.validate()?;
    let handle = state.hub.session(&test_id, &claims.sub)?;
    let session = handle.submit(req.answers).await?;
    tracing::info!(%test_id, student_id = %claims.sub, status = %session.status, "submit handled");
    Ok(Json(SessionResponse::from(session)).into_response())
}

#[axum::debug_handler]
pub async fn retry_submit(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> crate::error::Result<Response> {
    let handle = state.hub.session(&test_id, &claims.sub)?;
    let session = handle.retry_submission().await?;
    Ok(Json(SessionResponse::from(session)).into_response())
}

#[axum::debug_handler]
pub async fn status(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> crate::error::Result<Response> {
    let session = state.hub.status(&test_id, &claims.sub)?;
    Ok(Json(SessionResponse::from(session)).into_response())
}

#[axum::debug_handler]
pub async fn teardown(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> crate::error::Result<Response> {
    let handle = state.hub.session(&test_id, &claims.sub)?;
    let session = handle.teardown().await?;
    tracing::info!(%test_id, student_id = %claims.sub, "exam view closed");
    Ok(Json(SessionResponse::from(session)).into_response())
}
