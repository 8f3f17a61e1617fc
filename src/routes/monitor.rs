use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::Utc;
use validator::Validate;

use crate::dto::monitor_dto::{FeedQuery, FeedResponse, RosterResponse, SummaryResponse, WarnRequest};
use crate::dto::session_dto::SessionResponse;
use crate::middleware::auth::{BearerToken, Claims};
use crate::AppState;

#[axum::debug_handler]
pub async fn roster(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> crate::error::Result<Response> {
    let now = Utc::now();
    let students = state.hub.roster(&test_id, now);
    Ok(Json(RosterResponse {
        test_id,
        generated_at: now,
        students,
    })
    .into_response())
}

#[axum::debug_handler]
pub async fn summary(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> crate::error::Result<Response> {
    let summary = state.hub.summary(&test_id, Utc::now());
    Ok(Json(SummaryResponse { test_id, summary }).into_response())
}

#[axum::debug_handler]
pub async fn violations(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> crate::error::Result<Response> {
    query.validate()?;
    let violations = state.hub.violation_feed(&test_id, query.limit());
    Ok(Json(FeedResponse { test_id, violations }).into_response())
}

#[axum::debug_handler]
pub async fn report(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    Extension(bearer): Extension<BearerToken>,
) -> crate::error::Result<Response> {
    let backend = state.backend_for(&bearer.0);
    let report = state.hub.proctoring_report(&test_id, backend).await?;
    Ok(Json(report).into_response())
}

#[axum::debug_handler]
pub async fn warn_student(
    State(state): State<AppState>,
    Path((test_id, student_id)): Path<(String, String)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<WarnRequest>,
) -> crate::error::Result<Response> {
    req.validate()?;
    let warning = state.hub.warn(&test_id, &student_id, &req.message).await?;
    tracing::info!(%test_id, %student_id, instructor = %claims.sub, "student warned");
    Ok(Json(warning).into_response())
}

#[axum::debug_handler]
pub async fn block_student(
    State(state): State<AppState>,
    Path((test_id, student_id)): Path<(String, String)>,
    Extension(claims): Extension<Claims>,
) -> crate::error::Result<Response> {
    let session = state.hub.block(&test_id, &student_id).await?;
    tracing::warn!(%test_id, %student_id, instructor = %claims.sub, "student blocked by instructor");
    Ok(Json(SessionResponse::from(session)).into_response())
}
