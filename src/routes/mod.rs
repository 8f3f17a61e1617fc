pub mod health;
pub mod monitor;
pub mod session;

use axum::{
    routing::{get, post},
    Router,
};

use crate::middleware::{auth, rate_limit};
use crate::AppState;

pub fn student_router(rps: u32) -> Router<AppState> {
    Router::new()
        .route(
            "/api/exam/tests/:test_id/session",
            axum::routing::delete(session::teardown),
        )
        .route(
            "/api/exam/tests/:test_id/session/start",
            post(session::start_session),
        )
        .route(
            "/api/exam/tests/:test_id/session/signals",
            post(session::signal),
        )
        .route(
            "/api/exam/tests/:test_id/session/answers",
            axum::routing::patch(session::save_answers),
        )
        .route(
            "/api/exam/tests/:test_id/session/heartbeat",
            post(session::heartbeat),
        )
        .route(
            "/api/exam/tests/:test_id/session/submit",
            post(session::submit),
        )
        .route(
            "/api/exam/tests/:test_id/session/submit/retry",
            post(session::retry_submit),
        )
        .route(
            "/api/exam/tests/:test_id/session/status",
            get(session::status),
        )
        .layer(axum::middleware::from_fn_with_state(
            rate_limit::new_rps_state(rps),
            rate_limit::rps_middleware,
        ))
        .layer(axum::middleware::from_fn(auth::require_student))
}

pub fn instructor_router(rps: u32) -> Router<AppState> {
    Router::new()
        .route("/api/monitor/tests/:test_id/roster", get(monitor::roster))
        .route("/api/monitor/tests/:test_id/summary", get(monitor::summary))
        .route(
            "/api/monitor/tests/:test_id/violations",
            get(monitor::violations),
        )
        .route("/api/monitor/tests/:test_id/report", get(monitor::report))
        .route(
            "/api/monitor/tests/:test_id/students/:student_id/warn",
            post(monitor::warn_student),
        )
        .route(
            "/api/monitor/tests/:test_id/students/:student_id/block",
            post(monitor::block_student),
        )
        .layer(axum::middleware::from_fn_with_state(
            rate_limit::new_rps_state(rps),
            rate_limit::rps_middleware,
        ))
        .layer(axum::middleware::from_fn(auth::require_instructor))
}

pub fn app(state: AppState, student_rps: u32, instructor_rps: u32) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .merge(student_router(student_rps))
        .merge(instructor_router(instructor_rps))
        .with_state(state)
}
