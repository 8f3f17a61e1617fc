use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};

use exam_proctoring::dto::backend_dto::SessionToken;
use exam_proctoring::error::Error;
use exam_proctoring::models::session::{SessionStatus, SubmissionPayload};
use exam_proctoring::models::violation::{Violation, ViolationType};
use exam_proctoring::services::backend_client::{
    report_violation_with_retry, BackendProvider, ExamBackend, HttpBackendProvider, ReportPolicy,
};

#[derive(Clone, Default)]
struct Stub {
    auth: Arc<Mutex<Vec<String>>>,
    submitted: Arc<Mutex<Option<(String, JsonValue)>>>,
    event_failures: Arc<AtomicUsize>,
    events: Arc<AtomicUsize>,
}

impl Stub {
    fn record_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.auth.lock().unwrap().push(value);
    }
}

async fn mock_test(State(stub): State<Stub>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    stub.record_auth(&headers);
    if id == "missing" {
        return (StatusCode::NOT_FOUND, "no such test").into_response();
    }
    Json(json!({
        "data": {
            "_id": id,
            "title": "Chemistry mock",
            "duration": 45,
            "totalMarks": 30,
            "proctoringSettings": {
                "isProctored": true,
                "enableWebcam": true,
                "enableScreenCapture": true,
                "tabSwitchLimit": 2,
                "autoBlockOnLimit": false
            }
        }
    }))
    .into_response()
}

async fn start(State(stub): State<Stub>, headers: HeaderMap, Path(id): Path<String>) -> Json<JsonValue> {
    stub.record_auth(&headers);
    Json(json!({ "sessionToken": format!("tok-{}", id), "attemptId": "att-9" }))
}

async fn start_proctoring(State(stub): State<Stub>, headers: HeaderMap) -> Json<JsonValue> {
    stub.record_auth(&headers);
    Json(json!({ "data": { "sessionId": "ps-1", "instructions": ["Stay in frame"] } }))
}

async fn submit(
    State(stub): State<Stub>,
    Path(attempt): Path<String>,
    Json(body): Json<JsonValue>,
) -> Json<JsonValue> {
    *stub.submitted.lock().unwrap() = Some((attempt, body));
    Json(json!({ "data": { "_id": "sub-1", "status": "graded", "score": 27.5 } }))
}

async fn events(State(stub): State<Stub>, Path(session): Path<String>) -> Response {
    assert_eq!(session, "ps-1");
    stub.events.fetch_add(1, Ordering::SeqCst);
    if stub
        .event_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(json!({ "success": true })).into_response()
}

async fn report() -> Json<JsonValue> {
    Json(json!({
        "sessions": [
            { "studentId": "s1", "status": "SUBMITTED", "tabSwitchCount": 1 }
        ]
    }))
}

async fn serve(stub: Stub) -> String {
    let api = Router::new()
        .route("/edu/api/mock-tests/:id", get(mock_test))
        .route("/edu/api/mock-tests/:id/start", post(start))
        .route("/edu/api/mock-tests/:id/start-proctoring", post(start_proctoring))
        .route("/edu/api/mock-tests/:id/proctoring-report", get(report))
        .route("/edu/api/mock-test-attempts/:attempt/submit", post(submit))
        .route("/edu/api/proctoring/:session/events", post(events))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api).await.unwrap();
    });
    format!("http://{}/edu/", addr)
}

async fn backend(stub: Stub) -> Arc<dyn ExamBackend> {
    let base = serve(stub).await;
    let provider = HttpBackendProvider::new(&base, Duration::from_secs(5)).unwrap();
    provider.for_caller("student-jwt")
}

#[tokio::test]
async fn test_definition_is_unwrapped_and_converted() {
    let stub = Stub::default();
    let backend = backend(stub.clone()).await;

    let def = backend.fetch_test_definition("chem-1").await.unwrap();
    assert_eq!(def.test_id, "chem-1");
    assert_eq!(def.duration_seconds, 45 * 60);
    assert_eq!(def.total_marks, 30);
    assert!(def.config.is_proctored);
    assert!(def.config.enable_screen_capture);
    assert_eq!(def.config.tab_switch_limit, 2);
    assert!(!def.config.auto_block_on_limit);

    assert_eq!(stub.auth.lock().unwrap().as_slice(), ["Bearer student-jwt"]);
}

#[tokio::test]
async fn non_success_status_is_reported_with_body() {
    let backend = backend(Stub::default()).await;
    match backend.fetch_test_definition("missing").await {
        Err(Error::BackendStatus { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "no such test");
        }
        other => panic!("expected backend status error, got {:?}", other.map(|d| d.test_id)),
    }
}

#[tokio::test]
async fn start_calls_accept_bare_and_wrapped_bodies() {
    let stub = Stub::default();
    let backend = backend(stub.clone()).await;

    let token = backend.start_session("chem-1").await.unwrap();
    assert_eq!(token.session_token, "tok-chem-1");
    assert_eq!(token.attempt_id, "att-9");

    let proctoring = backend.start_proctoring("chem-1").await.unwrap();
    assert_eq!(proctoring.session_id, "ps-1");
    assert_eq!(proctoring.instructions, vec!["Stay in frame".to_string()]);
    assert_eq!(stub.auth.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn submission_carries_token_and_session_report() {
    let stub = Stub::default();
    let backend = backend(stub.clone()).await;

    let token = SessionToken {
        session_token: "tok-chem-1".to_string(),
        attempt_id: "att-9".to_string(),
    };
    let payload = SubmissionPayload {
        test_id: "chem-1".to_string(),
        student_id: "s1".to_string(),
        status: SessionStatus::AutoSubmitted,
        violations: vec![Violation::new(ViolationType::TabSwitch, Utc::now())],
        tab_switch_count: 1,
        start_time: Some(Utc::now()),
        end_time: Utc::now(),
        answers: Some(json!({ "q1": "B" })),
    };

    let receipt = backend.submit_session(&token, &payload).await.unwrap();
    assert_eq!(receipt.id, "sub-1");
    assert_eq!(receipt.score, Some(27.5));

    let (attempt, body) = stub.submitted.lock().unwrap().clone().unwrap();
    assert_eq!(attempt, "att-9");
    assert_eq!(body["sessionToken"], "tok-chem-1");
    assert_eq!(body["status"], "AUTO_SUBMITTED");
    assert_eq!(body["tabSwitchCount"], 1);
    assert_eq!(body["violations"][0]["type"], "TAB_SWITCH");
    assert_eq!(body["answers"]["q1"], "B");
}

#[tokio::test]
async fn report_is_fetched() {
    let backend = backend(Stub::default()).await;
    let report = backend.fetch_proctoring_report("chem-1").await.unwrap();
    assert_eq!(report.sessions.len(), 1);
    assert_eq!(report.sessions[0].student_id, "s1");
    assert_eq!(report.sessions[0].tab_switch_count, 1);
    assert!(report.sessions[0].violations.is_empty());
}

fn fast_policy(max_attempts: u32) -> ReportPolicy {
    ReportPolicy {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn violation_report_retries_until_accepted() {
    let stub = Stub::default();
    stub.event_failures.store(2, Ordering::SeqCst);
    let backend = backend(stub.clone()).await;

    let violation = Violation::new(ViolationType::CopyPaste, Utc::now());
    let delivered = report_violation_with_retry(backend, "ps-1".to_string(), violation, fast_policy(3)).await;
    assert!(delivered);
    assert_eq!(stub.events.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn violation_report_is_dropped_after_last_attempt() {
    let stub = Stub::default();
    stub.event_failures.store(10, Ordering::SeqCst);
    let backend = backend(stub.clone()).await;

    let violation = Violation::new(ViolationType::RightClick, Utc::now());
    let delivered = report_violation_with_retry(backend, "ps-1".to_string(), violation, fast_policy(2)).await;
    assert!(!delivered);
    assert_eq!(stub.events.load(Ordering::SeqCst), 2);
}
