use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::models::session::{ExamSession, SessionStatus, Warning, BLOCKED_MESSAGE};
use crate::models::violation::Violation;
use crate::services::media_capture::MediaGrants;
use crate::services::session_runtime::{SignalOutcome, StartReceipt};
use crate::services::violation_detector::BrowserSignal;

/// Consent is checked against the test's proctoring config by the session,
/// since only proctored tests require it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    #[serde(default)]
    pub consent: bool,
    #[serde(default)]
    pub media: MediaGrants,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalRequest {
    pub signal: BrowserSignal,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AnswersRequest {
    #[validate(custom(function = "validate_answer_sheet"))]
    pub answers: JsonValue,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct SubmitRequest {
    #[serde(default)]
    #[validate(custom(function = "validate_answer_sheet"))]
    pub answers: Option<JsonValue>,
}

/// Answer sheets are JSON objects keyed by question id.
fn validate_answer_sheet(answers: &JsonValue) -> Result<(), validator::ValidationError> {
    if answers.is_object() {
        Ok(())
    } else {
        Err(validator::ValidationError::new("answers_must_be_object"))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session: ExamSession,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl From<ExamSession> for SessionResponse {
    fn from(session: ExamSession) -> Self {
        let message = session.blocked_message();
        Self { session, message }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session: ExamSession,
    pub instructions: Vec<String>,
}

impl From<StartReceipt> for StartSessionResponse {
    fn from(receipt: StartReceipt) -> Self {
        Self {
            session: receipt.session,
            instructions: receipt.instructions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalResponse {
    pub prevent_default: bool,
    pub violation: Option<Violation>,
    pub warnings: Vec<Warning>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl From<SignalOutcome> for SignalResponse {
    fn from(outcome: SignalOutcome) -> Self {
        let message = (outcome.status == SessionStatus::Blocked).then_some(BLOCKED_MESSAGE);
        Self {
            prevent_default: outcome.suppress_default,
            violation: outcome.violation,
            warnings: outcome.warnings,
            status: outcome.status,
            message,
        }
    }
}
