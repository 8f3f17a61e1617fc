use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::proctoring_config::{ProctoringConfig, TestDefinition};
use crate::models::session::SubmissionPayload;

/// Platform responses are either bare or wrapped in `{ "data": ... }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    pub fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub session_token: String,
    pub attempt_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringStart {
    pub session_id: String,
    #[serde(default)]
    pub instructions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockTestResponse {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Minutes.
    pub duration: u64,
    #[serde(default)]
    pub total_marks: u32,
    #[serde(default, alias = "proctoringSettings")]
    pub proctoring: Option<ProctoringConfig>,
}

impl From<MockTestResponse> for TestDefinition {
    fn from(resp: MockTestResponse) -> Self {
        TestDefinition {
            test_id: resp.id,
            title: resp.title,
            duration_seconds: resp.duration * 60,
            total_marks: resp.total_marks,
            config: resp.proctoring.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAttemptBody<'a> {
    pub session_token: &'a str,
    #[serde(flatten)]
    pub payload: &'a SubmissionPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationAck {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedSession {
    pub student_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tab_switch_count: u32,
    #[serde(default)]
    pub violations: Vec<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringReport {
    #[serde(default)]
    pub sessions: Vec<ReportedSession>,
}
