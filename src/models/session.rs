use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::violation::Violation;

pub const BLOCKED_MESSAGE: &str =
    "Your access to this test has been blocked. Please contact your instructor.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    NotStarted,
    InProgress,
    Blocked,
    Submitted,
    AutoSubmitted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Blocked | SessionStatus::Submitted | SessionStatus::AutoSubmitted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::NotStarted => "NOT_STARTED",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Blocked => "BLOCKED",
            SessionStatus::Submitted => "SUBMITTED",
            SessionStatus::AutoSubmitted => "AUTO_SUBMITTED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    ViolationLimit,
    Administrative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaKind {
    Webcam,
    Screen,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Webcam => f.write_str("webcam"),
            MediaKind::Screen => f.write_str("screen capture"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    ViolationThreshold { violation_count: usize },
    TabSwitchLimitReached { tab_switch_count: u32 },
    Instructor,
    MediaUnavailable { media: MediaKind },
    CaptureLost { media: MediaKind },
}

/// A non-blocking notice the exam client shows as a dialog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    #[serde(flatten)]
    pub kind: WarningKind,
    pub message: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionState {
    NotSubmitted,
    Pending,
    Accepted { receipt_id: String },
    Failed { error: String, retryable: bool },
}

/// The final report sent to the backend. Kept until it is acknowledged so
/// a retry resends exactly the same content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionPayload {
    pub test_id: String,
    pub student_id: String,
    pub status: SessionStatus,
    pub violations: Vec<Violation>,
    pub tab_switch_count: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers: Option<JsonValue>,
}

/// Published, read-only view of one student's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSession {
    pub test_id: String,
    pub student_id: String,
    pub status: SessionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub time_remaining_seconds: u64,
    pub tab_switch_count: u32,
    pub violations: Vec<Violation>,
    pub webcam_active: bool,
    pub screen_capture_active: bool,
    pub is_fullscreen: bool,
    pub last_activity: DateTime<Utc>,
    pub block_reason: Option<BlockReason>,
    pub warnings: Vec<Warning>,
    pub submission: SubmissionState,
}

impl ExamSession {
    pub fn blocked_message(&self) -> Option<&'static str> {
        (self.status == SessionStatus::Blocked).then_some(BLOCKED_MESSAGE)
    }
}
