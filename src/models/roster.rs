use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::session::{BlockReason, ExamSession, SessionStatus};
use crate::models::violation::Violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RosterStatus {
    NotStarted,
    InProgress,
    Disconnected,
    Blocked,
    Submitted,
    AutoSubmitted,
}

impl From<SessionStatus> for RosterStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::NotStarted => RosterStatus::NotStarted,
            SessionStatus::InProgress => RosterStatus::InProgress,
            SessionStatus::Blocked => RosterStatus::Blocked,
            SessionStatus::Submitted => RosterStatus::Submitted,
            SessionStatus::AutoSubmitted => RosterStatus::AutoSubmitted,
        }
    }
}

/// Instructor-facing row derived from a session snapshot. Not authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub student_id: String,
    pub status: RosterStatus,
    pub session_status: SessionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub time_remaining_seconds: u64,
    pub tab_switch_count: u32,
    pub violation_count: usize,
    pub last_violation: Option<Violation>,
    pub webcam_active: bool,
    pub screen_capture_active: bool,
    pub last_activity: DateTime<Utc>,
    pub block_reason: Option<BlockReason>,
}

impl RosterEntry {
    /// Terminal sessions keep their final status; only live ones go stale.
    pub fn derive(session: &ExamSession, now: DateTime<Utc>, stale_after: Duration) -> Self {
        let stale = now - session.last_activity > stale_after;
        let status = if stale && !session.status.is_terminal() {
            RosterStatus::Disconnected
        } else {
            RosterStatus::from(session.status)
        };

        Self {
            student_id: session.student_id.clone(),
            status,
            session_status: session.status,
            start_time: session.start_time,
            time_remaining_seconds: session.time_remaining_seconds,
            tab_switch_count: session.tab_switch_count,
            violation_count: session.violations.len(),
            last_violation: session.violations.last().cloned(),
            webcam_active: session.webcam_active,
            screen_capture_active: session.screen_capture_active,
            last_activity: session.last_activity,
            block_reason: session.block_reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub student_id: String,
    #[serde(flatten)]
    pub violation: Violation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterSummary {
    pub total: usize,
    pub counts: BTreeMap<RosterStatus, usize>,
    pub total_violations: usize,
}

impl RosterSummary {
    pub fn from_entries(entries: &[RosterEntry]) -> Self {
        let mut summary = RosterSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            *summary.counts.entry(entry.status).or_insert(0) += 1;
            summary.total_violations += entry.violation_count;
        }
        summary
    }

    pub fn count(&self, status: RosterStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}
