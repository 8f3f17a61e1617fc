//! Authoritative per-student exam session state machine.
//!
//! `NOT_STARTED -> IN_PROGRESS -> {SUBMITTED, AUTO_SUBMITTED, BLOCKED}`.
//! The machine is synchronous and does no I/O: every operation returns the
//! [`Effect`]s the surrounding runtime has to carry out (timers, media,
//! backend calls). Terminal states absorb every later input.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::{Error, MediaAccessError, Result};
use crate::models::proctoring_config::{ProctoringConfig, TestDefinition};
use crate::models::session::{
    BlockReason, ExamSession, MediaKind, SessionStatus, SubmissionPayload, SubmissionState,
    Warning, WarningKind,
};
use crate::models::violation::{Severity, Violation, ViolationType};
use crate::services::session_clock::{ClockTick, SessionClock};

/// Every Nth recorded violation raises a warning dialog.
pub const WARNING_INTERVAL: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartClock,
    StopClock,
    ReleaseMedia,
    Warn(Warning),
    ReportViolation(Violation),
    Submit(SubmissionPayload),
    Blocked(BlockReason),
}

/// Result of the media acquisition attempted during `start`. `None` means
/// the device was not requested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaOutcome {
    pub webcam: Option<std::result::Result<(), MediaAccessError>>,
    pub screen: Option<std::result::Result<(), MediaAccessError>>,
}

impl MediaOutcome {
    pub fn webcam_live(&self) -> bool {
        matches!(self.webcam, Some(Ok(())))
    }

    pub fn screen_live(&self) -> bool {
        matches!(self.screen, Some(Ok(())))
    }
}

#[derive(Debug, Clone)]
pub struct ProctoringSessionMachine {
    test_id: String,
    student_id: String,
    config: ProctoringConfig,
    status: SessionStatus,
    clock: SessionClock,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    violations: Vec<Violation>,
    tab_switch_count: u32,
    webcam_live: bool,
    screen_live: bool,
    fullscreen: bool,
    block_reason: Option<BlockReason>,
    limit_warned: bool,
    warnings: Vec<Warning>,
    last_activity: DateTime<Utc>,
    answers: Option<JsonValue>,
    submission: SubmissionState,
    final_payload: Option<SubmissionPayload>,
}

impl ProctoringSessionMachine {
    pub fn new(definition: &TestDefinition, student_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            test_id: definition.test_id.clone(),
            student_id: student_id.into(),
            config: definition.config.clone(),
            status: SessionStatus::NotStarted,
            clock: SessionClock::new(definition.duration_seconds),
            started_at: None,
            ended_at: None,
            violations: Vec::new(),
            tab_switch_count: 0,
            webcam_live: false,
            screen_live: false,
            fullscreen: false,
            block_reason: None,
            limit_warned: false,
            warnings: Vec::new(),
            last_activity: now,
            answers: None,
            submission: SubmissionState::NotSubmitted,
            final_payload: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn config(&self) -> &ProctoringConfig {
        &self.config
    }

    pub fn tab_switch_count(&self) -> u32 {
        self.tab_switch_count
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn submission(&self) -> &SubmissionState {
        &self.submission
    }

    pub fn is_live(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Webcam => self.webcam_live,
            MediaKind::Screen => self.screen_live,
        }
    }

    /// Validates a start request before any media or backend work happens.
    pub fn check_start(&self, consent: bool) -> Result<()> {
        if self.status != SessionStatus::NotStarted {
            return Err(Error::InvalidTransition {
                from: self.status,
                action: "start",
            });
        }
        if self.config.requires_consent() && !consent {
            return Err(Error::ConsentRequired);
        }
        Ok(())
    }

    /// Decides whether failed acquisitions abort the start. A proctored
    /// test that enables a device cannot run without it; anything else is
    /// downgraded to a warning.
    pub fn evaluate_media(&self, outcome: &MediaOutcome, now: DateTime<Utc>) -> Result<Vec<Warning>> {
        let mut warnings = Vec::new();
        for result in [&outcome.webcam, &outcome.screen].into_iter().flatten() {
            if let Err(err) = result {
                if self.config.is_proctored {
                    return Err(Error::MediaAccess(err.clone()));
                }
                warnings.push(Warning {
                    kind: WarningKind::MediaUnavailable { media: err.kind() },
                    message: format!("{} {}", err, err.guidance()),
                    issued_at: now,
                });
            }
        }
        Ok(warnings)
    }

    pub fn activate(
        &mut self,
        outcome: &MediaOutcome,
        warnings: Vec<Warning>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>> {
        if self.status != SessionStatus::NotStarted {
            return Err(Error::InvalidTransition {
                from: self.status,
                action: "start",
            });
        }
        self.status = SessionStatus::InProgress;
        self.started_at = Some(now);
        self.last_activity = now;
        self.fullscreen = self.config.is_proctored;
        self.webcam_live = outcome.webcam_live();
        self.screen_live = outcome.screen_live();
        self.clock.start();

        let mut effects = vec![Effect::StartClock];
        for warning in warnings {
            effects.push(self.raise(warning));
        }
        Ok(effects)
    }

    pub fn record_violation(&mut self, violation: Violation) -> Vec<Effect> {
        if self.status != SessionStatus::InProgress {
            return Vec::new();
        }
        let now = violation.timestamp;
        self.last_activity = now;
        if violation.violation_type == ViolationType::TabSwitch {
            self.tab_switch_count += 1;
        }
        self.violations.push(violation.clone());

        let mut effects = vec![Effect::ReportViolation(violation)];

        let limit = self.config.tab_switch_limit;
        if self.config.has_tab_switch_limit() && self.tab_switch_count >= limit {
            if self.config.auto_block_on_limit {
                effects.extend(self.block_with(BlockReason::ViolationLimit, now));
                return effects;
            }
            if !self.limit_warned {
                self.limit_warned = true;
                effects.push(self.raise(Warning {
                    kind: WarningKind::TabSwitchLimitReached {
                        tab_switch_count: self.tab_switch_count,
                    },
                    message: format!(
                        "You have switched tabs {} times, reaching the limit for this test. Your instructor has been notified.",
                        self.tab_switch_count
                    ),
                    issued_at: now,
                }));
            }
        }

        let count = self.violations.len();
        if count % WARNING_INTERVAL == 0 {
            effects.push(self.raise(Warning {
                kind: WarningKind::ViolationThreshold {
                    violation_count: count,
                },
                message: format!(
                    "{} integrity violations have been recorded. Further violations may lead to your test being blocked.",
                    count
                ),
                issued_at: now,
            }));
        }
        effects
    }

    /// A live capture stream ended outside our control.
    pub fn record_capture_loss(&mut self, kind: MediaKind, now: DateTime<Utc>) -> Vec<Effect> {
        if self.status != SessionStatus::InProgress || !self.is_live(kind) {
            return Vec::new();
        }
        match kind {
            MediaKind::Webcam => self.webcam_live = false,
            MediaKind::Screen => self.screen_live = false,
        }
        let description = match kind {
            MediaKind::Webcam => "Webcam stream ended during the test",
            MediaKind::Screen => "Screen sharing was stopped during the test",
        };
        let mut effects = vec![self.raise(Warning {
            kind: WarningKind::CaptureLost { media: kind },
            message: format!("Your {} is no longer being shared with the proctor.", kind),
            issued_at: now,
        })];
        effects.extend(self.record_violation(Violation::with_description(
            ViolationType::FullscreenExit,
            now,
            description,
            Severity::High,
        )));
        effects
    }

    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        if self.status == SessionStatus::InProgress {
            self.fullscreen = fullscreen;
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn save_answers(&mut self, answers: JsonValue, now: DateTime<Utc>) -> Result<()> {
        if self.status != SessionStatus::InProgress {
            return Err(Error::InvalidTransition {
                from: self.status,
                action: "save answers",
            });
        }
        self.answers = Some(answers);
        self.touch(now);
        Ok(())
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        if self.status != SessionStatus::InProgress {
            return Vec::new();
        }
        match self.clock.tick() {
            ClockTick::Expired => self.auto_submit(now),
            ClockTick::Running { .. } | ClockTick::Idle => Vec::new(),
        }
    }

    pub fn submit(&mut self, answers: Option<JsonValue>, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        match self.status {
            SessionStatus::InProgress => {
                if answers.is_some() {
                    self.answers = answers;
                }
                Ok(self.finish(SessionStatus::Submitted, now))
            }
            SessionStatus::NotStarted => Err(Error::InvalidTransition {
                from: self.status,
                action: "submit",
            }),
            _ => Ok(Vec::new()),
        }
    }

    pub fn auto_submit(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        if self.status != SessionStatus::InProgress {
            return Vec::new();
        }
        self.finish(SessionStatus::AutoSubmitted, now)
    }

    /// Administrative override. Bypasses the violation count.
    pub fn block(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        if self.status.is_terminal() {
            return Vec::new();
        }
        self.block_with(BlockReason::Administrative, now)
    }

    /// Returns the delivered warning, or `None` when the session is not live.
    pub fn warn(&mut self, message: &str, now: DateTime<Utc>) -> Option<Warning> {
        if self.status != SessionStatus::InProgress {
            return None;
        }
        let warning = Warning {
            kind: WarningKind::Instructor,
            message: message.to_string(),
            issued_at: now,
        };
        self.warnings.push(warning.clone());
        Some(warning)
    }

    pub fn retry_submission(&mut self) -> Result<Vec<Effect>> {
        if matches!(self.submission, SubmissionState::Failed { .. }) {
            if let Some(payload) = self.final_payload.clone() {
                self.submission = SubmissionState::Pending;
                return Ok(vec![Effect::Submit(payload)]);
            }
        }
        match self.submission {
            SubmissionState::Pending | SubmissionState::Accepted { .. } => Ok(Vec::new()),
            _ => Err(Error::InvalidTransition {
                from: self.status,
                action: "retry submission",
            }),
        }
    }

    pub fn settle_submission(&mut self, outcome: std::result::Result<String, String>) {
        if self.submission != SubmissionState::Pending {
            return;
        }
        self.submission = match outcome {
            Ok(receipt_id) => SubmissionState::Accepted { receipt_id },
            Err(error) => SubmissionState::Failed {
                error,
                retryable: true,
            },
        };
    }

    /// The exam view went away. Status is left as is.
    pub fn teardown(&mut self) -> Vec<Effect> {
        self.clock.stop();
        self.webcam_live = false;
        self.screen_live = false;
        self.fullscreen = false;
        vec![Effect::StopClock, Effect::ReleaseMedia]
    }

    pub fn snapshot(&self) -> ExamSession {
        let live = self.status == SessionStatus::InProgress;
        ExamSession {
            test_id: self.test_id.clone(),
            student_id: self.student_id.clone(),
            status: self.status,
            start_time: self.started_at,
            end_time: self.ended_at,
            duration_seconds: self.clock.duration(),
            time_remaining_seconds: self.clock.remaining(),
            tab_switch_count: self.tab_switch_count,
            violations: self.violations.clone(),
            webcam_active: live && self.webcam_live,
            screen_capture_active: live && self.screen_live,
            is_fullscreen: live && self.fullscreen,
            last_activity: self.last_activity,
            block_reason: self.block_reason,
            warnings: self.warnings.clone(),
            submission: self.submission.clone(),
        }
    }

    fn raise(&mut self, warning: Warning) -> Effect {
        self.warnings.push(warning.clone());
        Effect::Warn(warning)
    }

    fn close(&mut self, status: SessionStatus, now: DateTime<Utc>) -> Vec<Effect> {
        self.status = status;
        self.ended_at = Some(now);
        self.last_activity = now;
        self.clock.stop();
        self.webcam_live = false;
        self.screen_live = false;
        self.fullscreen = false;
        vec![Effect::StopClock, Effect::ReleaseMedia]
    }

    fn block_with(&mut self, reason: BlockReason, now: DateTime<Utc>) -> Vec<Effect> {
        self.block_reason = Some(reason);
        let mut effects = self.close(SessionStatus::Blocked, now);
        effects.push(Effect::Blocked(reason));
        effects
    }

    fn finish(&mut self, status: SessionStatus, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = self.close(status, now);
        let payload = SubmissionPayload {
            test_id: self.test_id.clone(),
            student_id: self.student_id.clone(),
            status,
            violations: self.violations.clone(),
            tab_switch_count: self.tab_switch_count,
            start_time: self.started_at,
            end_time: now,
            answers: self.answers.clone(),
        };
        self.final_payload = Some(payload.clone());
        self.submission = SubmissionState::Pending;
        effects.push(Effect::Submit(payload));
        effects
    }
}
