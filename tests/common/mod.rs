#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};

use exam_proctoring::dto::backend_dto::{
    ProctoringReport, ProctoringStart, ReportedSession, SessionToken, SubmissionReceipt,
    ViolationAck,
};
use exam_proctoring::error::{Error, MediaAccessError, Result};
use exam_proctoring::models::proctoring_config::{ProctoringConfig, TestDefinition};
use exam_proctoring::models::session::{MediaKind, SubmissionPayload};
use exam_proctoring::models::violation::Violation;
use exam_proctoring::services::backend_client::{ExamBackend, ReportPolicy};
use exam_proctoring::services::media_capture::{MediaDevices, MediaStream, MediaTrack};
use exam_proctoring::services::session_runtime::RuntimeSettings;

mockall::mock! {
    pub Backend {}

    #[async_trait]
    impl ExamBackend for Backend {
        async fn fetch_test_definition(&self, test_id: &str) -> Result<TestDefinition>;
        async fn start_session(&self, test_id: &str) -> Result<SessionToken>;
        async fn start_proctoring(&self, test_id: &str) -> Result<ProctoringStart>;
        async fn submit_session(
            &self,
            token: &SessionToken,
            payload: &SubmissionPayload,
        ) -> Result<SubmissionReceipt>;
        async fn report_violation_event(
            &self,
            proctoring_session_id: &str,
            violation: &Violation,
        ) -> Result<ViolationAck>;
        async fn fetch_proctoring_report(&self, test_id: &str) -> Result<ProctoringReport>;
    }
}

pub fn definition(test_id: &str, config: ProctoringConfig, duration_seconds: u64) -> TestDefinition {
    TestDefinition {
        test_id: test_id.to_string(),
        title: "Physics mock exam".to_string(),
        duration_seconds,
        total_marks: 50,
        config,
    }
}

pub fn proctored(limit: u32) -> ProctoringConfig {
    ProctoringConfig {
        is_proctored: true,
        enable_webcam: true,
        enable_screen_capture: false,
        tab_switch_limit: limit,
        auto_block_on_limit: true,
    }
}

pub fn settings() -> RuntimeSettings {
    RuntimeSettings {
        debounce: chrono::Duration::zero(),
        tick_period: Duration::from_secs(1),
        report_policy: ReportPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        },
        intake_buffer: 64,
    }
}

/// Counters shared with the mocked backend.
#[derive(Clone, Default)]
pub struct Calls {
    starts: Arc<AtomicUsize>,
    reports: Arc<AtomicUsize>,
    payloads: Arc<Mutex<Vec<SubmissionPayload>>>,
}

impl Calls {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<SubmissionPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

/// A backend that accepts everything, except for the first
/// `failing_submits` submissions which answer 503.
pub fn mock_backend(definition: TestDefinition, calls: &Calls, failing_submits: usize) -> MockBackend {
    let mut backend = MockBackend::new();

    backend
        .expect_fetch_test_definition()
        .returning(move |_| Ok(definition.clone()));

    let starts = calls.starts.clone();
    backend.expect_start_session().returning(move |test_id| {
        starts.fetch_add(1, Ordering::SeqCst);
        Ok(SessionToken {
            session_token: format!("token-{}", test_id),
            attempt_id: "attempt-1".to_string(),
        })
    });

    backend.expect_start_proctoring().returning(|_| {
        Ok(ProctoringStart {
            session_id: "proctor-1".to_string(),
            instructions: vec!["Keep your face visible".to_string()],
        })
    });

    let payloads = calls.payloads.clone();
    let failures = Arc::new(AtomicUsize::new(failing_submits));
    backend.expect_submit_session().returning(move |_, payload| {
        payloads.lock().unwrap().push(payload.clone());
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::BackendStatus {
                status: 503,
                body: "maintenance".to_string(),
            });
        }
        Ok(SubmissionReceipt {
            id: "receipt-1".to_string(),
            status: Some("submitted".to_string()),
            score: None,
        })
    });

    let reports = calls.reports.clone();
    backend.expect_report_violation_event().returning(move |_, _| {
        reports.fetch_add(1, Ordering::SeqCst);
        Ok(ViolationAck { success: true })
    });

    backend.expect_fetch_proctoring_report().returning(|_| {
        Ok(ProctoringReport {
            sessions: vec![ReportedSession {
                student_id: "stu-1".to_string(),
                status: Some("BLOCKED".to_string()),
                tab_switch_count: 3,
                violations: Vec::new(),
            }],
        })
    });

    backend
}

pub struct FakeTrack {
    id: String,
    stops: Arc<AtomicUsize>,
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Device double: webcam streams carry two tracks, display streams one.
pub struct FakeDevices {
    pub stops: Arc<AtomicUsize>,
    webcam_error: Option<MediaAccessError>,
    screen_end: Mutex<Option<oneshot::Receiver<()>>>,
    gate: Option<Arc<Notify>>,
}

impl FakeDevices {
    pub fn granted() -> Self {
        Self {
            stops: Arc::new(AtomicUsize::new(0)),
            webcam_error: None,
            screen_end: Mutex::new(None),
            gate: None,
        }
    }

    pub fn denying_webcam() -> Self {
        Self {
            webcam_error: Some(MediaAccessError::PermissionDenied(MediaKind::Webcam)),
            ..Self::granted()
        }
    }

    pub fn with_screen_end(self, ended: oneshot::Receiver<()>) -> Self {
        *self.screen_end.lock().unwrap() = Some(ended);
        self
    }

    /// The webcam prompt stays open until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn stopped_tracks(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn track(&self, id: &str) -> Box<dyn MediaTrack> {
        Box::new(FakeTrack {
            id: id.to_string(),
            stops: self.stops.clone(),
        })
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(&self) -> std::result::Result<MediaStream, MediaAccessError> {
        if let Some(err) = &self.webcam_error {
            return Err(err.clone());
        }
        let stream = MediaStream::new(
            MediaKind::Webcam,
            vec![self.track("camera"), self.track("microphone")],
        );
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(stream)
    }

    async fn get_display_media(&self) -> std::result::Result<MediaStream, MediaAccessError> {
        let mut stream = MediaStream::new(MediaKind::Screen, vec![self.track("display")]);
        if let Some(ended) = self.screen_end.lock().unwrap().take() {
            stream = stream.with_end_signal(ended);
        }
        Ok(stream)
    }
}
