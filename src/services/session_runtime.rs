//! One tokio task per student session. Every input (browser signals, clock
//! ticks, media and backend results, instructor actions) goes through the
//! session's single intake, so transitions are applied strictly in order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dto::backend_dto::{ProctoringStart, SessionToken};
use crate::error::{Error, Result};
use crate::models::proctoring_config::TestDefinition;
use crate::models::session::{ExamSession, MediaKind, SessionStatus, SubmissionState, Warning};
use crate::models::violation::Violation;
use crate::services::backend_client::{report_violation_with_retry, ExamBackend, ReportPolicy};
use crate::services::media_capture::{MediaCaptureManager, MediaDevices};
use crate::services::session_clock::ClockDriver;
use crate::services::session_machine::{Effect, MediaOutcome, ProctoringSessionMachine};
use crate::services::violation_detector::{
    BrowserSignal, DetectorContext, EventSource, ViolationDetector,
};

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub debounce: chrono::Duration,
    pub tick_period: Duration,
    pub report_policy: ReportPolicy,
    pub intake_buffer: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            debounce: chrono::Duration::milliseconds(500),
            tick_period: Duration::from_secs(1),
            report_policy: ReportPolicy::default(),
            intake_buffer: 64,
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: chrono::Duration::milliseconds(config.detector_debounce_ms),
            report_policy: ReportPolicy {
                max_attempts: config.violation_report_attempts,
                ..ReportPolicy::default()
            },
            ..Self::default()
        }
    }
}

/// What the exam client needs back after forwarding one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalOutcome {
    pub suppress_default: bool,
    pub violation: Option<Violation>,
    pub warnings: Vec<Warning>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone)]
pub struct StartReceipt {
    pub session: ExamSession,
    pub instructions: Vec<String>,
}

struct BackendSession {
    token: SessionToken,
    proctoring: Option<ProctoringStart>,
}

enum SessionEvent {
    Start {
        consent: bool,
        devices: Arc<dyn MediaDevices>,
        reply: oneshot::Sender<Result<StartReceipt>>,
    },
    MediaAcquired {
        generation: u64,
        media: MediaCaptureManager,
        outcome: MediaOutcome,
    },
    BackendStarted {
        generation: u64,
        result: Result<BackendSession>,
    },
    Signal {
        signal: BrowserSignal,
        reply: Option<oneshot::Sender<SignalOutcome>>,
    },
    CaptureEnded {
        kind: MediaKind,
    },
    Tick,
    SaveAnswers {
        answers: JsonValue,
        reply: oneshot::Sender<Result<()>>,
    },
    Heartbeat,
    Submit {
        answers: Option<JsonValue>,
        reply: oneshot::Sender<Result<ExamSession>>,
    },
    RetrySubmit {
        reply: oneshot::Sender<Result<ExamSession>>,
    },
    SubmissionSettled {
        result: std::result::Result<String, String>,
    },
    Warn {
        message: String,
        reply: oneshot::Sender<Option<Warning>>,
    },
    Block {
        reply: oneshot::Sender<ExamSession>,
    },
    Teardown {
        reply: oneshot::Sender<ExamSession>,
    },
}

struct PreparedMedia {
    media: MediaCaptureManager,
    outcome: MediaOutcome,
    warnings: Vec<Warning>,
}

struct PendingStart {
    generation: u64,
    reply: oneshot::Sender<Result<StartReceipt>>,
    cancel: CancellationToken,
    media: Option<PreparedMedia>,
}

impl PendingStart {
    fn abandon(self, err: Error) {
        self.cancel.cancel();
        let _ = self.reply.send(Err(err));
    }
}

pub struct SessionRuntime {
    machine: ProctoringSessionMachine,
    detector: ViolationDetector,
    backend: Arc<dyn ExamBackend>,
    settings: RuntimeSettings,
    intake: mpsc::WeakSender<SessionEvent>,
    state: watch::Sender<ExamSession>,
    cancel: CancellationToken,
    generation: u64,
    pending: Option<PendingStart>,
    media: Option<MediaCaptureManager>,
    media_watchers: CancellationToken,
    clock: Option<ClockDriver>,
    token: Option<SessionToken>,
    proctoring_session: Option<String>,
    submit_waiters: Vec<oneshot::Sender<Result<ExamSession>>>,
}

impl SessionRuntime {
    /// Spawns the session task and returns the handle that feeds it.
    pub fn spawn(
        definition: &TestDefinition,
        student_id: &str,
        backend: Arc<dyn ExamBackend>,
        settings: RuntimeSettings,
    ) -> SessionHandle {
        let (runtime, handle, rx) = Self::build(definition, student_id, backend, settings);
        tokio::spawn(runtime.run(rx));
        handle
    }

    fn build(
        definition: &TestDefinition,
        student_id: &str,
        backend: Arc<dyn ExamBackend>,
        settings: RuntimeSettings,
    ) -> (Self, SessionHandle, mpsc::Receiver<SessionEvent>) {
        let machine = ProctoringSessionMachine::new(definition, student_id, Utc::now());
        let (tx, rx) = mpsc::channel(settings.intake_buffer.max(1));
        let (state, state_rx) = watch::channel(machine.snapshot());
        let cancel = CancellationToken::new();

        let runtime = SessionRuntime {
            detector: ViolationDetector::new(settings.debounce),
            machine,
            backend,
            settings,
            intake: tx.downgrade(),
            state,
            media_watchers: cancel.child_token(),
            cancel: cancel.clone(),
            generation: 0,
            pending: None,
            media: None,
            clock: None,
            token: None,
            proctoring_session: None,
            submit_waiters: Vec::new(),
        };
        let handle = SessionHandle {
            tx,
            state: state_rx,
            cancel,
        };
        (runtime, handle, rx)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionEvent>) {
        let snapshot = self.machine.snapshot();
        tracing::info!(test_id = %snapshot.test_id, student_id = %snapshot.student_id, "session runtime started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
            self.publish();
        }
        self.shutdown();
        self.cancel.cancel();
        tracing::info!(test_id = %snapshot.test_id, student_id = %snapshot.student_id, "session runtime stopped");
    }

    fn handle(&mut self, event: SessionEvent) {
        let now = Utc::now();
        match event {
            SessionEvent::Start {
                consent,
                devices,
                reply,
            } => self.begin_start(consent, devices, reply),
            SessionEvent::MediaAcquired {
                generation,
                media,
                outcome,
            } => self.on_media_acquired(generation, media, outcome),
            SessionEvent::BackendStarted { generation, result } => {
                self.on_backend_started(generation, result)
            }
            SessionEvent::Signal { signal, reply } => {
                let outcome = self.on_signal(&signal);
                if let Some(reply) = reply {
                    self.publish();
                    let _ = reply.send(outcome);
                }
            }
            SessionEvent::CaptureEnded { kind } => {
                tracing::warn!(%kind, "capture stream ended by the user");
                if let Some(media) = self.media.as_mut() {
                    media.release(kind);
                }
                let effects = self.machine.record_capture_loss(kind, now);
                self.apply(effects);
            }
            SessionEvent::Tick => {
                let ctx = DetectorContext {
                    status: self.machine.status(),
                    is_proctored: self.machine.config().is_proctored,
                };
                let mut effects = Vec::new();
                if let Some(violation) = self.detector.flush(ctx, now) {
                    tracing::info!(kind = ?violation.violation_type, "violation detected");
                    effects.extend(self.machine.record_violation(violation));
                }
                effects.extend(self.machine.tick(now));
                self.apply(effects);
            }
            SessionEvent::SaveAnswers { answers, reply } => {
                let _ = reply.send(self.machine.save_answers(answers, now));
            }
            SessionEvent::Heartbeat => self.machine.touch(now),
            SessionEvent::Submit { answers, reply } => match self.machine.submit(answers, now) {
                Ok(effects) => {
                    self.apply(effects);
                    self.answer_submit(reply);
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            SessionEvent::RetrySubmit { reply } => match self.machine.retry_submission() {
                Ok(effects) => {
                    tracing::info!("retrying final submission");
                    self.apply(effects);
                    self.answer_submit(reply);
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            SessionEvent::SubmissionSettled { result } => {
                self.machine.settle_submission(result);
                self.publish();
                let waiters = std::mem::take(&mut self.submit_waiters);
                for waiter in waiters {
                    let _ = waiter.send(self.submission_result());
                }
            }
            SessionEvent::Warn { message, reply } => {
                let warning = self.machine.warn(&message, now);
                if warning.is_some() {
                    tracing::info!("instructor warning delivered");
                }
                self.publish();
                let _ = reply.send(warning);
            }
            SessionEvent::Block { reply } => {
                let effects = self.machine.block(now);
                self.apply(effects);
                if let Some(pending) = self.pending.take() {
                    pending.abandon(Error::SessionClosed);
                }
                self.publish();
                let _ = reply.send(self.machine.snapshot());
            }
            SessionEvent::Teardown { reply } => {
                self.shutdown();
                self.cancel.cancel();
                let _ = reply.send(self.machine.snapshot());
            }
        }
    }

    fn begin_start(
        &mut self,
        consent: bool,
        devices: Arc<dyn MediaDevices>,
        reply: oneshot::Sender<Result<StartReceipt>>,
    ) {
        if self.pending.is_some() {
            let _ = reply.send(Err(Error::StartInProgress));
            return;
        }
        if let Err(err) = self.machine.check_start(consent) {
            let _ = reply.send(Err(err));
            return;
        }
        let Some(intake) = self.intake.upgrade() else {
            let _ = reply.send(Err(Error::SessionClosed));
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let cancel = self.cancel.child_token();
        let config = self.machine.config().clone();
        self.pending = Some(PendingStart {
            generation,
            reply,
            cancel: cancel.clone(),
            media: None,
        });

        tracing::info!(generation, "acquiring media for session start");
        tokio::spawn(async move {
            let mut media = MediaCaptureManager::new(devices);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(generation, "media acquisition cancelled");
                    return;
                }
                outcome = media.acquire(config.enable_webcam, config.enable_screen_capture) => outcome,
            };
            let event = SessionEvent::MediaAcquired {
                generation,
                media,
                outcome,
            };
            if intake.send(event).await.is_err() {
                tracing::debug!(generation, "session gone, releasing acquired media");
            }
        });
    }

    fn on_media_acquired(&mut self, generation: u64, media: MediaCaptureManager, outcome: MediaOutcome) {
        let Some(mut pending) = self.take_pending(generation) else {
            tracing::info!(generation, "discarding media acquired for a stale start");
            return;
        };
        let warnings = match self.machine.evaluate_media(&outcome, Utc::now()) {
            Ok(warnings) => warnings,
            Err(err) => {
                tracing::warn!(error = %err, "session start aborted by media failure");
                drop(media);
                pending.abandon(err);
                return;
            }
        };
        let Some(intake) = self.intake.upgrade() else {
            pending.abandon(Error::SessionClosed);
            return;
        };

        pending.media = Some(PreparedMedia {
            media,
            outcome,
            warnings,
        });
        let cancel = pending.cancel.clone();
        self.pending = Some(pending);

        let backend = self.backend.clone();
        let test_id = self.machine.snapshot().test_id;
        let proctored = self.machine.config().is_proctored;
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = open_backend_session(backend, &test_id, proctored) => result,
            };
            let _ = intake
                .send(SessionEvent::BackendStarted { generation, result })
                .await;
        });
    }

    fn on_backend_started(&mut self, generation: u64, result: Result<BackendSession>) {
        let Some(pending) = self.take_pending(generation) else {
            tracing::info!(generation, "discarding backend session for a stale start");
            return;
        };
        let session = match result {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(error = %err, "backend refused to start the session");
                pending.abandon(err);
                return;
            }
        };
        let PendingStart { reply, media, .. } = pending;
        let Some(prepared) = media else {
            let _ = reply.send(Err(Error::Internal(
                "session start completed without media".to_string(),
            )));
            return;
        };

        match self
            .machine
            .activate(&prepared.outcome, prepared.warnings, Utc::now())
        {
            Ok(effects) => {
                let instructions = session
                    .proctoring
                    .as_ref()
                    .map(|p| p.instructions.clone())
                    .unwrap_or_default();
                self.token = Some(session.token);
                self.proctoring_session = session.proctoring.map(|p| p.session_id);
                self.media = Some(prepared.media);
                self.watch_media_end();
                self.apply(effects);
                tracing::info!(
                    webcam = prepared.outcome.webcam_live(),
                    screen = prepared.outcome.screen_live(),
                    "session started"
                );
                self.publish();
                let _ = reply.send(Ok(StartReceipt {
                    session: self.machine.snapshot(),
                    instructions,
                }));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn take_pending(&mut self, generation: u64) -> Option<PendingStart> {
        match &self.pending {
            Some(pending) if pending.generation == generation => self.pending.take(),
            _ => None,
        }
    }

    fn on_signal(&mut self, signal: &BrowserSignal) -> SignalOutcome {
        let now = Utc::now();
        let ctx = DetectorContext {
            status: self.machine.status(),
            is_proctored: self.machine.config().is_proctored,
        };
        self.machine.touch(now);
        let detection = self.detector.observe(signal, ctx, now);

        let mut effects = Vec::new();
        if let Some(fullscreen) = detection.fullscreen {
            self.machine.set_fullscreen(fullscreen);
        }
        if let Some(kind) = detection.capture_lost {
            if let Some(media) = self.media.as_mut() {
                media.release(kind);
            }
            effects.extend(self.machine.record_capture_loss(kind, now));
        }
        if let Some(violation) = detection.violation.clone() {
            tracing::info!(kind = ?violation.violation_type, "violation detected");
            effects.extend(self.machine.record_violation(violation));
        }
        let warnings = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Warn(warning) => Some(warning.clone()),
                _ => None,
            })
            .collect();
        self.apply(effects);

        SignalOutcome {
            suppress_default: detection.suppress_default,
            violation: detection.violation,
            warnings,
            status: self.machine.status(),
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartClock => {
                    self.clock = Some(ClockDriver::spawn(
                        self.intake.clone(),
                        || SessionEvent::Tick,
                        self.settings.tick_period,
                        self.cancel.child_token(),
                    ));
                }
                Effect::StopClock => {
                    if let Some(clock) = self.clock.take() {
                        clock.stop();
                    }
                }
                Effect::ReleaseMedia => {
                    self.media_watchers.cancel();
                    if let Some(mut media) = self.media.take() {
                        media.release_all();
                    }
                }
                Effect::Warn(warning) => {
                    tracing::info!(kind = ?warning.kind, "warning raised");
                }
                Effect::ReportViolation(violation) => self.report(violation),
                Effect::Submit(payload) => {
                    let backend = self.backend.clone();
                    let token = self.token.clone();
                    let intake = self.intake.upgrade();
                    tracing::info!(status = %payload.status, violations = payload.violations.len(), "submitting session");
                    tokio::spawn(async move {
                        let result = match token {
                            Some(token) => backend
                                .submit_session(&token, &payload)
                                .await
                                .map(|receipt| receipt.id)
                                .map_err(|e| e.to_string()),
                            None => Err("no backend session to submit to".to_string()),
                        };
                        match &result {
                            Ok(receipt) => tracing::info!(%receipt, "submission accepted"),
                            Err(error) => tracing::error!(%error, "submission failed"),
                        }
                        if let Some(intake) = intake {
                            let _ = intake.send(SessionEvent::SubmissionSettled { result }).await;
                        }
                    });
                }
                Effect::Blocked(reason) => {
                    tracing::warn!(?reason, "session blocked");
                }
            }
        }
    }

    fn report(&self, violation: Violation) {
        let Some(session_id) = self.proctoring_session.clone() else {
            tracing::debug!(violation = %violation.id, "no proctoring session, violation kept locally");
            return;
        };
        tokio::spawn(report_violation_with_retry(
            self.backend.clone(),
            session_id,
            violation,
            self.settings.report_policy,
        ));
    }

    fn watch_media_end(&mut self) {
        let Some(media) = self.media.as_mut() else {
            return;
        };
        for kind in [MediaKind::Webcam, MediaKind::Screen] {
            let Some(ended) = media.take_end_signal(kind) else {
                continue;
            };
            let intake = self.intake.clone();
            let cancel = self.media_watchers.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    ended = ended => {
                        if ended.is_ok() {
                            if let Some(intake) = intake.upgrade() {
                                let _ = intake.send(SessionEvent::CaptureEnded { kind }).await;
                            }
                        }
                    }
                }
            });
        }
    }

    fn answer_submit(&mut self, reply: oneshot::Sender<Result<ExamSession>>) {
        if *self.machine.submission() == SubmissionState::Pending {
            self.submit_waiters.push(reply);
        } else {
            self.publish();
            let _ = reply.send(self.submission_result());
        }
    }

    fn submission_result(&self) -> Result<ExamSession> {
        match self.machine.submission() {
            SubmissionState::Failed { error, .. } => Err(Error::Submission(error.clone())),
            _ => Ok(self.machine.snapshot()),
        }
    }

    fn shutdown(&mut self) {
        let effects = self.machine.teardown();
        self.apply(effects);
        if let Some(pending) = self.pending.take() {
            pending.abandon(Error::SessionClosed);
        }
        for waiter in self.submit_waiters.drain(..) {
            let _ = waiter.send(Err(Error::SessionClosed));
        }
        self.publish();
    }

    fn publish(&self) {
        self.state.send_replace(self.machine.snapshot());
    }
}

async fn open_backend_session(
    backend: Arc<dyn ExamBackend>,
    test_id: &str,
    proctored: bool,
) -> Result<BackendSession> {
    let token = backend.start_session(test_id).await?;
    let proctoring = if proctored {
        match backend.start_proctoring(test_id).await {
            Ok(start) => Some(start),
            Err(err) => {
                tracing::warn!(error = %err, "proctoring session unavailable, violations stay local");
                None
            }
        }
    } else {
        None
    };
    Ok(BackendSession { token, proctoring })
}

/// Cloneable front of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionEvent>,
    state: watch::Receiver<ExamSession>,
    cancel: CancellationToken,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SessionEvent) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    async fn post(&self, event: SessionEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::SessionClosed)
    }

    pub async fn start(&self, consent: bool, devices: Arc<dyn MediaDevices>) -> Result<StartReceipt> {
        self.request(|reply| SessionEvent::Start {
            consent,
            devices,
            reply,
        })
        .await?
    }

    pub async fn signal(&self, signal: BrowserSignal) -> Result<SignalOutcome> {
        self.request(|reply| SessionEvent::Signal {
            signal,
            reply: Some(reply),
        })
        .await
    }

    pub async fn save_answers(&self, answers: JsonValue) -> Result<()> {
        self.request(|reply| SessionEvent::SaveAnswers { answers, reply })
            .await?
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.post(SessionEvent::Heartbeat).await
    }

    pub async fn submit(&self, answers: Option<JsonValue>) -> Result<ExamSession> {
        self.request(|reply| SessionEvent::Submit { answers, reply })
            .await?
    }

    pub async fn retry_submission(&self) -> Result<ExamSession> {
        self.request(|reply| SessionEvent::RetrySubmit { reply }).await?
    }

    pub async fn warn(&self, message: impl Into<String>) -> Result<Option<Warning>> {
        let message = message.into();
        self.request(|reply| SessionEvent::Warn { message, reply })
            .await
    }

    pub async fn block(&self) -> Result<ExamSession> {
        self.request(|reply| SessionEvent::Block { reply }).await
    }

    /// Stops the clock, releases media and ends the session task. Status is
    /// left as it was.
    pub async fn teardown(&self) -> Result<ExamSession> {
        match self.request(|reply| SessionEvent::Teardown { reply }).await {
            Err(Error::SessionClosed) => Ok(self.snapshot()),
            other => other,
        }
    }

    /// Pumps an injected signal source into the session until either side
    /// goes away.
    pub fn attach_event_source<S>(&self, mut source: S)
    where
        S: EventSource + 'static,
    {
        let tx = self.tx.downgrade();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    signal = source.next_signal() => signal,
                };
                let Some(signal) = signal else { break };
                let Some(tx) = tx.upgrade() else { break };
                if tx
                    .send(SessionEvent::Signal {
                        signal,
                        reply: None,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    pub fn snapshot(&self) -> ExamSession {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExamSession> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Tears the session down synchronously when dropped.
    pub fn teardown_guard(&self) -> TeardownGuard {
        TeardownGuard {
            cancel: self.cancel.clone(),
        }
    }
}

pub struct TeardownGuard {
    cancel: CancellationToken,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
