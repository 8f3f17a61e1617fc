use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::dto::backend_dto::ProctoringReport;
use crate::error::{Error, Result};
use crate::models::roster::{FeedItem, RosterEntry, RosterSummary};
use crate::models::session::{ExamSession, SessionStatus, Warning};
use crate::services::backend_client::ExamBackend;
use crate::services::session_runtime::{RuntimeSettings, SessionHandle, SessionRuntime};

type SessionKey = (String, String);

struct SessionEntry {
    handle: SessionHandle,
    opened_at: DateTime<Utc>,
}

/// Registry of live session runtimes and the instructor view over them.
///
/// Pruning stops a finished runtime but keeps its final snapshot, so a
/// (test, student) pair that once started never gets a second session.
/// Lock order is `sessions` then `finished`.
pub struct ProctoringHub {
    sessions: RwLock<HashMap<SessionKey, SessionEntry>>,
    finished: RwLock<HashMap<SessionKey, ExamSession>>,
    settings: RuntimeSettings,
    stale_after: Duration,
}

impl ProctoringHub {
    pub fn new(settings: RuntimeSettings, stale_after: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
            settings,
            stale_after,
        }
    }

    /// Returns the session of this student, creating it from the backend
    /// test definition on first use. Fails for a session that already
    /// finished and was pruned.
    pub async fn open_session(
        &self,
        test_id: &str,
        student_id: &str,
        backend: Arc<dyn ExamBackend>,
    ) -> Result<SessionHandle> {
        if let Ok(handle) = self.session(test_id, student_id) {
            return Ok(handle);
        }
        let key = (test_id.to_string(), student_id.to_string());
        self.refuse_finished(&key)?;

        let definition = backend.fetch_test_definition(test_id).await?;

        let mut sessions = self.sessions.write().expect("session registry lock poisoned");
        if let Some(entry) = sessions.get(&key) {
            return Ok(entry.handle.clone());
        }
        self.refuse_finished(&key)?;
        let handle = SessionRuntime::spawn(&definition, student_id, backend, self.settings.clone());
        sessions.insert(
            key,
            SessionEntry {
                handle: handle.clone(),
                opened_at: Utc::now(),
            },
        );
        tracing::info!(test_id, student_id, duration = definition.duration_seconds, "exam session opened");
        Ok(handle)
    }

    pub fn session(&self, test_id: &str, student_id: &str) -> Result<SessionHandle> {
        let sessions = self.sessions.read().expect("session registry lock poisoned");
        sessions
            .get(&(test_id.to_string(), student_id.to_string()))
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| Error::NotFound(format!("No session for student {} in test {}", student_id, test_id)))
    }

    fn refuse_finished(&self, key: &SessionKey) -> Result<()> {
        let finished = self.finished.read().expect("finished session lock poisoned");
        match finished.get(key) {
            Some(session) if session.status.is_terminal() => Err(Error::InvalidTransition {
                from: session.status,
                action: "start",
            }),
            Some(_) => Err(Error::SessionClosed),
            None => Ok(()),
        }
    }

    /// Current snapshot of a student's session, live or already pruned.
    pub fn status(&self, test_id: &str, student_id: &str) -> Result<ExamSession> {
        if let Ok(handle) = self.session(test_id, student_id) {
            return Ok(handle.snapshot());
        }
        let finished = self.finished.read().expect("finished session lock poisoned");
        finished
            .get(&(test_id.to_string(), student_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No session for student {} in test {}", student_id, test_id)))
    }

    /// Snapshots of one test paired with whether the runtime is closed.
    /// Pruned sessions are included through their final snapshot.
    fn snapshots(&self, test_id: &str) -> Vec<(ExamSession, bool)> {
        let sessions = self.sessions.read().expect("session registry lock poisoned");
        let finished = self.finished.read().expect("finished session lock poisoned");
        sessions
            .iter()
            .filter(|((test, _), _)| test == test_id)
            .map(|(_, entry)| (entry.handle.snapshot(), entry.handle.is_closed()))
            .chain(
                finished
                    .iter()
                    .filter(|((test, _), _)| test == test_id)
                    .map(|(_, session)| (session.clone(), true)),
            )
            .collect()
    }

    /// Live roster of one test, ordered by student id. Sessions that were
    /// closed before they ever started are left out.
    pub fn roster(&self, test_id: &str, now: DateTime<Utc>) -> Vec<RosterEntry> {
        let mut roster: Vec<RosterEntry> = self
            .snapshots(test_id)
            .into_iter()
            .filter(|(session, closed)| !(*closed && session.status == SessionStatus::NotStarted))
            .map(|(session, _)| RosterEntry::derive(&session, now, self.stale_after))
            .collect();
        roster.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        roster
    }

    pub fn summary(&self, test_id: &str, now: DateTime<Utc>) -> RosterSummary {
        RosterSummary::from_entries(&self.roster(test_id, now))
    }

    /// Most recent violations across the roster, newest first.
    pub fn violation_feed(&self, test_id: &str, limit: usize) -> Vec<FeedItem> {
        let mut feed: Vec<FeedItem> = self
            .snapshots(test_id)
            .into_iter()
            .flat_map(|(session, _)| {
                let student_id = session.student_id;
                session.violations.into_iter().map(move |violation| FeedItem {
                    student_id: student_id.clone(),
                    violation,
                })
            })
            .collect();
        feed.sort_by(|a, b| b.violation.timestamp.cmp(&a.violation.timestamp));
        feed.truncate(limit);
        feed
    }

    pub async fn warn(&self, test_id: &str, student_id: &str, message: &str) -> Result<Warning> {
        let handle = self.session(test_id, student_id)?;
        match handle.warn(message).await? {
            Some(warning) => Ok(warning),
            None => Err(Error::InvalidTransition {
                from: handle.snapshot().status,
                action: "warn",
            }),
        }
    }

    /// Administrative block. Idempotent once the session is terminal.
    pub async fn block(&self, test_id: &str, student_id: &str) -> Result<ExamSession> {
        let handle = self.session(test_id, student_id)?;
        let session = handle.block().await?;
        tracing::warn!(test_id, student_id, status = %session.status, "instructor block applied");
        Ok(session)
    }

    pub async fn proctoring_report(
        &self,
        test_id: &str,
        backend: Arc<dyn ExamBackend>,
    ) -> Result<ProctoringReport> {
        backend.fetch_proctoring_report(test_id).await
    }

    /// Stops runtimes that are finished (terminal, torn down, or never
    /// started) and have been quiet for longer than `retention`. Sessions
    /// that started keep their final snapshot; ones that never started are
    /// forgotten.
    pub fn prune(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let mut sessions = self.sessions.write().expect("session registry lock poisoned");
        let mut finished = self.finished.write().expect("finished session lock poisoned");
        let before = sessions.len();
        sessions.retain(|key, entry| {
            let snapshot = entry.handle.snapshot();
            let done = snapshot.status.is_terminal()
                || snapshot.status == SessionStatus::NotStarted
                || entry.handle.is_closed();
            let quiet_since = snapshot.end_time.unwrap_or(snapshot.last_activity).max(entry.opened_at);
            if !done || now - quiet_since <= retention {
                return true;
            }
            tracing::debug!(test_id = %key.0, student_id = %key.1, status = %snapshot.status, "pruning finished session");
            if snapshot.start_time.is_some() {
                finished.insert(key.clone(), snapshot);
            }
            false
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
