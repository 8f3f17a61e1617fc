use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use url::Url;

use crate::dto::backend_dto::{
    Envelope, MockTestResponse, ProctoringReport, ProctoringStart, SessionToken,
    SubmissionReceipt, SubmitAttemptBody, ViolationAck,
};
use crate::error::{Error, Result};
use crate::models::proctoring_config::TestDefinition;
use crate::models::session::SubmissionPayload;
use crate::models::violation::Violation;

/// The platform REST API as seen by the proctoring engine.
#[async_trait]
pub trait ExamBackend: Send + Sync {
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

#[derive(Clone)]
pub struct HttpExamBackend {
    client: Client,
    base_url: Url,
    bearer: String,
}

impl HttpExamBackend {
    pub fn new(client: Client, base_url: Url, bearer: impl Into<String>) -> Self {
        Self {
            client,
            base_url,
            bearer: bearer.into(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("Backend URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(&self.bearer).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "exam backend rejected request");
            return Err(Error::BackendStatus {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.into_inner())
    }
}

#[async_trait]
impl ExamBackend for HttpExamBackend {
    async fn fetch_test_definition(&self, test_id: &str) -> Result<TestDefinition> {
        let url = self.endpoint(&["api", "mock-tests", test_id])?;
        let test: MockTestResponse = self.send(self.client.get(url)).await?;
        Ok(test.into())
    }

    async fn start_session(&self, test_id: &str) -> Result<SessionToken> {
        let url = self.endpoint(&["api", "mock-tests", test_id, "start"])?;
        self.send(self.client.post(url)).await
    }

    async fn start_proctoring(&self, test_id: &str) -> Result<ProctoringStart> {
        let url = self.endpoint(&["api", "mock-tests", test_id, "start-proctoring"])?;
        self.send(self.client.post(url)).await
    }

    async fn submit_session(
        &self,
        token: &SessionToken,
        payload: &SubmissionPayload,
    ) -> Result<SubmissionReceipt> {
        let url = self.endpoint(&["api", "mock-test-attempts", &token.attempt_id, "submit"])?;
        let body = SubmitAttemptBody {
            session_token: &token.session_token,
            payload,
        };
        self.send(self.client.post(url).json(&body)).await
    }

    async fn report_violation_event(
        &self,
        proctoring_session_id: &str,
        violation: &Violation,
    ) -> Result<ViolationAck> {
        let url = self.endpoint(&["api", "proctoring", proctoring_session_id, "events"])?;
        self.send(self.client.post(url).json(violation)).await
    }

    async fn fetch_proctoring_report(&self, test_id: &str) -> Result<ProctoringReport> {
        let url = self.endpoint(&["api", "mock-tests", test_id, "proctoring-report"])?;
        self.send(self.client.get(url)).await
    }
}

/// Builds a backend client acting on behalf of one caller.
pub trait BackendProvider: Send + Sync {
    fn for_caller(&self, bearer: &str) -> Arc<dyn ExamBackend>;
}

#[derive(Clone)]
pub struct HttpBackendProvider {
    client: Client,
    base_url: Url,
}

impl HttpBackendProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
        })
    }
}

impl BackendProvider for HttpBackendProvider {
    fn for_caller(&self, bearer: &str) -> Arc<dyn ExamBackend> {
        Arc::new(HttpExamBackend::new(
            self.client.clone(),
            self.base_url.clone(),
            bearer,
        ))
    }
}

/// Retry policy for fire-and-forget violation reports.
#[derive(Debug, Clone, Copy)]
pub struct ReportPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReportPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReportPolicy {
    /// Exponential backoff with up to 20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        let jitter_ms = (delay.as_millis() as u64) / 5;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

/// Delivers one violation report. Failure never reaches the session: the
/// report is dropped after the last attempt.
pub async fn report_violation_with_retry(
    backend: Arc<dyn ExamBackend>,
    proctoring_session_id: String,
    violation: Violation,
    policy: ReportPolicy,
) -> bool {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match backend
            .report_violation_event(&proctoring_session_id, &violation)
            .await
        {
            Ok(_) => {
                tracing::debug!(violation = %violation.id, attempt, "violation reported");
                return true;
            }
            Err(e) if attempt < attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    violation = %violation.id,
                    attempt,
                    error = %e,
                    "violation report failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(
                    violation = %violation.id,
                    attempts,
                    error = %e,
                    "dropping violation report"
                );
            }
        }
    }
    false
}
