pub mod config;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use crate::services::backend_client::{BackendProvider, ExamBackend, HttpBackendProvider};
use crate::services::monitor_service::ProctoringHub;
use crate::services::session_runtime::RuntimeSettings;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ProctoringHub>,
    pub backends: Arc<dyn BackendProvider>,
}

impl AppState {
    pub fn new() -> error::Result<Self> {
        let config = crate::config::get_config();
        let backends = HttpBackendProvider::new(
            &config.exam_backend_url,
            std::time::Duration::from_secs(config.backend_timeout_secs),
        )?;
        let hub = ProctoringHub::new(
            RuntimeSettings::from_config(config),
            chrono::Duration::seconds(config.stale_after_secs),
        );
        Ok(Self::with_parts(hub, Arc::new(backends)))
    }

    pub fn with_parts(hub: ProctoringHub, backends: Arc<dyn BackendProvider>) -> Self {
        Self {
            hub: Arc::new(hub),
            backends,
        }
    }

    pub fn backend_for(&self, bearer: &str) -> Arc<dyn ExamBackend> {
        self.backends.for_caller(bearer)
    }
}
