use std::sync::Arc;

use tokio::sync::RwLock;

use crate::models::state::JobState;
use crate::services::runner::RunnerHandle;
use crate::services::state_store::StateStore;
use crate::services::store::BlobStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BlobStore>,
    pub state_store: Arc<StateStore>,
    pub jobs: Arc<RwLock<JobState>>,
    pub runner: RunnerHandle,
}

impl AppState {
    pub fn new(
        store: Arc<dyn BlobStore>,
        state_store: Arc<StateStore>,
        jobs: Arc<RwLock<JobState>>,
        runner: RunnerHandle,
    ) -> Self {
        Self {
            store,
            state_store,
            jobs,
            runner,
        }
    }

    /// Write the current job state through to Redis. Handlers tolerate
    /// persistence failures; the in-memory record stays authoritative.
    pub async fn persist_jobs(&self) {
        let snapshot = {
            let jobs = self.jobs.read().await;
            jobs.clone()
        };
        if let Err(e) = self.state_store.save(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist job state");
        }
    }
}
