use std::sync::Arc;

use crate::core::config::Settings;
use crate::repositories::AttemptStore;
use crate::services::attempts::AttemptService;

/// Shared handles for the background loops.
#[derive(Clone)]
pub struct WorkerState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: Arc<dyn AttemptStore>,
    attempts: Option<AttemptService>,
}

impl WorkerState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn AttemptStore>,
        attempts: Option<AttemptService>,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, store, attempts }) }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn AttemptStore> {
        &self.inner.store
    }

    /// Present only when an item engine is wired in; overdue processing needs one.
    pub fn attempts(&self) -> Option<&AttemptService> {
        self.inner.attempts.as_ref()
    }
}
