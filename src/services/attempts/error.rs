use thiserror::Error;

use crate::db::types::AttemptState;
use crate::repositories::StoreError;
use crate::services::collaborators::SelectionError;
use crate::services::layout::SlotNumber;
use crate::services::usage::UsageError;

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("test {test_id} shows a grade but awards no marks")]
    Configuration { test_id: String },
    #[error("attempt {attempt_id} changed since the page was loaded; reload and try again")]
    OutOfSequence { attempt_id: String },
    #[error("no eligible item left in category {category} for slot {slot}")]
    InsufficientItemPool { slot: SlotNumber, category: String },
    #[error("access denied: {}", .0.join("; "))]
    AccessDenied(Vec<String>),
    #[error("no more attempts are allowed at this test")]
    NoAttemptsLeft,
    #[error("attempt {attempt_id} is {state}")]
    InvalidState { attempt_id: String, state: AttemptState },
    #[error("slot {slot} cannot be redone: {reason}")]
    RedoNotAllowed { slot: SlotNumber, reason: &'static str },
    #[error("page {page} is not available")]
    PageNotAvailable { page: usize },
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
}

impl From<StoreError> for AttemptError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { attempt_id } => Self::OutOfSequence { attempt_id },
            other => Self::Store(other),
        }
    }
}

impl AttemptError {
    /// Stale or duplicate submissions the learner can recover from by reloading.
    pub fn is_out_of_sequence(&self) -> bool {
        matches!(self, Self::OutOfSequence { .. })
    }
}
