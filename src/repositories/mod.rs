pub mod attempts;
pub mod memory;
pub mod test_definitions;

use async_trait::async_trait;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::services::access::TestTiming;
use crate::services::attempt::Attempt;
use crate::services::test_definition::TestDefinition;
use crate::services::usage::{ItemUsage, UsageError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("attempt {attempt_id} was modified by another request")]
    Conflict { attempt_id: String },
    #[error(transparent)]
    UsageSave(#[from] UsageError),
    #[error("stored data is invalid: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Attempt),
    /// Another request already created this attempt number; this is its row.
    Duplicate(Attempt),
}

/// Optional scope for the periodic check-time sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenAttemptFilter {
    pub course_id: Option<String>,
    pub user_id: Option<String>,
    pub test_id: Option<String>,
    pub group_id: Option<String>,
}

/// Persistence for attempts, their item usages and the tests they belong to.
///
/// Every write of an attempt row that also touches its usage happens in one
/// transaction. `commit` is guarded by the attempt's `revision`.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Persists a new attempt together with its usage. Duplicate attempt numbers
    /// for the same learner and test resolve to the row that won.
    async fn insert(
        &self,
        attempt: Attempt,
        usage: &dyn ItemUsage,
    ) -> Result<InsertOutcome, StoreError>;

    async fn find_by_id(&self, attempt_id: &str) -> Result<Option<Attempt>, StoreError>;

    async fn load_usage_state(&self, usage_id: &str) -> Result<serde_json::Value, StoreError>;

    /// All attempts of one learner on one test, ordered by attempt number.
    async fn list_for_user(
        &self,
        test_id: &str,
        user_id: &str,
    ) -> Result<Vec<Attempt>, StoreError>;

    /// Writes the attempt (and usage, when given) if nobody committed since it
    /// was loaded. Bumps `attempt.revision` on success.
    async fn commit(
        &self,
        attempt: &mut Attempt,
        usage: Option<&dyn ItemUsage>,
    ) -> Result<(), StoreError>;

    async fn delete_previews(&self, test_id: &str, user_id: &str) -> Result<u64, StoreError>;

    async fn load_test(&self, test_id: &str) -> Result<Option<TestDefinition>, StoreError>;

    /// Test timing with the learner's user and group overrides applied.
    async fn effective_timing(
        &self,
        test: &TestDefinition,
        user_id: &str,
    ) -> Result<TestTiming, StoreError>;

    /// Recomputes `time_check_state` for every open attempt in scope. Never
    /// changes an attempt's state. Returns the number of rows touched.
    async fn recheck_open_attempts(
        &self,
        filter: &OpenAttemptFilter,
    ) -> Result<u64, StoreError>;

    /// Open attempts whose check time has passed, earliest first.
    async fn list_due(
        &self,
        now: PrimitiveDateTime,
        limit: u32,
    ) -> Result<Vec<Attempt>, StoreError>;
}
