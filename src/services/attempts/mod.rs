//! Attempt lifecycle: start, page submission, redo and time-driven transitions.
//!
//! Every operation works on a copy of the stored attempt and writes it back
//! through [`AttemptStore::commit`] together with the item usage, so a failure
//! anywhere leaves the stored attempt untouched.

mod error;
mod start;
mod submit;
mod time_check;

use std::sync::Arc;

use time::PrimitiveDateTime;

pub use error::AttemptError;
pub use start::{StartOptions, StartOutcome};
pub use submit::PageSubmission;
pub use time_check::DueSummary;

use crate::core::config::AttemptSettings;
use crate::core::metrics;
use crate::repositories::AttemptStore;
use crate::services::access::{AccessManager, TimingRules};
use crate::services::attempt::Attempt;
use crate::services::collaborators::{GradeAggregator, ItemSelector};
use crate::services::layout::SlotNumber;
use crate::services::test_definition::TestDefinition;
use crate::services::timing::TimePolicy;
use crate::services::usage::{ItemUsage, ItemUsageFactory, UsageError};

pub type AttemptResult<T> = Result<T, AttemptError>;

/// Who is acting, on which test, under which access rules, and when.
#[derive(Clone, Copy)]
pub struct AttemptContext<'a> {
    pub test: &'a TestDefinition,
    pub access: &'a dyn AccessManager,
    pub user_id: &'a str,
    pub now: PrimitiveDateTime,
}

impl<'a> AttemptContext<'a> {
    pub fn new(
        test: &'a TestDefinition,
        access: &'a dyn AccessManager,
        user_id: &'a str,
        now: PrimitiveDateTime,
    ) -> Self {
        Self { test, access, user_id, now }
    }

    fn policy(&self) -> TimePolicy {
        TimePolicy {
            overdue_handling: self.test.overdue_handling,
            grace_period: self.test.grace_period,
        }
    }
}

#[derive(Clone)]
pub struct AttemptService {
    store: Arc<dyn AttemptStore>,
    usages: Arc<dyn ItemUsageFactory>,
    selector: Arc<dyn ItemSelector>,
    grades: Arc<dyn GradeAggregator>,
    settings: AttemptSettings,
}

impl AttemptService {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        usages: Arc<dyn ItemUsageFactory>,
        selector: Arc<dyn ItemSelector>,
        grades: Arc<dyn GradeAggregator>,
        settings: AttemptSettings,
    ) -> Self {
        Self { store, usages, selector, grades, settings }
    }

    pub fn store(&self) -> &Arc<dyn AttemptStore> {
        &self.store
    }

    pub async fn load_test(&self, test_id: &str) -> AttemptResult<TestDefinition> {
        self.store
            .load_test(test_id)
            .await?
            .ok_or_else(|| AttemptError::NotFound(format!("test {test_id}")))
    }

    /// Built-in access rules for `user_id`, with their overrides applied.
    pub async fn timing_rules(
        &self,
        test: &TestDefinition,
        user_id: &str,
    ) -> AttemptResult<TimingRules> {
        Ok(TimingRules::new(self.store.effective_timing(test, user_id).await?))
    }

    pub async fn find_attempt(
        &self,
        ctx: &AttemptContext<'_>,
        attempt_id: &str,
    ) -> AttemptResult<Attempt> {
        self.load_owned(ctx, attempt_id).await
    }

    /// Restores the item usage of an attempt, for rendering or review.
    pub async fn load_usage(&self, attempt: &Attempt) -> AttemptResult<Box<dyn ItemUsage>> {
        let state = self.store.load_usage_state(&attempt.usage_id).await?;
        Ok(self.usages.restore(&attempt.usage_id, state)?)
    }

    async fn load_owned(
        &self,
        ctx: &AttemptContext<'_>,
        attempt_id: &str,
    ) -> AttemptResult<Attempt> {
        self.store
            .find_by_id(attempt_id)
            .await?
            .filter(|attempt| attempt.user_id == ctx.user_id && attempt.test_id == ctx.test.id)
            .ok_or_else(|| AttemptError::NotFound(format!("attempt {attempt_id}")))
    }

    fn ensure_open(attempt: &Attempt) -> AttemptResult<()> {
        if attempt.is_finished() {
            return Err(AttemptError::InvalidState {
                attempt_id: attempt.id.clone(),
                state: attempt.state,
            });
        }
        Ok(())
    }

    async fn commit(
        &self,
        attempt: &mut Attempt,
        usage: Option<&dyn ItemUsage>,
    ) -> AttemptResult<()> {
        self.store.commit(attempt, usage).await.map_err(|err| {
            let err = AttemptError::from(err);
            if err.is_out_of_sequence() {
                self.record_out_of_sequence(attempt, None);
            }
            err
        })
    }

    /// Maps an item-engine failure, flagging stale responses for the learner.
    fn usage_failure(&self, attempt: &Attempt, err: UsageError) -> AttemptError {
        match err {
            UsageError::OutOfSequence { slot } => {
                self.record_out_of_sequence(attempt, Some(slot));
                AttemptError::OutOfSequence { attempt_id: attempt.id.clone() }
            }
            other => AttemptError::Usage(other),
        }
    }

    fn record_out_of_sequence(&self, attempt: &Attempt, slot: Option<SlotNumber>) {
        ::metrics::counter!(metrics::OUT_OF_SEQUENCE).increment(1);
        tracing::warn!(
            attempt_id = %attempt.id,
            test_id = %attempt.test_id,
            user_id = %attempt.user_id,
            slot,
            "Rejected out-of-sequence submission"
        );
    }

    /// Grade aggregation is fire-and-forget: a failure is logged, never returned.
    async fn notify_finished(&self, attempt: &Attempt) {
        if attempt.is_preview {
            return;
        }
        if let Err(err) = self.grades.attempt_finished(&attempt.test_id, &attempt.user_id).await {
            tracing::error!(
                attempt_id = %attempt.id,
                test_id = %attempt.test_id,
                user_id = %attempt.user_id,
                error = %err,
                "Failed to recompute grade after attempt finished"
            );
        }
    }
}
