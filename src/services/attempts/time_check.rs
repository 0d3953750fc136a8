use std::collections::HashMap;

use time::PrimitiveDateTime;

use super::{AttemptContext, AttemptError, AttemptResult, AttemptService};
use crate::core::metrics;
use crate::db::types::AttemptState;
use crate::repositories::OpenAttemptFilter;
use crate::services::attempt::Attempt;
use crate::services::test_definition::TestDefinition;
use crate::services::timing::{time_check_transition, TimeCheckTransition};

/// Outcome of one overdue pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueSummary {
    pub checked: u64,
    pub finished: u64,
    pub overdue: u64,
    pub abandoned: u64,
    pub failed: u64,
}

impl AttemptService {
    /// Applies whatever the deadline demands to one attempt.
    ///
    /// Safe to call repeatedly. `student_online` is false for background
    /// callers, which makes an autosubmit record the deadline as finish time.
    pub async fn handle_time_check(
        &self,
        ctx: &AttemptContext<'_>,
        attempt_id: &str,
        student_online: bool,
    ) -> AttemptResult<Attempt> {
        let attempt = self.load_owned(ctx, attempt_id).await?;
        self.apply_time_check(ctx, attempt, student_online).await
    }

    pub(super) async fn apply_time_check(
        &self,
        ctx: &AttemptContext<'_>,
        mut attempt: Attempt,
        student_online: bool,
    ) -> AttemptResult<Attempt> {
        let transition = time_check_transition(
            attempt.state,
            attempt.is_preview,
            ctx.access.end_time(&attempt),
            ctx.now,
            ctx.policy(),
            student_online,
        );

        match transition {
            TimeCheckTransition::ClearCheck => {
                if attempt.time_check_state.is_some() {
                    attempt.time_check_state = None;
                    self.commit(&mut attempt, None).await?;
                }
                Ok(attempt)
            }
            TimeCheckTransition::RecheckAt(at) => {
                if attempt.time_check_state != Some(at) {
                    attempt.time_check_state = Some(at);
                    self.commit(&mut attempt, None).await?;
                }
                Ok(attempt)
            }
            TimeCheckTransition::Finish { time_finish } => {
                let usage = self.load_usage(&attempt).await?;
                self.complete_finish(ctx, attempt, usage, None, time_finish).await
            }
            TimeCheckTransition::GoOverdue { recheck_at } => {
                let from = attempt.state;
                attempt.go_overdue(ctx.now, recheck_at);
                self.commit(&mut attempt, None).await?;

                ::metrics::counter!(metrics::ATTEMPTS_OVERDUE).increment(1);
                tracing::info!(
                    attempt_id = %attempt.id,
                    test_id = %attempt.test_id,
                    user_id = %attempt.user_id,
                    from = from.as_str(),
                    to = AttemptState::Overdue.as_str(),
                    recheck_at = %recheck_at,
                    "Attempt went overdue"
                );
                Ok(attempt)
            }
            TimeCheckTransition::Abandon => self.complete_abandon(ctx, attempt).await,
        }
    }

    /// Applies due transitions to attempts whose check time has passed.
    ///
    /// Runs as a background caller: the learner is treated as offline. A failure
    /// on one attempt is logged and does not stop the pass.
    pub async fn process_due_attempts(
        &self,
        now: PrimitiveDateTime,
        limit: u32,
    ) -> AttemptResult<DueSummary> {
        let due = self.store.list_due(now, limit).await?;
        let mut tests: HashMap<String, TestDefinition> = HashMap::new();
        let mut summary = DueSummary::default();

        for attempt in due {
            summary.checked += 1;
            let attempt_id = attempt.id.clone();
            match self.process_due_attempt(&mut tests, attempt, now).await {
                Ok(checked) => match checked.state {
                    AttemptState::Finished => summary.finished += 1,
                    AttemptState::Abandoned => summary.abandoned += 1,
                    AttemptState::Overdue => summary.overdue += 1,
                    AttemptState::InProgress => {}
                },
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(
                        attempt_id = %attempt_id,
                        error = %err,
                        "Failed to process due attempt"
                    );
                }
            }
        }

        if summary.checked > 0 {
            tracing::info!(
                checked = summary.checked,
                finished = summary.finished,
                overdue = summary.overdue,
                abandoned = summary.abandoned,
                failed = summary.failed,
                "Processed due attempts"
            );
        }
        Ok(summary)
    }

    async fn process_due_attempt(
        &self,
        tests: &mut HashMap<String, TestDefinition>,
        attempt: Attempt,
        now: PrimitiveDateTime,
    ) -> AttemptResult<Attempt> {
        if !tests.contains_key(&attempt.test_id) {
            let test = self.load_test(&attempt.test_id).await?;
            tests.insert(attempt.test_id.clone(), test);
        }
        let test = tests
            .get(&attempt.test_id)
            .ok_or_else(|| AttemptError::NotFound(format!("test {}", attempt.test_id)))?;

        let rules = self.timing_rules(test, &attempt.user_id).await?;
        let user_id = attempt.user_id.clone();
        let ctx = AttemptContext::new(test, &rules, &user_id, now);
        self.apply_time_check(&ctx, attempt, false).await
    }

    /// Recomputes check times of open attempts in scope. Never changes state.
    pub async fn recheck_open_attempts(&self, filter: &OpenAttemptFilter) -> AttemptResult<u64> {
        let touched = self.store.recheck_open_attempts(filter).await?;
        ::metrics::counter!(metrics::ATTEMPTS_RECHECKED).increment(touched);
        tracing::info!(
            touched,
            course_id = filter.course_id.as_deref(),
            test_id = filter.test_id.as_deref(),
            user_id = filter.user_id.as_deref(),
            group_id = filter.group_id.as_deref(),
            "Rechecked open attempts"
        );
        Ok(touched)
    }
}
