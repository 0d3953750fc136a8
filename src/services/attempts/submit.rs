use time::PrimitiveDateTime;

use super::start::used_item_ids;
use super::{AttemptContext, AttemptError, AttemptResult, AttemptService};
use crate::core::metrics;
use crate::db::types::AttemptState;
use crate::services::attempt::Attempt;
use crate::services::collaborators::RandomItemRequest;
use crate::services::layout::SlotNumber;
use crate::services::navigation::{check_page_access, AttemptNavigator, PageSelector};
use crate::services::test_definition::SlotSource;
use crate::services::timing::{plan_submission, SubmitAction};
use crate::services::usage::{ItemUsage, LeastUsedVariants, PageResponses, VariantStrategy};

/// One posted page of an attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageSubmission {
    /// Page the form was rendered for.
    pub page: usize,
    pub responses: PageResponses,
    pub finish_requested: bool,
    /// The client's timer ran out.
    pub time_up: bool,
    /// Page to move to after saving.
    pub next_page: Option<usize>,
    /// Slots on `page` the learner asked to try again.
    pub redo_slots: Vec<SlotNumber>,
    /// When the responses were entered, if the client worked offline.
    pub modified_offline: Option<PrimitiveDateTime>,
}

impl AttemptService {
    /// Saves one page of responses and applies whatever the deadline demands.
    ///
    /// Returns the attempt as committed: in progress or overdue when the
    /// learner carries on, finished or abandoned otherwise.
    pub async fn submit_page(
        &self,
        ctx: &AttemptContext<'_>,
        attempt_id: &str,
        submission: PageSubmission,
    ) -> AttemptResult<Attempt> {
        let mut attempt = self.load_owned(ctx, attempt_id).await?;
        Self::ensure_open(&attempt)?;
        let mut usage = self.load_usage(&attempt).await?;

        let plan = plan_submission(
            ctx.access.end_time(&attempt),
            attempt.is_preview,
            ctx.now,
            submission.time_up,
            submission.finish_requested,
            ctx.policy(),
            &self.settings,
        );

        match plan.action {
            SubmitAction::Continue | SubmitAction::GoOverdue => {
                let becoming_overdue = plan.action == SubmitAction::GoOverdue;
                let from = attempt.state;
                let entering_overdue = becoming_overdue && from == AttemptState::InProgress;
                if plan.too_late {
                    attempt.time_modified = ctx.now;
                } else {
                    usage
                        .process_actions(ctx.now, &submission.responses)
                        .map_err(|err| self.usage_failure(&attempt, err))?;
                    attempt.time_modified = ctx.now;
                    attempt.time_modified_offline = submission.modified_offline;

                    if !becoming_overdue && !submission.redo_slots.is_empty() {
                        let active = AttemptNavigator::new(&attempt, ctx.test, usage.as_ref())
                            .active_slots(PageSelector::Page(submission.page));
                        let requested =
                            submission.redo_slots.iter().filter(|slot| active.contains(*slot));
                        for &slot in requested {
                            self.redo_slot(ctx, &mut attempt, usage.as_mut(), slot).await?;
                        }
                    }
                }
                if entering_overdue {
                    attempt.go_overdue(ctx.now, ctx.now);
                }

                if let Some(next_page) = submission.next_page {
                    let in_range = next_page < attempt.layout.page_count();
                    if in_range
                        && check_page_access(&attempt, ctx.test.navigation, Some(next_page), true)
                    {
                        attempt.current_page = next_page;
                    }
                }

                self.commit(&mut attempt, Some(usage.as_ref())).await?;
                if entering_overdue {
                    ::metrics::counter!(metrics::ATTEMPTS_OVERDUE).increment(1);
                    tracing::info!(
                        attempt_id = %attempt.id,
                        test_id = %attempt.test_id,
                        user_id = %attempt.user_id,
                        from = from.as_str(),
                        to = AttemptState::Overdue.as_str(),
                        too_late = plan.too_late,
                        "Attempt went overdue on submission"
                    );
                }
                Ok(attempt)
            }
            SubmitAction::Finish { time_finish } => {
                let responses = (!plan.too_late).then_some(&submission.responses);
                attempt.time_modified_offline = submission.modified_offline;
                self.complete_finish(ctx, attempt, usage, responses, time_finish).await
            }
            SubmitAction::Abandon => self.complete_abandon(ctx, attempt).await,
        }
    }

    /// Submits the final page and finishes the attempt.
    pub async fn finish_attempt(
        &self,
        ctx: &AttemptContext<'_>,
        attempt_id: &str,
        responses: PageResponses,
    ) -> AttemptResult<Attempt> {
        let attempt = self.load_owned(ctx, attempt_id).await?;
        let submission = PageSubmission {
            page: attempt.current_page,
            responses,
            finish_requested: true,
            ..PageSubmission::default()
        };
        self.submit_page(ctx, attempt_id, submission).await
    }

    /// Stores draft responses without grading them.
    pub async fn auto_save(
        &self,
        ctx: &AttemptContext<'_>,
        attempt_id: &str,
        responses: PageResponses,
    ) -> AttemptResult<Attempt> {
        let mut attempt = self.load_owned(ctx, attempt_id).await?;
        if attempt.state != AttemptState::InProgress {
            return Err(AttemptError::InvalidState {
                attempt_id: attempt.id.clone(),
                state: attempt.state,
            });
        }

        let mut usage = self.load_usage(&attempt).await?;
        usage
            .process_autosaves(ctx.now, &responses)
            .map_err(|err| self.usage_failure(&attempt, err))?;
        attempt.time_modified = ctx.now;
        self.commit(&mut attempt, Some(usage.as_ref())).await?;
        Ok(attempt)
    }

    /// Records the page the learner is on. Sequential navigation only moves forward.
    pub async fn set_current_page(
        &self,
        ctx: &AttemptContext<'_>,
        attempt_id: &str,
        page: usize,
    ) -> AttemptResult<Attempt> {
        let mut attempt = self.load_owned(ctx, attempt_id).await?;
        Self::ensure_open(&attempt)?;
        if page == attempt.current_page {
            return Ok(attempt);
        }
        if page >= attempt.layout.page_count()
            || !check_page_access(&attempt, ctx.test.navigation, Some(page), true)
        {
            return Err(AttemptError::PageNotAvailable { page });
        }

        attempt.current_page = page;
        self.commit(&mut attempt, None).await?;
        Ok(attempt)
    }

    /// Replaces the finished item in `slot` with a fresh one.
    ///
    /// Returns the attempt and the slot now holding the replaced item.
    pub async fn redo_item(
        &self,
        ctx: &AttemptContext<'_>,
        attempt_id: &str,
        slot: SlotNumber,
    ) -> AttemptResult<(Attempt, SlotNumber)> {
        let mut attempt = self.load_owned(ctx, attempt_id).await?;
        Self::ensure_open(&attempt)?;
        let mut usage = self.load_usage(&attempt).await?;

        let history_slot = self.redo_slot(ctx, &mut attempt, usage.as_mut(), slot).await?;
        self.commit(&mut attempt, Some(usage.as_ref())).await?;
        Ok((attempt, history_slot))
    }

    pub(super) async fn complete_finish(
        &self,
        ctx: &AttemptContext<'_>,
        mut attempt: Attempt,
        mut usage: Box<dyn ItemUsage>,
        responses: Option<&PageResponses>,
        time_finish: PrimitiveDateTime,
    ) -> AttemptResult<Attempt> {
        let from = attempt.state;
        if let Some(responses) = responses {
            usage
                .process_actions(ctx.now, responses)
                .map_err(|err| self.usage_failure(&attempt, err))?;
        }
        usage.finish_all(ctx.now);
        attempt.finish(ctx.now, time_finish, usage.total_mark());
        self.commit(&mut attempt, Some(usage.as_ref())).await?;

        ::metrics::counter!(metrics::ATTEMPTS_FINISHED).increment(1);
        tracing::info!(
            attempt_id = %attempt.id,
            test_id = %attempt.test_id,
            user_id = %attempt.user_id,
            from = from.as_str(),
            to = AttemptState::Finished.as_str(),
            sum_grades = attempt.sum_grades,
            "Attempt finished"
        );
        self.notify_finished(&attempt).await;
        Ok(attempt)
    }

    pub(super) async fn complete_abandon(
        &self,
        ctx: &AttemptContext<'_>,
        mut attempt: Attempt,
    ) -> AttemptResult<Attempt> {
        let from = attempt.state;
        attempt.abandon(ctx.now);
        self.commit(&mut attempt, None).await?;

        ::metrics::counter!(metrics::ATTEMPTS_ABANDONED).increment(1);
        tracing::info!(
            attempt_id = %attempt.id,
            test_id = %attempt.test_id,
            user_id = %attempt.user_id,
            from = from.as_str(),
            to = AttemptState::Abandoned.as_str(),
            "Attempt abandoned"
        );
        Ok(attempt)
    }

    /// The displaced item keeps its responses in a new slot worth no marks,
    /// linked back to `slot`; a fresh item takes its place in the layout.
    async fn redo_slot(
        &self,
        ctx: &AttemptContext<'_>,
        attempt: &mut Attempt,
        usage: &mut dyn ItemUsage,
        slot: SlotNumber,
    ) -> AttemptResult<SlotNumber> {
        if !ctx.test.can_redo_items {
            return Err(AttemptError::RedoNotAllowed {
                slot,
                reason: "the test does not allow trying items again",
            });
        }
        Self::ensure_open(attempt)?;
        if !attempt.layout.slots().any(|placed| placed == slot) {
            return Err(AttemptError::RedoNotAllowed {
                slot,
                reason: "the slot is not in the layout",
            });
        }
        let current = usage.item(slot).cloned().ok_or_else(|| AttemptError::RedoNotAllowed {
            slot,
            reason: "the slot holds no item",
        })?;
        if !usage.item_state(slot).is_finished() {
            return Err(AttemptError::RedoNotAllowed {
                slot,
                reason: "the item is not finished yet",
            });
        }

        let replacement = match ctx.test.slot(slot).map(|definition| &definition.source) {
            Some(SlotSource::Random(random)) => {
                let already_used = self.items_used_by_learner(attempt, usage).await?;
                self.selector
                    .next_item(RandomItemRequest {
                        user_id: ctx.user_id,
                        slot: random,
                        already_used: &already_used,
                    })
                    .await?
                    .ok_or_else(|| AttemptError::InsufficientItemPool {
                        slot,
                        category: random.category.clone(),
                    })?
            }
            _ => current,
        };

        let history_slot = usage.add_item_in_place_of_other(slot, replacement)?;
        usage.set_max_mark(history_slot, 0.0)?;

        let mut least_used = LeastUsedVariants::new();
        least_used.record_usage(attempt.attempt_number, usage);
        let variant = match usage.item(slot) {
            Some(item) => least_used.choose_variant(slot, item),
            None => 1,
        };
        usage.start_item(slot, variant, ctx.now)?;

        attempt.redo_links.insert(history_slot, slot);
        attempt.time_modified = ctx.now;

        ::metrics::counter!(metrics::ITEMS_REDONE).increment(1);
        tracing::info!(
            attempt_id = %attempt.id,
            user_id = %attempt.user_id,
            slot,
            history_slot,
            "Item redone"
        );
        Ok(history_slot)
    }

    /// Item ids across the current usage and the learner's other attempts.
    async fn items_used_by_learner(
        &self,
        attempt: &Attempt,
        usage: &dyn ItemUsage,
    ) -> AttemptResult<Vec<String>> {
        let mut used = used_item_ids(usage);
        for other in self.store.list_for_user(&attempt.test_id, &attempt.user_id).await? {
            if other.id != attempt.id && !other.is_preview {
                used.extend(used_item_ids(self.load_usage(&other).await?.as_ref()));
            }
        }
        Ok(used)
    }
}
