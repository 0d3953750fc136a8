use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use super::{AttemptContext, AttemptError, AttemptResult, AttemptService};
use crate::core::metrics;
use crate::db::types::AttemptState;
use crate::repositories::InsertOutcome;
use crate::services::attempt::Attempt;
use crate::services::collaborators::RandomItemRequest;
use crate::services::layout::{
    compute_layout_seeded, remap_layout_for_build_on_last, Layout, SlotNumber,
};
use crate::services::test_definition::SlotSource;
use crate::services::usage::{
    ForcedVariants, ItemUsage, LeastUsedVariants, UsageError, VariantStrategy,
};

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub is_preview: bool,
    /// Variants to use for particular slots instead of the least-used one.
    pub forced_variants: HashMap<SlotNumber, u32>,
    /// Fixes the section shuffle; a random seed is drawn when absent.
    pub shuffle_seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(Attempt),
    /// The learner already had an open attempt, or a concurrent start created it.
    Resumed(Attempt),
}

impl StartOutcome {
    pub fn attempt(&self) -> &Attempt {
        match self {
            Self::Started(attempt) | Self::Resumed(attempt) => attempt,
        }
    }

    pub fn into_attempt(self) -> Attempt {
        match self {
            Self::Started(attempt) | Self::Resumed(attempt) => attempt,
        }
    }
}

/// An earlier attempt of the same learner, with its restored usage.
struct PastAttempt {
    attempt_number: u32,
    usage: Box<dyn ItemUsage>,
}

impl AttemptService {
    /// Builds the in-memory shell of a new attempt. Nothing is persisted.
    ///
    /// When `previous` is given its layout and redo history are carried over
    /// for [`AttemptService::start_built_on_last`] to remap.
    pub fn create_attempt(
        &self,
        ctx: &AttemptContext<'_>,
        attempt_number: u32,
        previous: Option<&Attempt>,
        is_preview: bool,
    ) -> AttemptResult<Attempt> {
        if !ctx.test.has_consistent_grades() {
            return Err(AttemptError::Configuration { test_id: ctx.test.id.clone() });
        }

        let (layout, redo_links) = match previous {
            Some(previous) => (previous.layout.clone(), previous.redo_links.clone()),
            None => (Layout::empty(), BTreeMap::new()),
        };

        let mut attempt = Attempt {
            id: Uuid::new_v4().to_string(),
            test_id: ctx.test.id.clone(),
            user_id: ctx.user_id.to_string(),
            usage_id: Uuid::new_v4().to_string(),
            attempt_number,
            state: AttemptState::InProgress,
            is_preview,
            layout,
            current_page: 0,
            time_start: ctx.now,
            time_finish: None,
            time_modified: ctx.now,
            time_modified_offline: None,
            time_check_state: None,
            sum_grades: None,
            redo_links,
            revision: 0,
        };
        if !is_preview {
            attempt.time_check_state = ctx.access.end_time(&attempt);
        }
        Ok(attempt)
    }

    /// Resolves random slots, starts every item and lays the attempt out.
    ///
    /// `history` holds the learner's earlier usages: their items are avoided by
    /// random selection and their variants steer the least-used strategy.
    async fn start_fresh(
        &self,
        ctx: &AttemptContext<'_>,
        attempt: &mut Attempt,
        history: &[PastAttempt],
        options: &StartOptions,
    ) -> AttemptResult<Box<dyn ItemUsage>> {
        let mut already_used: Vec<String> = history
            .iter()
            .flat_map(|past| used_item_ids(past.usage.as_ref()))
            .collect();

        let mut usage = self.usages.create(&attempt.usage_id);
        for definition in &ctx.test.slots {
            let item = match &definition.source {
                SlotSource::Fixed(item) => item.clone(),
                SlotSource::Random(random) => self
                    .selector
                    .next_item(RandomItemRequest {
                        user_id: ctx.user_id,
                        slot: random,
                        already_used: &already_used,
                    })
                    .await?
                    .ok_or_else(|| AttemptError::InsufficientItemPool {
                        slot: definition.slot,
                        category: random.category.clone(),
                    })?,
            };
            already_used.push(item.id.clone());

            let slot = usage.add_item(item, definition.max_mark);
            assert_eq!(slot, definition.slot, "item usage numbered slot {slot} out of order");
        }

        let mut least_used = LeastUsedVariants::new();
        for past in history {
            least_used.record_usage(past.attempt_number, past.usage.as_ref());
        }
        let strategy: Box<dyn VariantStrategy> = if options.forced_variants.is_empty() {
            Box::new(least_used)
        } else {
            Box::new(ForcedVariants::new(options.forced_variants.clone(), Box::new(least_used)))
        };
        usage.start_items(strategy.as_ref(), ctx.now);

        let seed = options.shuffle_seed.unwrap_or_else(rand::random);
        attempt.layout = compute_layout_seeded(
            &ctx.test.sections,
            &ctx.test.page_hints(),
            ctx.test.items_per_page,
            seed,
        );
        Ok(usage)
    }

    /// Copies every item of the previous usage, carrying its responses over,
    /// and remaps the previous layout onto the new slots.
    fn start_built_on_last(
        &self,
        ctx: &AttemptContext<'_>,
        attempt: &mut Attempt,
        previous: &Attempt,
        previous_usage: &dyn ItemUsage,
    ) -> AttemptResult<Box<dyn ItemUsage>> {
        let mut usage = self.usages.create(&attempt.usage_id);
        let mut old_to_new = HashMap::new();

        for old_slot in 1..=previous_usage.slot_count() {
            let item =
                previous_usage.item(old_slot).cloned().ok_or(UsageError::UnknownSlot(old_slot))?;
            let new_slot = usage.add_item(item, previous_usage.max_mark(old_slot));
            usage.start_item_based_on(new_slot, previous_usage, old_slot, ctx.now)?;
            old_to_new.insert(old_slot, new_slot);
        }

        attempt.layout = remap_layout_for_build_on_last(&previous.layout, &old_to_new);
        attempt.redo_links = previous
            .redo_links
            .iter()
            .filter_map(|(slot, original)| {
                Some((*old_to_new.get(slot)?, *old_to_new.get(original)?))
            })
            .collect();
        Ok(usage)
    }

    /// Starts a new attempt for `ctx.user_id`, or resumes the one still open.
    pub async fn start_attempt(
        &self,
        ctx: &AttemptContext<'_>,
        options: StartOptions,
    ) -> AttemptResult<StartOutcome> {
        let mut attempts = self.store.list_for_user(&ctx.test.id, ctx.user_id).await?;

        if let Some(last) = attempts.last_mut().filter(|attempt| attempt.state.is_open()) {
            let checked = self.apply_time_check(ctx, last.clone(), true).await?;
            if checked.state.is_open() {
                return Ok(StartOutcome::Resumed(checked));
            }
            *last = checked;
        }

        if options.is_preview {
            self.store.delete_previews(&ctx.test.id, ctx.user_id).await?;
            attempts.retain(|attempt| !attempt.is_preview);
        }

        let counted: Vec<&Attempt> =
            attempts.iter().filter(|attempt| !attempt.is_preview).collect();
        let attempts_made = counted.len() as u32;
        let last_counted = counted.last().copied();

        if !options.is_preview && ctx.access.is_finished(attempts_made, last_counted, ctx.now) {
            return Err(AttemptError::NoAttemptsLeft);
        }
        let mut reasons = ctx.access.prevent_access(ctx.now);
        if !options.is_preview {
            reasons.extend(ctx.access.prevent_new_attempt(attempts_made, last_counted));
        }
        if !reasons.is_empty() {
            return Err(AttemptError::AccessDenied(reasons));
        }

        let attempt_number =
            attempts.iter().map(|attempt| attempt.attempt_number).max().unwrap_or(0) + 1;
        let previous = counted
            .iter()
            .rev()
            .find(|attempt| attempt.state == AttemptState::Finished)
            .copied()
            .filter(|_| ctx.test.build_on_last && !options.is_preview);

        let mut attempt = self.create_attempt(ctx, attempt_number, previous, options.is_preview)?;
        let usage = match previous {
            Some(previous) => {
                let previous_usage = self.load_usage(previous).await?;
                self.start_built_on_last(ctx, &mut attempt, previous, previous_usage.as_ref())?
            }
            None => {
                let history = self.load_history(&counted).await?;
                self.start_fresh(ctx, &mut attempt, &history, &options).await?
            }
        };

        match self.store.insert(attempt, usage.as_ref()).await? {
            InsertOutcome::Inserted(attempt) => {
                ::metrics::counter!(metrics::ATTEMPTS_STARTED).increment(1);
                tracing::info!(
                    attempt_id = %attempt.id,
                    test_id = %attempt.test_id,
                    user_id = %attempt.user_id,
                    attempt_number = attempt.attempt_number,
                    preview = attempt.is_preview,
                    built_on_last = previous.is_some(),
                    "Attempt started"
                );
                Ok(StartOutcome::Started(attempt))
            }
            InsertOutcome::Duplicate(winner) => {
                tracing::info!(
                    attempt_id = %winner.id,
                    test_id = %winner.test_id,
                    user_id = %winner.user_id,
                    attempt_number = winner.attempt_number,
                    "Concurrent start resolved to the existing attempt"
                );
                Ok(StartOutcome::Resumed(winner))
            }
        }
    }

    /// Removes the learner's preview attempts and their usages.
    pub async fn delete_previews(&self, test_id: &str, user_id: &str) -> AttemptResult<u64> {
        let removed = self.store.delete_previews(test_id, user_id).await?;
        if removed > 0 {
            tracing::info!(test_id, user_id, removed, "Deleted preview attempts");
        }
        Ok(removed)
    }

    async fn load_history(&self, attempts: &[&Attempt]) -> AttemptResult<Vec<PastAttempt>> {
        let mut history = Vec::with_capacity(attempts.len());
        for attempt in attempts {
            history.push(PastAttempt {
                attempt_number: attempt.attempt_number,
                usage: self.load_usage(attempt).await?,
            });
        }
        Ok(history)
    }
}

pub(super) fn used_item_ids(usage: &dyn ItemUsage) -> Vec<String> {
    (1..=usage.slot_count())
        .filter_map(|slot| usage.item(slot).map(|item| item.id.clone()))
        .collect()
}
