use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::macros::datetime;
use time::{Duration, PrimitiveDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core::config::AttemptSettings;
use crate::db::types::{AttemptState, NavigationMode, OverdueHandling};
use crate::repositories::memory::MemoryAttemptStore;
use crate::services::access::{AttemptLimit, TestTiming, TimeLimit};
use crate::services::attempt::Attempt;
use crate::services::attempts::AttemptService;
use crate::services::collaborators::{
    GradeAggregator, ItemSelector, RandomItemRequest, SelectionError,
};
use crate::services::layout::{
    ItemsPerPage, Layout, SectionArena, SectionDefinition, SlotNumber,
};
use crate::services::test_definition::{
    ItemRef, RandomSlot, SlotDefinition, SlotSource, TestDefinition,
};
use crate::services::usage::{
    FinishedOutcome, ItemState, ItemUsage, ItemUsageFactory, PageResponses, UsageError,
    VariantStrategy,
};

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

/// An open attempt at `test-1` by `user-1`, with every slot of a one-item test.
pub(crate) fn attempt_fixture() -> Attempt {
    let start = datetime!(2025-03-01 10:00:00);
    Attempt {
        id: "attempt-1".into(),
        test_id: "test-1".into(),
        user_id: "user-1".into(),
        usage_id: "usage-1".into(),
        attempt_number: 1,
        state: AttemptState::InProgress,
        is_preview: false,
        layout: Layout::from_flat(&[1, 0]).expect("fixture layout"),
        current_page: 0,
        time_start: start,
        time_finish: None,
        time_modified: start,
        time_modified_offline: None,
        time_check_state: None,
        sum_grades: None,
        redo_links: Default::default(),
        revision: 0,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FakeSlot {
    item: ItemRef,
    max_mark: f64,
    variant: Option<u32>,
    state: ItemState,
    steps: u32,
    fraction: Option<f64>,
    response: Option<serde_json::Value>,
}

impl FakeSlot {
    fn unstarted(item: ItemRef, max_mark: f64) -> Self {
        Self {
            item,
            max_mark,
            variant: None,
            state: ItemState::Unstarted,
            steps: 0,
            fraction: None,
            response: None,
        }
    }

    fn start(&mut self, variant: u32) {
        self.variant = Some(variant);
        self.state = ItemState::InProgress;
        self.steps = 1;
        self.fraction = None;
        self.response = None;
    }

    fn can_finish_early(&self) -> bool {
        !self.item.id.starts_with("essay")
    }
}

/// Item engine stand-in. A response `{"fraction": f, "finish": true}` grades the
/// item at `f * max_mark`; items whose id starts with `essay` only finish at
/// the end and then need manual grading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FakeUsage {
    id: String,
    slots: Vec<FakeSlot>,
    #[serde(skip)]
    fail_save: Arc<AtomicBool>,
}

impl FakeUsage {
    pub(crate) fn new(id: &str) -> Self {
        Self { id: id.to_string(), slots: Vec::new(), fail_save: Arc::default() }
    }

    /// A usage holding the fixed item of every slot, not yet started.
    pub(crate) fn for_test(test: &TestDefinition) -> Self {
        let mut usage = Self::new("usage-1");
        for definition in &test.slots {
            let item = match &definition.source {
                SlotSource::Fixed(item) => item.clone(),
                SlotSource::Random(random) => ItemRef {
                    id: format!("{}-{}", random.category, definition.slot),
                    variant_count: 1,
                    length: 1,
                },
            };
            usage.add_item(item, definition.max_mark);
        }
        usage
    }

    fn slot(&self, slot: SlotNumber) -> Option<&FakeSlot> {
        self.slots.get(usize::try_from(slot).ok()?.checked_sub(1)?)
    }

    fn slot_mut(&mut self, slot: SlotNumber) -> Result<&mut FakeSlot, UsageError> {
        let index = usize::try_from(slot).ok().and_then(|slot| slot.checked_sub(1));
        index.and_then(|index| self.slots.get_mut(index)).ok_or(UsageError::UnknownSlot(slot))
    }

    fn check_sequence(&self, responses: &PageResponses) -> Result<(), UsageError> {
        for (&slot, response) in &responses.slots {
            let current = self.slot(slot).ok_or(UsageError::UnknownSlot(slot))?;
            if response.sequence_check != current.steps {
                return Err(UsageError::OutOfSequence { slot });
            }
        }
        Ok(())
    }
}

impl ItemUsage for FakeUsage {
    fn id(&self) -> &str {
        &self.id
    }

    fn add_item(&mut self, item: ItemRef, max_mark: f64) -> SlotNumber {
        self.slots.push(FakeSlot::unstarted(item, max_mark));
        self.slots.len() as SlotNumber
    }

    fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    fn item(&self, slot: SlotNumber) -> Option<&ItemRef> {
        self.slot(slot).map(|slot| &slot.item)
    }

    fn variant(&self, slot: SlotNumber) -> Option<u32> {
        self.slot(slot).and_then(|slot| slot.variant)
    }

    fn start_items(&mut self, strategy: &dyn VariantStrategy, _now: PrimitiveDateTime) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == ItemState::Unstarted {
                let variant = strategy.choose_variant(index as SlotNumber + 1, &slot.item);
                slot.start(variant);
            }
        }
    }

    fn start_item(
        &mut self,
        slot: SlotNumber,
        variant: u32,
        _now: PrimitiveDateTime,
    ) -> Result<(), UsageError> {
        self.slot_mut(slot)?.start(variant);
        Ok(())
    }

    fn start_item_based_on(
        &mut self,
        slot: SlotNumber,
        previous: &dyn ItemUsage,
        previous_slot: SlotNumber,
        _now: PrimitiveDateTime,
    ) -> Result<(), UsageError> {
        let variant = previous.variant(previous_slot).unwrap_or(1);
        let response = previous.latest_response(previous_slot);
        let target = self.slot_mut(slot)?;
        target.start(variant);
        target.fraction = response.as_ref().and_then(|data| data["fraction"].as_f64());
        target.response = response;
        Ok(())
    }

    fn add_item_in_place_of_other(
        &mut self,
        slot: SlotNumber,
        item: ItemRef,
    ) -> Result<SlotNumber, UsageError> {
        let target = self.slot_mut(slot)?;
        let fresh = FakeSlot::unstarted(item, target.max_mark);
        let displaced = std::mem::replace(target, fresh);
        self.slots.push(displaced);
        Ok(self.slots.len() as SlotNumber)
    }

    fn process_actions(
        &mut self,
        _now: PrimitiveDateTime,
        responses: &PageResponses,
    ) -> Result<(), UsageError> {
        self.check_sequence(responses)?;
        for (&slot, response) in &responses.slots {
            let target = self.slot_mut(slot)?;
            target.steps += 1;
            if let Some(fraction) = response.data["fraction"].as_f64() {
                target.fraction = Some(fraction);
            }
            target.response = Some(response.data.clone());
            if response.data["finish"].as_bool() == Some(true) && target.can_finish_early() {
                target.state = ItemState::Finished(FinishedOutcome::Graded);
            }
        }
        Ok(())
    }

    fn process_autosaves(
        &mut self,
        _now: PrimitiveDateTime,
        responses: &PageResponses,
    ) -> Result<(), UsageError> {
        self.check_sequence(responses)?;
        for (&slot, response) in &responses.slots {
            self.slot_mut(slot)?.response = Some(response.data.clone());
        }
        Ok(())
    }

    fn finish_all(&mut self, _now: PrimitiveDateTime) {
        for slot in &mut self.slots {
            if slot.state != ItemState::InProgress {
                continue;
            }
            slot.state = match (slot.can_finish_early(), slot.fraction, &slot.response) {
                (false, _, Some(_)) => ItemState::Finished(FinishedOutcome::NeedsGrading),
                (true, Some(_), _) => ItemState::Finished(FinishedOutcome::Graded),
                _ => ItemState::Finished(FinishedOutcome::GaveUp),
            };
        }
    }

    fn total_mark(&self) -> f64 {
        self.slots
            .iter()
            .filter(|slot| slot.state == ItemState::Finished(FinishedOutcome::Graded))
            .map(|slot| slot.fraction.unwrap_or(0.0) * slot.max_mark)
            .sum()
    }

    fn item_state(&self, slot: SlotNumber) -> ItemState {
        self.slot(slot).map_or(ItemState::Unstarted, |slot| slot.state)
    }

    fn latest_response(&self, slot: SlotNumber) -> Option<serde_json::Value> {
        self.slot(slot).and_then(|slot| slot.response.clone())
    }

    fn can_item_finish_mid_attempt(&self, slot: SlotNumber) -> bool {
        self.slot(slot).is_some_and(FakeSlot::can_finish_early)
    }

    fn max_mark(&self, slot: SlotNumber) -> f64 {
        self.slot(slot).map_or(0.0, |slot| slot.max_mark)
    }

    fn set_max_mark(&mut self, slot: SlotNumber, max_mark: f64) -> Result<(), UsageError> {
        self.slot_mut(slot)?.max_mark = max_mark;
        Ok(())
    }

    fn save(&self) -> Result<serde_json::Value, UsageError> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(UsageError::Save(String::from("injected save failure")));
        }
        serde_json::to_value(self).map_err(|err| UsageError::Save(err.to_string()))
    }
}

/// Creates and restores [`FakeUsage`]s sharing one save-failure switch.
#[derive(Debug, Default)]
pub(crate) struct FakeUsageFactory {
    fail_save: Arc<AtomicBool>,
}

impl FakeUsageFactory {
    pub(crate) fn fail_saves(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }
}

impl ItemUsageFactory for FakeUsageFactory {
    fn create(&self, usage_id: &str) -> Box<dyn ItemUsage> {
        let mut usage = FakeUsage::new(usage_id);
        usage.fail_save = self.fail_save.clone();
        Box::new(usage)
    }

    fn restore(
        &self,
        usage_id: &str,
        state: serde_json::Value,
    ) -> Result<Box<dyn ItemUsage>, UsageError> {
        let mut usage: FakeUsage = serde_json::from_value(state)
            .map_err(|err| UsageError::Corrupt(format!("{usage_id}: {err}")))?;
        usage.id = usage_id.to_string();
        usage.fail_save = self.fail_save.clone();
        Ok(Box::new(usage))
    }
}

/// Serves items per category in insertion order, skipping ones already used.
#[derive(Debug, Default)]
pub(crate) struct FakeSelector {
    pools: HashMap<String, Vec<ItemRef>>,
}

impl FakeSelector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_items(mut self, category: &str, ids: &[&str]) -> Self {
        let pool = self.pools.entry(category.to_string()).or_default();
        pool.extend(
            ids.iter().map(|id| ItemRef { id: id.to_string(), variant_count: 1, length: 1 }),
        );
        self
    }
}

#[async_trait]
impl ItemSelector for FakeSelector {
    async fn next_item(
        &self,
        request: RandomItemRequest<'_>,
    ) -> Result<Option<ItemRef>, SelectionError> {
        let used: HashSet<&str> = request.already_used.iter().map(String::as_str).collect();
        Ok(self
            .pools
            .get(&request.slot.category)
            .and_then(|pool| pool.iter().find(|item| !used.contains(item.id.as_str())))
            .cloned())
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingGrades {
    calls: std::sync::Mutex<Vec<(String, String)>>,
}

impl RecordingGrades {
    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GradeAggregator for RecordingGrades {
    async fn attempt_finished(&self, test_id: &str, user_id: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .map_err(|_| anyhow::anyhow!("grade recorder poisoned"))?
            .push((test_id.to_string(), user_id.to_string()));
        Ok(())
    }
}

/// An attempt service over the in-memory store and fake collaborators.
pub(crate) struct Harness {
    pub(crate) store: Arc<MemoryAttemptStore>,
    pub(crate) usages: Arc<FakeUsageFactory>,
    pub(crate) grades: Arc<RecordingGrades>,
    pub(crate) service: AttemptService,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_selector(FakeSelector::new())
    }

    pub(crate) fn with_selector(selector: FakeSelector) -> Self {
        let store = Arc::new(MemoryAttemptStore::new());
        let usages = Arc::new(FakeUsageFactory::default());
        let grades = Arc::new(RecordingGrades::default());
        let service = AttemptService::new(
            store.clone(),
            usages.clone(),
            Arc::new(selector),
            grades.clone(),
            AttemptSettings::default(),
        );
        Self { store, usages, grades, service }
    }
}

/// Builds a `test-1` definition with `n` fixed one-mark items `item-1..=item-n`,
/// one unshuffled section and every slot on page 1.
pub(crate) struct TestBuilder {
    slot_count: u32,
    items_per_page: ItemsPerPage,
    navigation: NavigationMode,
    overdue_handling: OverdueHandling,
    grace_period: Duration,
    grades: Option<(f64, f64)>,
    can_redo_items: bool,
    build_on_last: bool,
    timing: TestTiming,
    variants: u32,
    sections: Vec<SectionDefinition>,
    requires_previous: HashSet<SlotNumber>,
    essays: HashSet<SlotNumber>,
    random: HashMap<SlotNumber, String>,
}

impl TestBuilder {
    pub(crate) fn new(slot_count: u32) -> Self {
        Self {
            slot_count,
            items_per_page: ItemsPerPage::Unlimited,
            navigation: NavigationMode::Free,
            overdue_handling: OverdueHandling::AutoSubmit,
            grace_period: Duration::ZERO,
            grades: None,
            can_redo_items: false,
            build_on_last: false,
            timing: TestTiming::default(),
            variants: 1,
            sections: vec![SectionDefinition {
                first_slot: 1,
                heading: None,
                shuffle_items: false,
            }],
            requires_previous: HashSet::new(),
            essays: HashSet::new(),
            random: HashMap::new(),
        }
    }

    pub(crate) fn items_per_page(mut self, per_page: u32) -> Self {
        self.items_per_page =
            NonZeroU32::new(per_page).map_or(ItemsPerPage::Unlimited, ItemsPerPage::Limited);
        self
    }

    pub(crate) fn navigation(mut self, navigation: NavigationMode) -> Self {
        self.navigation = navigation;
        self
    }

    pub(crate) fn overdue_handling(mut self, handling: OverdueHandling) -> Self {
        self.overdue_handling = handling;
        self
    }

    pub(crate) fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub(crate) fn time_limit(mut self, limit: Duration) -> Self {
        self.timing.time_limit = TimeLimit::Limited(limit);
        self
    }

    pub(crate) fn attempts_allowed(mut self, attempts: u32) -> Self {
        self.timing.attempts_allowed =
            NonZeroU32::new(attempts).map_or(AttemptLimit::Unlimited, AttemptLimit::Limited);
        self
    }

    /// Overrides the total achievable mark and the displayed grade.
    pub(crate) fn grades(mut self, sum_grades: f64, grade: f64) -> Self {
        self.grades = Some((sum_grades, grade));
        self
    }

    pub(crate) fn can_redo(mut self) -> Self {
        self.can_redo_items = true;
        self
    }

    pub(crate) fn build_on_last(mut self) -> Self {
        self.build_on_last = true;
        self
    }

    /// Number of variants of every fixed item.
    pub(crate) fn variants(mut self, variants: u32) -> Self {
        self.variants = variants;
        self
    }

    /// `(first_slot, shuffle_items, heading)` per section.
    pub(crate) fn sections(mut self, sections: Vec<(SlotNumber, bool, Option<&str>)>) -> Self {
        self.sections = sections
            .into_iter()
            .map(|(first_slot, shuffle_items, heading)| SectionDefinition {
                first_slot,
                heading: heading.map(str::to_string),
                shuffle_items,
            })
            .collect();
        self
    }

    pub(crate) fn requires_previous(mut self, slot: SlotNumber) -> Self {
        self.requires_previous.insert(slot);
        self
    }

    /// Makes `slot` an item that cannot finish before the attempt does.
    pub(crate) fn essay(mut self, slot: SlotNumber) -> Self {
        self.essays.insert(slot);
        self
    }

    pub(crate) fn random(mut self, slot: SlotNumber, category: &str) -> Self {
        self.random.insert(slot, category.to_string());
        self
    }

    pub(crate) fn build(self) -> TestDefinition {
        let slots: Vec<SlotDefinition> = (1..=self.slot_count)
            .map(|slot| {
                let source = match self.random.get(&slot) {
                    Some(category) => SlotSource::Random(RandomSlot {
                        category: category.clone(),
                        include_subcategories: false,
                        exclude_tags: Vec::new(),
                    }),
                    None => {
                        let prefix = if self.essays.contains(&slot) { "essay" } else { "item" };
                        SlotSource::Fixed(ItemRef {
                            id: format!("{prefix}-{slot}"),
                            variant_count: self.variants,
                            length: 1,
                        })
                    }
                };
                SlotDefinition {
                    slot,
                    page: 1,
                    requires_previous: self.requires_previous.contains(&slot),
                    max_mark: 1.0,
                    source,
                }
            })
            .collect();

        let (sum_grades, grade) = self.grades.unwrap_or((f64::from(self.slot_count), 10.0));
        TestDefinition {
            id: "test-1".into(),
            course_id: "course-1".into(),
            items_per_page: self.items_per_page,
            navigation: self.navigation,
            overdue_handling: self.overdue_handling,
            grace_period: self.grace_period,
            sum_grades,
            grade,
            can_redo_items: self.can_redo_items,
            build_on_last: self.build_on_last,
            timing: self.timing,
            sections: SectionArena::new(self.sections, self.slot_count).expect("test sections"),
            slots,
        }
    }
}
