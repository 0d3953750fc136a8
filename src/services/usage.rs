//! Contract with the item-response engine.
//!
//! The engine owns every item's internal state and marks. The attempt service
//! drives it through [`ItemUsage`] and persists it as one opaque JSON document.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::services::layout::SlotNumber;
use crate::services::test_definition::ItemRef;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("responses for slot {slot} are out of sequence")]
    OutOfSequence { slot: SlotNumber },
    #[error("slot {0} does not exist in this usage")]
    UnknownSlot(SlotNumber),
    #[error("failed to save item usage: {0}")]
    Save(String),
    #[error("stored item usage is unreadable: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedOutcome {
    Graded,
    GaveUp,
    NeedsGrading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Unstarted,
    InProgress,
    Finished(FinishedOutcome),
}

impl ItemState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotResponse {
    /// Step count the form was rendered against; stale values are out of sequence.
    pub sequence_check: u32,
    pub data: serde_json::Value,
}

/// Responses posted from one page, keyed by slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageResponses {
    pub slots: BTreeMap<SlotNumber, SlotResponse>,
}

impl PageResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, slot: SlotNumber, sequence_check: u32, data: serde_json::Value) -> Self {
        self.slots.insert(slot, SlotResponse { sequence_check, data });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub trait ItemUsage: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// Appends an item and returns its slot, numbered from 1.
    fn add_item(&mut self, item: ItemRef, max_mark: f64) -> SlotNumber;

    fn slot_count(&self) -> u32;

    fn item(&self, slot: SlotNumber) -> Option<&ItemRef>;

    fn variant(&self, slot: SlotNumber) -> Option<u32>;

    /// Starts every unstarted item, picking variants through `strategy`.
    fn start_items(&mut self, strategy: &dyn VariantStrategy, now: PrimitiveDateTime);

    fn start_item(
        &mut self,
        slot: SlotNumber,
        variant: u32,
        now: PrimitiveDateTime,
    ) -> Result<(), UsageError>;

    /// Starts `slot` carrying over the responses of `previous_slot` in `previous`.
    fn start_item_based_on(
        &mut self,
        slot: SlotNumber,
        previous: &dyn ItemUsage,
        previous_slot: SlotNumber,
        now: PrimitiveDateTime,
    ) -> Result<(), UsageError>;

    /// Moves the item in `slot` to a new slot at the end and puts `item` in its
    /// place, unstarted. Returns the new slot of the displaced item.
    fn add_item_in_place_of_other(
        &mut self,
        slot: SlotNumber,
        item: ItemRef,
    ) -> Result<SlotNumber, UsageError>;

    fn process_actions(
        &mut self,
        now: PrimitiveDateTime,
        responses: &PageResponses,
    ) -> Result<(), UsageError>;

    /// Stores draft responses without grading them.
    fn process_autosaves(
        &mut self,
        now: PrimitiveDateTime,
        responses: &PageResponses,
    ) -> Result<(), UsageError>;

    fn finish_all(&mut self, now: PrimitiveDateTime);

    fn total_mark(&self) -> f64;

    fn item_state(&self, slot: SlotNumber) -> ItemState;

    /// Latest response data recorded for `slot`, if any.
    fn latest_response(&self, slot: SlotNumber) -> Option<serde_json::Value>;

    fn can_item_finish_mid_attempt(&self, slot: SlotNumber) -> bool;

    fn max_mark(&self, slot: SlotNumber) -> f64;

    fn set_max_mark(&mut self, slot: SlotNumber, max_mark: f64) -> Result<(), UsageError>;

    /// Serialises the whole usage for persistence.
    fn save(&self) -> Result<serde_json::Value, UsageError>;
}

pub trait ItemUsageFactory: Send + Sync {
    fn create(&self, usage_id: &str) -> Box<dyn ItemUsage>;

    fn restore(
        &self,
        usage_id: &str,
        state: serde_json::Value,
    ) -> Result<Box<dyn ItemUsage>, UsageError>;
}

/// Picks which variant (1-based) of a multi-variant item a slot gets.
pub trait VariantStrategy: Send + Sync {
    fn choose_variant(&self, slot: SlotNumber, item: &ItemRef) -> u32;
}

/// Prefers variants the learner has never seen, then the one seen longest ago.
#[derive(Debug, Clone, Default)]
pub struct LeastUsedVariants {
    /// item id -> variant -> most recent attempt number that used it
    last_used: HashMap<String, HashMap<u32, u32>>,
}

impl LeastUsedVariants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, attempt_number: u32, item_id: &str, variant: u32) {
        let seen =
            self.last_used.entry(item_id.to_string()).or_default().entry(variant).or_insert(0);
        *seen = (*seen).max(attempt_number);
    }

    /// Records every started item of an earlier attempt's usage.
    pub fn record_usage(&mut self, attempt_number: u32, usage: &dyn ItemUsage) {
        for slot in 1..=usage.slot_count() {
            if let (Some(item), Some(variant)) = (usage.item(slot), usage.variant(slot)) {
                self.record(attempt_number, &item.id, variant);
            }
        }
    }
}

impl VariantStrategy for LeastUsedVariants {
    fn choose_variant(&self, _slot: SlotNumber, item: &ItemRef) -> u32 {
        let history = self.last_used.get(&item.id);
        (1..=item.variant_count.max(1))
            .min_by_key(|variant| {
                let last = history.and_then(|seen| seen.get(variant)).copied();
                (last.is_some(), last.unwrap_or(0), *variant)
            })
            .unwrap_or(1)
    }
}

/// Fixed variants per slot, falling back to another strategy elsewhere.
pub struct ForcedVariants {
    forced: HashMap<SlotNumber, u32>,
    fallback: Box<dyn VariantStrategy>,
}

impl ForcedVariants {
    pub fn new(forced: HashMap<SlotNumber, u32>, fallback: Box<dyn VariantStrategy>) -> Self {
        Self { forced, fallback }
    }
}

impl VariantStrategy for ForcedVariants {
    fn choose_variant(&self, slot: SlotNumber, item: &ItemRef) -> u32 {
        match self.forced.get(&slot) {
            Some(&variant) => variant.clamp(1, item.variant_count.max(1)),
            None => self.fallback.choose_variant(slot, item),
        }
    }
}
