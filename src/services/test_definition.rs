use serde::{Deserialize, Serialize};
use time::Duration;

use crate::db::types::{NavigationMode, OverdueHandling};
use crate::services::access::TestTiming;
use crate::services::layout::{ItemsPerPage, Section, SectionArena, SlotNumber};

/// Totals below this are treated as zero when checking grade configuration.
pub const GRADE_EPSILON: f64 = 0.000_005;

/// Reference to a concrete item definition owned by the item bank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: String,
    pub variant_count: u32,
    /// Display numbers the item consumes; `0` for info items.
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomSlot {
    pub category: String,
    pub include_subcategories: bool,
    pub exclude_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotSource {
    Fixed(ItemRef),
    Random(RandomSlot),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotDefinition {
    pub slot: SlotNumber,
    /// Static page hint used by unshuffled sections.
    pub page: u32,
    pub requires_previous: bool,
    pub max_mark: f64,
    pub source: SlotSource,
}

/// Everything the attempt engine needs to know about one test.
#[derive(Debug, Clone)]
pub struct TestDefinition {
    pub id: String,
    pub course_id: String,
    pub items_per_page: ItemsPerPage,
    pub navigation: NavigationMode,
    pub overdue_handling: OverdueHandling,
    pub grace_period: Duration,
    /// Total achievable mark across all slots.
    pub sum_grades: f64,
    /// Maximum grade shown to learners.
    pub grade: f64,
    pub can_redo_items: bool,
    pub build_on_last: bool,
    pub timing: TestTiming,
    pub sections: SectionArena,
    pub slots: Vec<SlotDefinition>,
}

impl TestDefinition {
    pub fn slot(&self, slot: SlotNumber) -> Option<&SlotDefinition> {
        let index = usize::try_from(slot).ok()?.checked_sub(1)?;
        self.slots.get(index).filter(|definition| definition.slot == slot)
    }

    pub fn slot_count(&self) -> u32 {
        self.sections.slot_count()
    }

    pub fn section_of(&self, slot: SlotNumber) -> Option<&Section> {
        self.sections.section_of(slot)
    }

    /// Static page hints indexed by `slot - 1`.
    pub fn page_hints(&self) -> Vec<u32> {
        self.slots.iter().map(|slot| slot.page).collect()
    }

    /// A test that shows a non-zero grade must be able to award marks.
    pub fn has_consistent_grades(&self) -> bool {
        !(self.sum_grades < GRADE_EPSILON && self.grade > GRADE_EPSILON)
    }
}
