//! Page layout for an attempt.
//!
//! A layout is an ordered list of pages, each an ordered list of slot numbers. At the
//! persistence edge it is flattened into `"1,2,0,3,0"`, where `0` closes a page.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::num::NonZeroU32;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 1-based position of an item within an attempt.
pub type SlotNumber = u32;

/// Flattened-layout sentinel that closes a page.
pub const PAGE_BREAK: SlotNumber = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("invalid layout token '{0}'")]
    InvalidToken(String),
    #[error("slot {0} appears more than once in the layout")]
    DuplicateSlot(SlotNumber),
    #[error("first section must start at slot 1, found {0}")]
    FirstSectionNotAtStart(SlotNumber),
    #[error("section starting at slot {first_slot} is out of order or beyond {slot_count} slots")]
    SectionOutOfRange { first_slot: SlotNumber, slot_count: u32 },
    #[error("{0} slots defined but no section covers them")]
    NoSections(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemsPerPage {
    Unlimited,
    Limited(NonZeroU32),
}

impl ItemsPerPage {
    /// Legacy encoding: `0` (or anything non-positive) means no limit.
    pub fn from_legacy(value: i32) -> Self {
        u32::try_from(value)
            .ok()
            .and_then(NonZeroU32::new)
            .map(Self::Limited)
            .unwrap_or(Self::Unlimited)
    }

    pub fn to_legacy(self) -> i32 {
        match self {
            Self::Unlimited => 0,
            Self::Limited(n) => i32::try_from(n.get()).unwrap_or(i32::MAX),
        }
    }

    fn page_is_full(self, items_on_page: u32) -> bool {
        match self {
            Self::Unlimited => false,
            Self::Limited(n) => items_on_page >= n.get(),
        }
    }
}

/// Static definition of a section as configured on the test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDefinition {
    pub first_slot: SlotNumber,
    pub heading: Option<String>,
    pub shuffle_items: bool,
}

/// A section with its slot range resolved once at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub first_slot: SlotNumber,
    pub last_slot: SlotNumber,
    pub heading: Option<String>,
    pub shuffle_items: bool,
}

impl Section {
    pub fn is_empty(&self) -> bool {
        self.last_slot < self.first_slot
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotNumber> {
        self.first_slot..=self.last_slot
    }

    pub fn contains(&self, slot: SlotNumber) -> bool {
        (self.first_slot..=self.last_slot).contains(&slot)
    }
}

pub type SectionIndex = usize;

/// Ordered sections partitioning `[1, slot_count]` without gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionArena {
    sections: Vec<Section>,
    slot_count: u32,
}

impl SectionArena {
    pub fn new(definitions: Vec<SectionDefinition>, slot_count: u32) -> Result<Self, LayoutError> {
        if definitions.is_empty() {
            if slot_count > 0 {
                return Err(LayoutError::NoSections(slot_count));
            }
            return Ok(Self { sections: Vec::new(), slot_count });
        }

        if definitions[0].first_slot != 1 {
            return Err(LayoutError::FirstSectionNotAtStart(definitions[0].first_slot));
        }

        let mut sections = Vec::with_capacity(definitions.len());
        for (index, definition) in definitions.iter().enumerate() {
            let next_first = definitions
                .get(index + 1)
                .map(|next| next.first_slot)
                .unwrap_or(slot_count + 1);
            if next_first < definition.first_slot || definition.first_slot > slot_count + 1 {
                return Err(LayoutError::SectionOutOfRange {
                    first_slot: definition.first_slot,
                    slot_count,
                });
            }
            sections.push(Section {
                first_slot: definition.first_slot,
                last_slot: next_first - 1,
                heading: definition.heading.clone(),
                shuffle_items: definition.shuffle_items,
            });
        }

        Ok(Self { sections, slot_count })
    }

    /// Single unshuffled section covering every slot.
    pub fn single(slot_count: u32) -> Self {
        let sections = if slot_count == 0 {
            Vec::new()
        } else {
            vec![Section {
                first_slot: 1,
                last_slot: slot_count,
                heading: None,
                shuffle_items: false,
            }]
        };
        Self { sections, slot_count }
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn get(&self, index: SectionIndex) -> Option<&Section> {
        self.sections.get(index)
    }

    pub fn index_of(&self, slot: SlotNumber) -> Option<SectionIndex> {
        if slot == 0 || slot > self.slot_count {
            return None;
        }
        // Sorted by first_slot: the owner is the last section starting at or before `slot`.
        let position = self.sections.partition_point(|section| section.first_slot <= slot);
        position.checked_sub(1).filter(|&index| self.sections[index].contains(slot))
    }

    pub fn section_of(&self, slot: SlotNumber) -> Option<&Section> {
        self.index_of(slot).map(|index| &self.sections[index])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    pages: Vec<Vec<SlotNumber>>,
}

impl Layout {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds pages from a flattened sequence. Empty pages (double or trailing breaks) are dropped.
    pub fn from_flat(flat: &[SlotNumber]) -> Result<Self, LayoutError> {
        let mut seen = HashSet::new();
        let mut pages = Vec::new();
        let mut current = Vec::new();

        for &slot in flat {
            if slot == PAGE_BREAK {
                if !current.is_empty() {
                    pages.push(std::mem::take(&mut current));
                }
                continue;
            }
            if !seen.insert(slot) {
                return Err(LayoutError::DuplicateSlot(slot));
            }
            current.push(slot);
        }
        if !current.is_empty() {
            pages.push(current);
        }

        Ok(Self { pages })
    }

    pub fn from_storage(value: &str) -> Result<Self, LayoutError> {
        let flat = value
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<SlotNumber>()
                    .map_err(|_| LayoutError::InvalidToken(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_flat(&flat)
    }

    /// Flattened form with a break closing every page, e.g. `"1,2,0,3,0"`.
    pub fn to_storage(&self) -> String {
        self.to_flat().iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
    }

    pub fn to_flat(&self) -> Vec<SlotNumber> {
        let mut flat = Vec::with_capacity(self.slot_count() + self.pages.len());
        for page in &self.pages {
            flat.extend_from_slice(page);
            flat.push(PAGE_BREAK);
        }
        flat
    }

    pub fn pages(&self) -> &[Vec<SlotNumber>] {
        &self.pages
    }

    pub fn page(&self, page: usize) -> Option<&[SlotNumber]> {
        self.pages.get(page).map(Vec::as_slice)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    /// Slots in display order, left to right across pages.
    pub fn slots(&self) -> impl Iterator<Item = SlotNumber> + '_ {
        self.pages.iter().flatten().copied()
    }

    /// Slots that open a section in this attempt's realised (possibly shuffled) order.
    pub fn first_in_section(&self, sections: &SectionArena) -> HashSet<SlotNumber> {
        let mut seen_sections = HashSet::new();
        self.slots()
            .filter(|&slot| {
                sections.index_of(slot).is_some_and(|index| seen_sections.insert(index))
            })
            .collect()
    }
}

/// Lays a fresh attempt out page by page.
///
/// Shuffled sections are permuted with `rng` and packed `items_per_page` at a time.
/// Unshuffled sections keep static order and break wherever the static page hint
/// changes, or when a limited page is full. Every non-empty section ends with a
/// page break.
///
/// `page_hints[slot - 1]` is the static page of `slot`.
pub fn compute_layout<R: Rng + ?Sized>(
    sections: &SectionArena,
    page_hints: &[u32],
    items_per_page: ItemsPerPage,
    rng: &mut R,
) -> Layout {
    let mut flat = Vec::with_capacity(sections.slot_count() as usize * 2);

    for section in sections.sections().iter().filter(|section| !section.is_empty()) {
        if section.shuffle_items {
            let mut slots: Vec<SlotNumber> = section.slots().collect();
            slots.shuffle(rng);

            let mut on_page = 0;
            for slot in slots {
                if on_page > 0 && items_per_page.page_is_full(on_page) {
                    flat.push(PAGE_BREAK);
                    on_page = 0;
                }
                flat.push(slot);
                on_page += 1;
            }
        } else {
            let hint = |slot: SlotNumber| page_hints.get(slot as usize - 1).copied();
            let mut current_page = hint(section.first_slot);
            let mut on_page = 0;
            for slot in section.slots() {
                let hint_changed = current_page.is_some() && hint(slot) != current_page;
                if on_page > 0 && (hint_changed || items_per_page.page_is_full(on_page)) {
                    flat.push(PAGE_BREAK);
                    on_page = 0;
                }
                flat.push(slot);
                on_page += 1;
                current_page = hint(slot);
            }
        }

        flat.push(PAGE_BREAK);
    }

    match Layout::from_flat(&flat) {
        Ok(layout) => layout,
        Err(err) => panic!("layout engine produced an invalid layout: {err}"),
    }
}

/// Deterministic variant of [`compute_layout`] for a stored or test seed.
pub fn compute_layout_seeded(
    sections: &SectionArena,
    page_hints: &[u32],
    items_per_page: ItemsPerPage,
    shuffle_seed: u64,
) -> Layout {
    let mut rng = StdRng::seed_from_u64(shuffle_seed);
    compute_layout(sections, page_hints, items_per_page, &mut rng)
}

/// Carries a previous attempt's layout into a new attempt built on it.
///
/// Page breaks and relative order are preserved.
///
/// # Panics
///
/// Panics if an old slot has no mapping: that is a bug in the caller's remapping table.
pub fn remap_layout_for_build_on_last(
    old_layout: &Layout,
    old_slot_to_new_slot: &HashMap<SlotNumber, SlotNumber>,
) -> Layout {
    let flat: Vec<SlotNumber> = old_layout
        .to_flat()
        .into_iter()
        .map(|slot| {
            if slot == PAGE_BREAK {
                return PAGE_BREAK;
            }
            match old_slot_to_new_slot.get(&slot) {
                Some(&new_slot) => new_slot,
                None => panic!("slot {slot} of the previous attempt has no counterpart"),
            }
        })
        .collect();

    match Layout::from_flat(&flat) {
        Ok(layout) => layout,
        Err(err) => panic!("remapped layout is inconsistent: {err}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayNumber {
    Number(u32),
    /// Non-gradable item; does not consume a number.
    Info,
}

impl fmt::Display for DisplayNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Info => f.write_str("i"),
        }
    }
}

/// Numbers items left to right. `length_of(slot)` is how many numbers the item
/// consumes; `0` marks an info item.
pub fn number_items(
    layout: &Layout,
    length_of: impl Fn(SlotNumber) -> u32,
) -> BTreeMap<SlotNumber, DisplayNumber> {
    let mut next = 1;
    layout
        .slots()
        .map(|slot| match length_of(slot) {
            0 => (slot, DisplayNumber::Info),
            length => {
                let number = DisplayNumber::Number(next);
                next += length;
                (slot, number)
            }
        })
        .collect()
}
