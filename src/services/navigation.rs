//! Read-only queries over an attempt's realised layout.

use std::collections::{BTreeMap, HashSet};

use crate::db::types::NavigationMode;
use crate::services::attempt::Attempt;
use crate::services::layout::{number_items, DisplayNumber, SlotNumber};
use crate::services::test_definition::TestDefinition;
use crate::services::usage::{ItemState, ItemUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSelector {
    Page(usize),
    All,
}

/// Whether the learner may open `page`; `None` is the summary page.
///
/// Free navigation allows everything. Sequential navigation allows the summary,
/// the current page and, with `allow_next`, the page after it. Reviews of
/// finished attempts are never restricted.
pub fn check_page_access(
    attempt: &Attempt,
    navigation: NavigationMode,
    page: Option<usize>,
    allow_next: bool,
) -> bool {
    if navigation != NavigationMode::Sequential || attempt.is_finished() {
        return true;
    }
    match page {
        None => true,
        Some(page) => {
            page == attempt.current_page || (allow_next && page == attempt.current_page + 1)
        }
    }
}

pub struct AttemptNavigator<'a> {
    attempt: &'a Attempt,
    test: &'a TestDefinition,
    usage: &'a dyn ItemUsage,
    numbers: BTreeMap<SlotNumber, DisplayNumber>,
    first_in_section: HashSet<SlotNumber>,
}

impl<'a> AttemptNavigator<'a> {
    pub fn new(attempt: &'a Attempt, test: &'a TestDefinition, usage: &'a dyn ItemUsage) -> Self {
        let numbers = number_items(&attempt.layout, |slot| {
            usage.item(slot).map(|item| item.length).unwrap_or(0)
        });
        let first_in_section = attempt.layout.first_in_section(&test.sections);
        Self { attempt, test, usage, numbers, first_in_section }
    }

    pub fn page_count(&self) -> usize {
        self.attempt.layout.page_count()
    }

    pub fn slots_for_page(&self, page: PageSelector) -> Vec<SlotNumber> {
        match page {
            PageSelector::All => self.attempt.layout.slots().collect(),
            PageSelector::Page(page) => {
                self.attempt.layout.page(page).map(<[SlotNumber]>::to_vec).unwrap_or_default()
            }
        }
    }

    /// Page holding `slot`. Redo slots report their original slot's page.
    pub fn page_of_slot(&self, slot: SlotNumber) -> Option<usize> {
        let slot = self.attempt.original_slot(slot);
        self.attempt.layout.pages().iter().position(|page| page.contains(&slot))
    }

    pub fn is_last_page(&self, page: usize) -> bool {
        self.page_count().checked_sub(1) == Some(page)
    }

    pub fn clamp_page_number(&self, requested: i64) -> usize {
        let last = self.page_count().saturating_sub(1);
        usize::try_from(requested.max(0)).map_or(last, |page| page.min(last))
    }

    pub fn display_number(&self, slot: SlotNumber) -> Option<DisplayNumber> {
        self.numbers.get(&self.attempt.original_slot(slot)).copied()
    }

    /// Section heading to show before `slot`, if it opens a section here.
    pub fn heading_before(&self, slot: SlotNumber) -> Option<&'a str> {
        if !self.first_in_section.contains(&slot) {
            return None;
        }
        self.test
            .section_of(slot)
            .and_then(|section| section.heading.as_deref())
            .filter(|heading| !heading.trim().is_empty())
    }

    /// True when `slot` must wait for the previous item to be finished.
    pub fn is_blocked_by_previous(&self, slot: SlotNumber) -> bool {
        if slot <= 1 {
            return false;
        }
        let Some(definition) = self.test.slot(slot) else {
            return false;
        };
        let previous = slot - 1;
        let shuffled =
            |slot| self.test.section_of(slot).is_some_and(|section| section.shuffle_items);

        definition.requires_previous
            && !shuffled(slot)
            && !shuffled(previous)
            && self.test.navigation != NavigationMode::Sequential
            && !self.usage.item_state(previous).is_finished()
            && self.usage.can_item_finish_mid_attempt(previous)
    }

    /// Slots on `page` the learner can actually interact with.
    pub fn active_slots(&self, page: PageSelector) -> Vec<SlotNumber> {
        self.slots_for_page(page)
            .into_iter()
            .filter(|&slot| !self.is_blocked_by_previous(slot))
            .collect()
    }

    pub fn check_page_access(&self, page: Option<usize>, allow_next: bool) -> bool {
        check_page_access(self.attempt, self.test.navigation, page, allow_next)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavButton {
    pub slot: SlotNumber,
    pub number: Option<DisplayNumber>,
    pub page: usize,
    /// `None` when sequential navigation forbids jumping there.
    pub url: Option<String>,
    pub state: ItemState,
    pub is_current_page: bool,
    pub is_blocked: bool,
    pub heading: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavControl {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavPanel {
    pub buttons: Vec<NavButton>,
    pub controls: Vec<NavControl>,
}

/// Builds the navigation panel. Where buttons link to and which controls close
/// the panel differ between attempt and review pages, so both are injected.
pub fn build_nav_panel(
    navigator: &AttemptNavigator<'_>,
    current_page: Option<usize>,
    slot_url: impl Fn(SlotNumber, usize) -> String,
    trailing_controls: impl Fn(&Attempt) -> Vec<NavControl>,
) -> NavPanel {
    let buttons = navigator
        .attempt
        .layout
        .pages()
        .iter()
        .enumerate()
        .flat_map(|(page, slots)| slots.iter().map(move |&slot| (page, slot)))
        .map(|(page, slot)| NavButton {
            slot,
            number: navigator.display_number(slot),
            page,
            url: navigator.check_page_access(Some(page), false).then(|| slot_url(slot, page)),
            state: navigator.usage.item_state(slot),
            is_current_page: current_page == Some(page),
            is_blocked: navigator.is_blocked_by_previous(slot),
            heading: navigator.heading_before(slot).map(str::to_string),
        })
        .collect();

    NavPanel { buttons, controls: trailing_controls(navigator.attempt) }
}
