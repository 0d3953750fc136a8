use std::collections::BTreeMap;

use time::PrimitiveDateTime;

use crate::db::types::AttemptState;
use crate::services::layout::{Layout, SlotNumber};

/// One learner's attempt at a test.
///
/// Only the attempt service mutates an attempt, and every mutation goes through
/// one of the transition methods below so the terminal-state invariants hold:
/// finished and abandoned attempts carry `time_finish` and no `time_check_state`,
/// and `sum_grades` is set exactly when the attempt is finished.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub id: String,
    pub test_id: String,
    pub user_id: String,
    pub usage_id: String,
    pub attempt_number: u32,
    pub state: AttemptState,
    pub is_preview: bool,
    pub layout: Layout,
    pub current_page: usize,
    pub time_start: PrimitiveDateTime,
    pub time_finish: Option<PrimitiveDateTime>,
    pub time_modified: PrimitiveDateTime,
    pub time_modified_offline: Option<PrimitiveDateTime>,
    pub time_check_state: Option<PrimitiveDateTime>,
    pub sum_grades: Option<f64>,
    /// Redo history: replacement slot -> the layout slot it was redone from.
    pub redo_links: BTreeMap<SlotNumber, SlotNumber>,
    /// Optimistic concurrency token, bumped by the store on every commit.
    pub revision: i64,
}

impl Attempt {
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// The layout slot a redo slot descends from, or `slot` itself.
    pub fn original_slot(&self, slot: SlotNumber) -> SlotNumber {
        self.redo_links.get(&slot).copied().unwrap_or(slot)
    }

    pub fn finish(&mut self, now: PrimitiveDateTime, time_finish: PrimitiveDateTime, total: f64) {
        self.time_modified = now;
        self.time_finish = Some(time_finish);
        self.sum_grades = Some(total);
        self.state = AttemptState::Finished;
        self.time_check_state = None;
    }

    /// Items are left as they are and no total is computed.
    pub fn abandon(&mut self, now: PrimitiveDateTime) {
        self.time_modified = now;
        self.time_finish = Some(now);
        self.state = AttemptState::Abandoned;
        self.time_check_state = None;
    }

    pub fn go_overdue(&mut self, now: PrimitiveDateTime, recheck_at: PrimitiveDateTime) {
        self.time_modified = now;
        self.state = AttemptState::Overdue;
        self.time_check_state = Some(recheck_at);
    }
}
