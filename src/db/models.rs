use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::AttemptState;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AttemptRow {
    pub id: String,
    pub test_id: String,
    pub user_id: String,
    pub usage_id: String,
    pub attempt_number: i32,
    pub state: AttemptState,
    pub is_preview: bool,
    pub layout: String,
    pub current_page: i32,
    pub time_start: PrimitiveDateTime,
    pub time_finish: Option<PrimitiveDateTime>,
    pub time_modified: PrimitiveDateTime,
    pub time_modified_offline: Option<PrimitiveDateTime>,
    pub time_check_state: Option<PrimitiveDateTime>,
    pub sum_grades: Option<f64>,
    pub redo_links: Json<Vec<RedoLinkRow>>,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RedoLinkRow {
    pub slot: u32,
    pub original_slot: u32,
}

#[derive(Debug, Clone, FromRow)]
pub struct UsageRow {
    pub id: String,
    pub state: Json<serde_json::Value>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TestRow {
    pub id: String,
    pub course_id: String,
    pub items_per_page: i32,
    pub navigation: String,
    pub overdue_handling: String,
    pub grace_period_seconds: i64,
    pub sum_grades: f64,
    pub grade: f64,
    pub can_redo_items: bool,
    pub build_on_last: bool,
    pub attempts_allowed: i32,
    pub time_open: i64,
    pub time_close: i64,
    pub time_limit_seconds: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SectionRow {
    pub first_slot: i32,
    pub heading: Option<String>,
    pub shuffle_items: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct SlotRow {
    pub slot: i32,
    pub page: i32,
    pub requires_previous: bool,
    pub max_mark: f64,
    pub item_id: Option<String>,
    pub item_variants: i32,
    pub item_length: i32,
    pub random_category: Option<String>,
    pub include_subcategories: bool,
    pub exclude_tags: Json<Vec<String>>,
}

/// One row of `test_overrides`. `NULL` means "not overridden"; `0` means unlimited.
#[derive(Debug, Clone, FromRow)]
pub struct OverrideRow {
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub time_open: Option<i64>,
    pub time_close: Option<i64>,
    pub time_limit_seconds: Option<i64>,
    pub attempts: Option<i32>,
}
