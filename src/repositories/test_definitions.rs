use sqlx::PgExecutor;
use time::Duration;

use crate::db::models::{OverrideRow, SectionRow, SlotRow, TestRow};
use crate::db::types::{NavigationMode, OverdueHandling};
use crate::repositories::StoreError;
use crate::services::access::{AttemptLimit, Bound, TestTiming, TimeLimit, TimingOverride};
use crate::services::layout::{ItemsPerPage, SectionArena, SectionDefinition};
use crate::services::test_definition::{
    ItemRef, RandomSlot, SlotDefinition, SlotSource, TestDefinition,
};

pub(crate) const COLUMNS: &str = "\
    id, course_id, items_per_page, navigation, overdue_handling, grace_period_seconds, \
    sum_grades, grade, can_redo_items, build_on_last, attempts_allowed, \
    time_open, time_close, time_limit_seconds";

pub(crate) async fn find_row(
    executor: impl PgExecutor<'_>,
    test_id: &str,
) -> Result<Option<TestRow>, sqlx::Error> {
    sqlx::query_as::<_, TestRow>(&format!("SELECT {COLUMNS} FROM tests WHERE id = $1"))
        .bind(test_id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn list_sections(
    executor: impl PgExecutor<'_>,
    test_id: &str,
) -> Result<Vec<SectionRow>, sqlx::Error> {
    sqlx::query_as::<_, SectionRow>(
        "SELECT first_slot, heading, shuffle_items FROM test_sections \
         WHERE test_id = $1 ORDER BY first_slot",
    )
    .bind(test_id)
    .fetch_all(executor)
    .await
}

pub(crate) async fn list_slots(
    executor: impl PgExecutor<'_>,
    test_id: &str,
) -> Result<Vec<SlotRow>, sqlx::Error> {
    sqlx::query_as::<_, SlotRow>(
        "SELECT slot, page, requires_previous, max_mark, item_id, item_variants, item_length, \
                random_category, include_subcategories, exclude_tags \
         FROM test_slots WHERE test_id = $1 ORDER BY slot",
    )
    .bind(test_id)
    .fetch_all(executor)
    .await
}

/// The learner's own override plus the overrides of every group they belong to.
pub(crate) async fn list_overrides_for_user(
    executor: impl PgExecutor<'_>,
    test_id: &str,
    user_id: &str,
) -> Result<Vec<OverrideRow>, sqlx::Error> {
    sqlx::query_as::<_, OverrideRow>(
        "SELECT user_id, group_id, time_open, time_close, time_limit_seconds, attempts \
         FROM test_overrides \
         WHERE test_id = $1 \
           AND (user_id = $2 \
                OR group_id IN (SELECT group_id FROM group_members WHERE user_id = $2))",
    )
    .bind(test_id)
    .bind(user_id)
    .fetch_all(executor)
    .await
}

pub(crate) fn into_definition(
    row: TestRow,
    sections: Vec<SectionRow>,
    slots: Vec<SlotRow>,
) -> Result<TestDefinition, StoreError> {
    let slots = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot_definition(index, slot))
        .collect::<Result<Vec<_>, _>>()?;

    let section_definitions = sections
        .into_iter()
        .map(|section| SectionDefinition {
            first_slot: u32::try_from(section.first_slot).unwrap_or(0),
            heading: section.heading,
            shuffle_items: section.shuffle_items,
        })
        .collect();
    let sections = SectionArena::new(section_definitions, slots.len() as u32)
        .map_err(|err| StoreError::Serialization(format!("test {}: {err}", row.id)))?;

    Ok(TestDefinition {
        items_per_page: ItemsPerPage::from_legacy(row.items_per_page),
        navigation: NavigationMode::from_setting(&row.navigation),
        overdue_handling: OverdueHandling::from_setting(&row.overdue_handling),
        grace_period: Duration::seconds(row.grace_period_seconds.max(0)),
        sum_grades: row.sum_grades,
        grade: row.grade,
        can_redo_items: row.can_redo_items,
        build_on_last: row.build_on_last,
        timing: TestTiming {
            time_open: Bound::from_legacy(row.time_open),
            time_close: Bound::from_legacy(row.time_close),
            time_limit: TimeLimit::from_legacy_seconds(row.time_limit_seconds),
            attempts_allowed: AttemptLimit::from_legacy(row.attempts_allowed),
        },
        sections,
        slots,
        id: row.id,
        course_id: row.course_id,
    })
}

fn slot_definition(index: usize, row: SlotRow) -> Result<SlotDefinition, StoreError> {
    let expected = index as i64 + 1;
    if i64::from(row.slot) != expected {
        return Err(StoreError::Serialization(format!(
            "slots are not numbered contiguously: expected {expected}, found {}",
            row.slot
        )));
    }

    let source = match (row.item_id, row.random_category) {
        (Some(id), _) => SlotSource::Fixed(ItemRef {
            id,
            variant_count: u32::try_from(row.item_variants).unwrap_or(1).max(1),
            length: u32::try_from(row.item_length).unwrap_or(0),
        }),
        (None, Some(category)) => SlotSource::Random(RandomSlot {
            category,
            include_subcategories: row.include_subcategories,
            exclude_tags: row.exclude_tags.0,
        }),
        (None, None) => {
            return Err(StoreError::Serialization(format!(
                "slot {} has neither an item nor a random category",
                row.slot
            )))
        }
    };

    Ok(SlotDefinition {
        slot: expected as u32,
        page: u32::try_from(row.page).unwrap_or(0),
        requires_previous: row.requires_previous,
        max_mark: row.max_mark,
        source,
    })
}

/// Splits stored overrides into the user's own and the group ones.
pub(crate) fn split_overrides(
    rows: &[OverrideRow],
) -> (Option<TimingOverride>, Vec<TimingOverride>) {
    let to_override = |row: &OverrideRow| TimingOverride {
        time_open: row.time_open.map(Bound::from_legacy),
        time_close: row.time_close.map(Bound::from_legacy),
        time_limit: row.time_limit_seconds.map(TimeLimit::from_legacy_seconds),
        attempts: row.attempts.map(AttemptLimit::from_legacy),
    };

    let user = rows.iter().find(|row| row.user_id.is_some()).map(to_override);
    let groups = rows.iter().filter(|row| row.group_id.is_some()).map(to_override).collect();
    (user, groups)
}
