use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};
use time::PrimitiveDateTime;

use crate::db::models::{AttemptRow, RedoLinkRow, UsageRow};
use crate::repositories::test_definitions;
use crate::repositories::{AttemptStore, InsertOutcome, OpenAttemptFilter, StoreError};
use crate::services::access::{resolve_timing, TestTiming};
use crate::services::attempt::Attempt;
use crate::services::layout::Layout;
use crate::services::test_definition::TestDefinition;
use crate::services::usage::ItemUsage;

pub(crate) const COLUMNS: &str = "\
    id, test_id, user_id, usage_id, attempt_number, state, is_preview, layout, current_page, \
    time_start, time_finish, time_modified, time_modified_offline, time_check_state, \
    sum_grades, redo_links, revision";

/// Recomputes check times with the same deadline rule as `TestTiming::deadline`:
/// `min(time_start + limit, close)` where a user override wins field by field,
/// group overrides contribute their most lenient value and `0` means unlimited.
const RECHECK_PREFIX: &str = "\
    WITH group_rules AS (
        SELECT o.test_id, gm.user_id,
               CASE WHEN BOOL_OR(o.time_close = 0) THEN 0 ELSE MAX(o.time_close) END
                   AS time_close,
               CASE WHEN BOOL_OR(o.time_limit_seconds = 0) THEN 0
                    ELSE MAX(o.time_limit_seconds) END
                   AS time_limit_seconds
        FROM test_overrides o
        JOIN group_members gm ON gm.group_id = o.group_id
        GROUP BY o.test_id, gm.user_id
    ),
    candidates AS (
        SELECT a.id, a.state, a.is_preview, a.time_start, t.grace_period_seconds,
               COALESCE(uo.time_close, gr.time_close, t.time_close) AS time_close,
               COALESCE(uo.time_limit_seconds, gr.time_limit_seconds, t.time_limit_seconds)
                   AS time_limit_seconds
        FROM test_attempts a
        JOIN tests t ON t.id = a.test_id
        LEFT JOIN test_overrides uo ON uo.test_id = a.test_id AND uo.user_id = a.user_id
        LEFT JOIN group_rules gr ON gr.test_id = a.test_id AND gr.user_id = a.user_id
        WHERE a.state IN ('in_progress', 'overdue')";

const RECHECK_SUFFIX: &str = "
        FOR UPDATE OF a SKIP LOCKED
    ),
    deadlines AS (
        SELECT id, state, is_preview, grace_period_seconds,
               CASE
                   WHEN time_limit_seconds > 0 AND time_close > 0 THEN LEAST(
                       time_start + make_interval(secs => time_limit_seconds::double precision),
                       to_timestamp(time_close) AT TIME ZONE 'UTC')
                   WHEN time_limit_seconds > 0
                       THEN time_start + make_interval(secs => time_limit_seconds::double precision)
                   WHEN time_close > 0 THEN to_timestamp(time_close) AT TIME ZONE 'UTC'
               END AS deadline
        FROM candidates
    )
    UPDATE test_attempts a
    SET time_check_state = CASE
            WHEN d.is_preview OR d.deadline IS NULL THEN NULL
            WHEN d.state = 'overdue'
                THEN d.deadline + make_interval(secs => d.grace_period_seconds::double precision)
            ELSE d.deadline
        END
    FROM deadlines d
    WHERE a.id = d.id";

impl TryFrom<AttemptRow> for Attempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let layout = Layout::from_storage(&row.layout).map_err(|err| {
            StoreError::Serialization(format!("attempt {} layout: {err}", row.id))
        })?;

        Ok(Self {
            attempt_number: u32::try_from(row.attempt_number).map_err(|_| {
                StoreError::Serialization(format!("attempt {} has a negative number", row.id))
            })?,
            current_page: usize::try_from(row.current_page).unwrap_or(0),
            redo_links: row
                .redo_links
                .0
                .iter()
                .map(|link| (link.slot, link.original_slot))
                .collect(),
            id: row.id,
            test_id: row.test_id,
            user_id: row.user_id,
            usage_id: row.usage_id,
            state: row.state,
            is_preview: row.is_preview,
            layout,
            time_start: row.time_start,
            time_finish: row.time_finish,
            time_modified: row.time_modified,
            time_modified_offline: row.time_modified_offline,
            time_check_state: row.time_check_state,
            sum_grades: row.sum_grades,
            revision: row.revision,
        })
    }
}

fn redo_link_rows(attempt: &Attempt) -> Json<Vec<RedoLinkRow>> {
    Json(
        attempt
            .redo_links
            .iter()
            .map(|(&slot, &original_slot)| RedoLinkRow { slot, original_slot })
            .collect(),
    )
}

fn page_index(attempt: &Attempt) -> i32 {
    i32::try_from(attempt.current_page).unwrap_or(i32::MAX)
}

pub(crate) async fn find_by_id(
    executor: impl PgExecutor<'_>,
    id: &str,
) -> Result<Option<AttemptRow>, sqlx::Error> {
    sqlx::query_as::<_, AttemptRow>(&format!("SELECT {COLUMNS} FROM test_attempts WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn find_by_number(
    executor: impl PgExecutor<'_>,
    test_id: &str,
    user_id: &str,
    attempt_number: u32,
) -> Result<Option<AttemptRow>, sqlx::Error> {
    sqlx::query_as::<_, AttemptRow>(&format!(
        "SELECT {COLUMNS} FROM test_attempts \
         WHERE test_id = $1 AND user_id = $2 AND attempt_number = $3"
    ))
    .bind(test_id)
    .bind(user_id)
    .bind(attempt_number as i32)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn list_by_user(
    executor: impl PgExecutor<'_>,
    test_id: &str,
    user_id: &str,
) -> Result<Vec<AttemptRow>, sqlx::Error> {
    sqlx::query_as::<_, AttemptRow>(&format!(
        "SELECT {COLUMNS} FROM test_attempts \
         WHERE test_id = $1 AND user_id = $2 ORDER BY attempt_number"
    ))
    .bind(test_id)
    .bind(user_id)
    .fetch_all(executor)
    .await
}

pub(crate) async fn list_due(
    executor: impl PgExecutor<'_>,
    now: PrimitiveDateTime,
    limit: i64,
) -> Result<Vec<AttemptRow>, sqlx::Error> {
    sqlx::query_as::<_, AttemptRow>(&format!(
        "SELECT {COLUMNS} FROM test_attempts \
         WHERE state IN ('in_progress', 'overdue') AND time_check_state <= $1 \
         ORDER BY time_check_state LIMIT $2"
    ))
    .bind(now)
    .bind(limit.clamp(1, 10_000))
    .fetch_all(executor)
    .await
}

pub(crate) async fn insert_usage(
    executor: impl PgExecutor<'_>,
    usage_id: &str,
    state: serde_json::Value,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO item_usages (id, state, created_at, updated_at) VALUES ($1, $2, $3, $3)",
    )
    .bind(usage_id)
    .bind(state)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn update_usage(
    executor: impl PgExecutor<'_>,
    usage_id: &str,
    state: serde_json::Value,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE item_usages SET state = $1, updated_at = $2 WHERE id = $3")
        .bind(state)
        .bind(now)
        .bind(usage_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn insert_attempt(
    executor: impl PgExecutor<'_>,
    attempt: &Attempt,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO test_attempts (
            id, test_id, user_id, usage_id, attempt_number, state, is_preview, layout,
            current_page, time_start, time_finish, time_modified, time_modified_offline,
            time_check_state, sum_grades, redo_links, revision
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,0)
        ON CONFLICT (test_id, user_id, attempt_number) DO NOTHING",
    )
    .bind(&attempt.id)
    .bind(&attempt.test_id)
    .bind(&attempt.user_id)
    .bind(&attempt.usage_id)
    .bind(attempt.attempt_number as i32)
    .bind(attempt.state)
    .bind(attempt.is_preview)
    .bind(attempt.layout.to_storage())
    .bind(page_index(attempt))
    .bind(attempt.time_start)
    .bind(attempt.time_finish)
    .bind(attempt.time_modified)
    .bind(attempt.time_modified_offline)
    .bind(attempt.time_check_state)
    .bind(attempt.sum_grades)
    .bind(redo_link_rows(attempt))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Writes every mutable column if the row still has `attempt.revision`.
pub(crate) async fn update_if_revision(
    executor: impl PgExecutor<'_>,
    attempt: &Attempt,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE test_attempts SET
            state = $1, layout = $2, current_page = $3, time_finish = $4, time_modified = $5,
            time_modified_offline = $6, time_check_state = $7, sum_grades = $8,
            redo_links = $9, revision = revision + 1
        WHERE id = $10 AND revision = $11",
    )
    .bind(attempt.state)
    .bind(attempt.layout.to_storage())
    .bind(page_index(attempt))
    .bind(attempt.time_finish)
    .bind(attempt.time_modified)
    .bind(attempt.time_modified_offline)
    .bind(attempt.time_check_state)
    .bind(attempt.sum_grades)
    .bind(redo_link_rows(attempt))
    .bind(&attempt.id)
    .bind(attempt.revision)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Preview attempts are removed together with their usages.
pub(crate) async fn delete_previews(
    executor: impl PgExecutor<'_>,
    test_id: &str,
    user_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "WITH removed AS (
            DELETE FROM test_attempts
            WHERE test_id = $1 AND user_id = $2 AND is_preview
            RETURNING usage_id
        )
        DELETE FROM item_usages WHERE id IN (SELECT usage_id FROM removed)",
    )
    .bind(test_id)
    .bind(user_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn recheck_open(
    executor: impl PgExecutor<'_>,
    filter: &OpenAttemptFilter,
) -> Result<u64, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(RECHECK_PREFIX);

    if let Some(course_id) = &filter.course_id {
        builder.push(" AND t.course_id = ");
        builder.push_bind(course_id);
    }
    if let Some(user_id) = &filter.user_id {
        builder.push(" AND a.user_id = ");
        builder.push_bind(user_id);
    }
    if let Some(test_id) = &filter.test_id {
        builder.push(" AND a.test_id = ");
        builder.push_bind(test_id);
    }
    if let Some(group_id) = &filter.group_id {
        builder.push(" AND a.user_id IN (SELECT user_id FROM group_members WHERE group_id = ");
        builder.push_bind(group_id);
        builder.push(")");
    }

    builder.push(RECHECK_SUFFIX);
    let result = builder.build().execute(executor).await?;
    Ok(result.rows_affected())
}

#[derive(Clone)]
pub struct PgAttemptStore {
    pool: PgPool,
}

impl PgAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AttemptStore for PgAttemptStore {
    async fn insert(
        &self,
        mut attempt: Attempt,
        usage: &dyn ItemUsage,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        insert_usage(&mut *tx, &attempt.usage_id, usage.save()?, attempt.time_modified).await?;
        if !insert_attempt(&mut *tx, &attempt).await? {
            tx.rollback().await?;
            let winner = find_by_number(
                &self.pool,
                &attempt.test_id,
                &attempt.user_id,
                attempt.attempt_number,
            )
            .await?
            .ok_or_else(|| {
                StoreError::Serialization(format!(
                    "attempt {} of {} conflicted but no row exists",
                    attempt.attempt_number, attempt.user_id
                ))
            })?;
            return Ok(InsertOutcome::Duplicate(winner.try_into()?));
        }

        tx.commit().await?;
        attempt.revision = 0;
        Ok(InsertOutcome::Inserted(attempt))
    }

    async fn find_by_id(&self, attempt_id: &str) -> Result<Option<Attempt>, StoreError> {
        find_by_id(&self.pool, attempt_id).await?.map(Attempt::try_from).transpose()
    }

    async fn load_usage_state(&self, usage_id: &str) -> Result<serde_json::Value, StoreError> {
        let row = sqlx::query_as::<_, UsageRow>("SELECT id, state FROM item_usages WHERE id = $1")
            .bind(usage_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.state.0)
            .ok_or_else(|| StoreError::Serialization(format!("usage {usage_id} is missing")))
    }

    async fn list_for_user(
        &self,
        test_id: &str,
        user_id: &str,
    ) -> Result<Vec<Attempt>, StoreError> {
        list_by_user(&self.pool, test_id, user_id)
            .await?
            .into_iter()
            .map(Attempt::try_from)
            .collect()
    }

    async fn commit(
        &self,
        attempt: &mut Attempt,
        usage: Option<&dyn ItemUsage>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(usage) = usage {
            update_usage(&mut *tx, &attempt.usage_id, usage.save()?, attempt.time_modified)
                .await?;
        }
        if !update_if_revision(&mut *tx, attempt).await? {
            tx.rollback().await?;
            return Err(StoreError::Conflict { attempt_id: attempt.id.clone() });
        }

        tx.commit().await?;
        attempt.revision += 1;
        Ok(())
    }

    async fn delete_previews(&self, test_id: &str, user_id: &str) -> Result<u64, StoreError> {
        Ok(delete_previews(&self.pool, test_id, user_id).await?)
    }

    async fn load_test(&self, test_id: &str) -> Result<Option<TestDefinition>, StoreError> {
        let Some(row) = test_definitions::find_row(&self.pool, test_id).await? else {
            return Ok(None);
        };
        let sections = test_definitions::list_sections(&self.pool, test_id).await?;
        let slots = test_definitions::list_slots(&self.pool, test_id).await?;
        test_definitions::into_definition(row, sections, slots).map(Some)
    }

    async fn effective_timing(
        &self,
        test: &TestDefinition,
        user_id: &str,
    ) -> Result<TestTiming, StoreError> {
        let rows = test_definitions::list_overrides_for_user(&self.pool, &test.id, user_id).await?;
        let (user, groups) = test_definitions::split_overrides(&rows);
        Ok(resolve_timing(&test.timing, user.as_ref(), &groups))
    }

    async fn recheck_open_attempts(
        &self,
        filter: &OpenAttemptFilter,
    ) -> Result<u64, StoreError> {
        Ok(recheck_open(&self.pool, filter).await?)
    }

    async fn list_due(
        &self,
        now: PrimitiveDateTime,
        limit: u32,
    ) -> Result<Vec<Attempt>, StoreError> {
        list_due(&self.pool, now, i64::from(limit))
            .await?
            .into_iter()
            .map(Attempt::try_from)
            .collect()
    }
}
