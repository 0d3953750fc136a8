//! In-process attempt store.
//!
//! One mutex guards everything, so every operation is serialised the way a
//! single database writer would be. Used by tests and by embedders that keep
//! attempts in memory.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use time::PrimitiveDateTime;
use tokio::sync::Mutex;

use crate::repositories::{AttemptStore, InsertOutcome, OpenAttemptFilter, StoreError};
use crate::services::access::{resolve_timing, TestTiming, TimingOverride};
use crate::services::attempt::Attempt;
use crate::services::test_definition::TestDefinition;
use crate::services::timing::swept_check_time;
use crate::services::usage::ItemUsage;

#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tests: HashMap<String, TestDefinition>,
    user_overrides: HashMap<(String, String), TimingOverride>,
    group_overrides: HashMap<String, Vec<(String, TimingOverride)>>,
    group_members: HashMap<String, HashSet<String>>,
    attempts: BTreeMap<String, Attempt>,
    usages: HashMap<String, serde_json::Value>,
}

impl MemoryState {
    fn effective_timing(&self, test: &TestDefinition, user_id: &str) -> TestTiming {
        let user = self.user_overrides.get(&(test.id.clone(), user_id.to_string()));
        let groups: Vec<TimingOverride> = self
            .group_overrides
            .get(&test.id)
            .into_iter()
            .flatten()
            .filter(|(group_id, _)| self.is_member(group_id, user_id))
            .map(|(_, timing)| *timing)
            .collect();
        resolve_timing(&test.timing, user, &groups)
    }

    fn is_member(&self, group_id: &str, user_id: &str) -> bool {
        self.group_members.get(group_id).is_some_and(|members| members.contains(user_id))
    }

    fn matches(&self, attempt: &Attempt, filter: &OpenAttemptFilter) -> bool {
        let course_matches = filter.course_id.as_deref().map_or(true, |course_id| {
            self.tests.get(&attempt.test_id).is_some_and(|test| test.course_id == course_id)
        });
        let group_matches = filter
            .group_id
            .as_deref()
            .map_or(true, |group_id| self.is_member(group_id, &attempt.user_id));

        attempt.state.is_open()
            && course_matches
            && group_matches
            && filter.user_id.as_deref().map_or(true, |user_id| attempt.user_id == user_id)
            && filter.test_id.as_deref().map_or(true, |test_id| attempt.test_id == test_id)
    }
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_test(&self, test: TestDefinition) {
        self.inner.lock().await.tests.insert(test.id.clone(), test);
    }

    pub async fn put_user_override(&self, test_id: &str, user_id: &str, timing: TimingOverride) {
        self.inner
            .lock()
            .await
            .user_overrides
            .insert((test_id.to_string(), user_id.to_string()), timing);
    }

    pub async fn put_group_override(&self, test_id: &str, group_id: &str, timing: TimingOverride) {
        let mut state = self.inner.lock().await;
        let overrides = state.group_overrides.entry(test_id.to_string()).or_default();
        overrides.retain(|(existing, _)| existing != group_id);
        overrides.push((group_id.to_string(), timing));
    }

    pub async fn add_group_member(&self, group_id: &str, user_id: &str) {
        self.inner
            .lock()
            .await
            .group_members
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn insert(
        &self,
        mut attempt: Attempt,
        usage: &dyn ItemUsage,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.inner.lock().await;

        let existing = state.attempts.values().find(|other| {
            other.test_id == attempt.test_id
                && other.user_id == attempt.user_id
                && other.attempt_number == attempt.attempt_number
        });
        if let Some(existing) = existing {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }

        let usage_state = usage.save()?;
        attempt.revision = 0;
        state.usages.insert(attempt.usage_id.clone(), usage_state);
        state.attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(InsertOutcome::Inserted(attempt))
    }

    async fn find_by_id(&self, attempt_id: &str) -> Result<Option<Attempt>, StoreError> {
        Ok(self.inner.lock().await.attempts.get(attempt_id).cloned())
    }

    async fn load_usage_state(&self, usage_id: &str) -> Result<serde_json::Value, StoreError> {
        self.inner
            .lock()
            .await
            .usages
            .get(usage_id)
            .cloned()
            .ok_or_else(|| StoreError::Serialization(format!("usage {usage_id} is missing")))
    }

    async fn list_for_user(
        &self,
        test_id: &str,
        user_id: &str,
    ) -> Result<Vec<Attempt>, StoreError> {
        let state = self.inner.lock().await;
        let mut attempts: Vec<Attempt> = state
            .attempts
            .values()
            .filter(|attempt| attempt.test_id == test_id && attempt.user_id == user_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|attempt| attempt.attempt_number);
        Ok(attempts)
    }

    async fn commit(
        &self,
        attempt: &mut Attempt,
        usage: Option<&dyn ItemUsage>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;

        let stored_revision = state.attempts.get(&attempt.id).map(|stored| stored.revision);
        if stored_revision != Some(attempt.revision) {
            return Err(StoreError::Conflict { attempt_id: attempt.id.clone() });
        }

        // Serialise before touching anything so a failed save leaves both untouched.
        let usage_state = usage.map(|usage| usage.save()).transpose()?;

        attempt.revision += 1;
        if let Some(usage_state) = usage_state {
            state.usages.insert(attempt.usage_id.clone(), usage_state);
        }
        state.attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn delete_previews(&self, test_id: &str, user_id: &str) -> Result<u64, StoreError> {
        let mut state = self.inner.lock().await;
        let previews: Vec<(String, String)> = state
            .attempts
            .values()
            .filter(|a| a.test_id == test_id && a.user_id == user_id && a.is_preview)
            .map(|a| (a.id.clone(), a.usage_id.clone()))
            .collect();

        for (attempt_id, usage_id) in &previews {
            state.attempts.remove(attempt_id);
            state.usages.remove(usage_id);
        }
        Ok(previews.len() as u64)
    }

    async fn load_test(&self, test_id: &str) -> Result<Option<TestDefinition>, StoreError> {
        Ok(self.inner.lock().await.tests.get(test_id).cloned())
    }

    async fn effective_timing(
        &self,
        test: &TestDefinition,
        user_id: &str,
    ) -> Result<TestTiming, StoreError> {
        Ok(self.inner.lock().await.effective_timing(test, user_id))
    }

    async fn recheck_open_attempts(
        &self,
        filter: &OpenAttemptFilter,
    ) -> Result<u64, StoreError> {
        let mut state = self.inner.lock().await;

        let updates: Vec<(String, Option<PrimitiveDateTime>)> = state
            .attempts
            .values()
            .filter(|attempt| state.matches(attempt, filter))
            .filter_map(|attempt| {
                let test = state.tests.get(&attempt.test_id)?;
                let timing = state.effective_timing(test, &attempt.user_id);
                let check = swept_check_time(
                    attempt.state,
                    attempt.is_preview,
                    timing.deadline(attempt.time_start),
                    test.grace_period,
                );
                Some((attempt.id.clone(), check))
            })
            .collect();

        for (attempt_id, check) in &updates {
            if let Some(attempt) = state.attempts.get_mut(attempt_id) {
                attempt.time_check_state = *check;
            }
        }
        Ok(updates.len() as u64)
    }

    async fn list_due(
        &self,
        now: PrimitiveDateTime,
        limit: u32,
    ) -> Result<Vec<Attempt>, StoreError> {
        let state = self.inner.lock().await;
        let mut due: Vec<Attempt> = state
            .attempts
            .values()
            .filter(|attempt| attempt.state.is_open())
            .filter(|attempt| attempt.time_check_state.is_some_and(|check| check <= now))
            .cloned()
            .collect();
        due.sort_by_key(|attempt| attempt.time_check_state);
        due.truncate(limit as usize);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use time::Duration;

    use super::*;
    use crate::db::types::AttemptState;
    use crate::services::access::TimeLimit;
    use crate::test_support::{attempt_fixture, FakeUsage, TestBuilder};

    fn usage() -> FakeUsage {
        FakeUsage::for_test(&TestBuilder::new(1).build())
    }

    #[tokio::test]
    async fn commit_rejects_stale_revision() {
        let store = MemoryAttemptStore::new();
        let InsertOutcome::Inserted(mut first) =
            store.insert(attempt_fixture(), &usage()).await.expect("insert")
        else {
            panic!("expected a fresh insert");
        };
        let mut second = first.clone();

        first.current_page = 1;
        store.commit(&mut first, None).await.expect("first commit");
        assert_eq!(first.revision, 1);

        second.current_page = 2;
        let err = store.commit(&mut second, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let stored = store.find_by_id(&first.id).await.expect("find").expect("attempt");
        assert_eq!(stored.current_page, 1);
    }

    #[tokio::test]
    async fn duplicate_attempt_number_returns_winner() {
        let store = MemoryAttemptStore::new();
        store.insert(attempt_fixture(), &usage()).await.expect("insert");

        let rival = Attempt { id: "attempt-rival".into(), ..attempt_fixture() };
        let outcome = store.insert(rival, &usage()).await.expect("insert");
        assert!(matches!(
            outcome,
            InsertOutcome::Duplicate(ref winner) if winner.id == "attempt-1"
        ));
    }

    #[tokio::test]
    async fn recheck_applies_overrides_and_grace() {
        let store = MemoryAttemptStore::new();
        let test = TestBuilder::new(1)
            .time_limit(Duration::minutes(30))
            .grace_period(Duration::minutes(5))
            .build();
        store.put_test(test.clone()).await;
        store.add_group_member("g1", "user-2").await;
        store
            .put_group_override(
                &test.id,
                "g1",
                TimingOverride {
                    time_limit: Some(TimeLimit::Limited(Duration::minutes(60))),
                    ..TimingOverride::default()
                },
            )
            .await;

        let start = attempt_fixture().time_start;
        store.insert(attempt_fixture(), &usage()).await.expect("insert");
        let overdue = Attempt {
            id: "attempt-2".into(),
            usage_id: "usage-2".into(),
            user_id: "user-2".into(),
            state: AttemptState::Overdue,
            ..attempt_fixture()
        };
        store.insert(overdue, &usage()).await.expect("insert");

        let touched =
            store.recheck_open_attempts(&OpenAttemptFilter::default()).await.expect("recheck");
        assert_eq!(touched, 2);

        let first = store.find_by_id("attempt-1").await.expect("find").expect("attempt");
        assert_eq!(first.time_check_state, Some(start + Duration::minutes(30)));
        let second = store.find_by_id("attempt-2").await.expect("find").expect("attempt");
        assert_eq!(second.time_check_state, Some(start + Duration::minutes(65)));

        let scoped = OpenAttemptFilter { group_id: Some("g1".into()), ..Default::default() };
        assert_eq!(store.recheck_open_attempts(&scoped).await.expect("recheck"), 1);
    }

    #[tokio::test]
    async fn list_due_orders_by_check_time() {
        let store = MemoryAttemptStore::new();
        let later = Attempt {
            time_check_state: Some(datetime!(2025-03-01 11:00:00)),
            ..attempt_fixture()
        };
        let earlier = Attempt {
            id: "attempt-2".into(),
            usage_id: "usage-2".into(),
            attempt_number: 2,
            time_check_state: Some(datetime!(2025-03-01 10:40:00)),
            ..attempt_fixture()
        };
        store.insert(later, &usage()).await.expect("insert");
        store.insert(earlier, &usage()).await.expect("insert");

        let due = store.list_due(datetime!(2025-03-01 11:00:00), 10).await.expect("due");
        let ids: Vec<&str> = due.iter().map(|attempt| attempt.id.as_str()).collect();
        assert_eq!(ids, vec!["attempt-2", "attempt-1"]);

        assert!(store.list_due(datetime!(2025-03-01 10:00:00), 10).await.expect("due").is_empty());
    }
}
