//! Timing windows, override resolution and the access-manager seam.

use std::cmp::{max, min};
use std::num::NonZeroU32;

use time::{Duration, PrimitiveDateTime};

use crate::core::time::{from_unix_seconds, to_unix_seconds};
use crate::services::attempt::Attempt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLimit {
    Unlimited,
    Limited(Duration),
}

impl TimeLimit {
    pub fn from_legacy_seconds(seconds: i64) -> Self {
        if seconds > 0 {
            Self::Limited(Duration::seconds(seconds))
        } else {
            Self::Unlimited
        }
    }

    pub fn to_legacy_seconds(self) -> i64 {
        match self {
            Self::Unlimited => 0,
            Self::Limited(duration) => duration.whole_seconds(),
        }
    }

    fn most_lenient(self, other: Self) -> Self {
        match (self, other) {
            (Self::Limited(a), Self::Limited(b)) => Self::Limited(max(a, b)),
            _ => Self::Unlimited,
        }
    }
}

/// An open or close bound on the test window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Unbounded,
    At(PrimitiveDateTime),
}

impl Bound {
    pub fn from_legacy(seconds: i64) -> Self {
        if seconds > 0 {
            Self::At(from_unix_seconds(seconds))
        } else {
            Self::Unbounded
        }
    }

    pub fn to_legacy(self) -> i64 {
        match self {
            Self::Unbounded => 0,
            Self::At(at) => to_unix_seconds(at),
        }
    }

    pub fn at(self) -> Option<PrimitiveDateTime> {
        match self {
            Self::Unbounded => None,
            Self::At(at) => Some(at),
        }
    }

    fn earliest_or_unbounded(self, other: Self) -> Self {
        match (self, other) {
            (Self::At(a), Self::At(b)) => Self::At(min(a, b)),
            _ => Self::Unbounded,
        }
    }

    fn latest_or_unbounded(self, other: Self) -> Self {
        match (self, other) {
            (Self::At(a), Self::At(b)) => Self::At(max(a, b)),
            _ => Self::Unbounded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptLimit {
    Unlimited,
    Limited(NonZeroU32),
}

impl AttemptLimit {
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

    pub fn allows(self, attempts_made: u32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(n) => attempts_made < n.get(),
        }
    }

    fn most_lenient(self, other: Self) -> Self {
        match (self, other) {
            (Self::Limited(a), Self::Limited(b)) => Self::Limited(max(a, b)),
            _ => Self::Unlimited,
        }
    }
}

/// Effective timing for one learner on one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestTiming {
    pub time_open: Bound,
    pub time_close: Bound,
    pub time_limit: TimeLimit,
    pub attempts_allowed: AttemptLimit,
}

impl Default for TestTiming {
    fn default() -> Self {
        Self {
            time_open: Bound::Unbounded,
            time_close: Bound::Unbounded,
            time_limit: TimeLimit::Unlimited,
            attempts_allowed: AttemptLimit::Unlimited,
        }
    }
}

impl TestTiming {
    /// `min(time_start + limit, close)`, or `None` when neither applies.
    ///
    /// A limit that runs past the representable calendar imposes no deadline.
    pub fn deadline(&self, time_start: PrimitiveDateTime) -> Option<PrimitiveDateTime> {
        let by_limit = match self.time_limit {
            TimeLimit::Unlimited => None,
            TimeLimit::Limited(limit) => time_start.checked_add(limit),
        };
        match (by_limit, self.time_close.at()) {
            (Some(limit_end), Some(close)) => Some(min(limit_end, close)),
            (limit_end, close) => limit_end.or(close),
        }
    }
}

/// Per-user or per-group override. `None` leaves the field alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingOverride {
    pub time_open: Option<Bound>,
    pub time_close: Option<Bound>,
    pub time_limit: Option<TimeLimit>,
    pub attempts: Option<AttemptLimit>,
}

/// Applies overrides to the test's own timing.
///
/// A user override wins field by field. Fields it leaves unset take the most
/// lenient value among the learner's group overrides, and only then the test
/// default.
pub fn resolve_timing(
    base: &TestTiming,
    user: Option<&TimingOverride>,
    groups: &[TimingOverride],
) -> TestTiming {
    let group_open = groups.iter().filter_map(|o| o.time_open).reduce(Bound::earliest_or_unbounded);
    let group_close = groups.iter().filter_map(|o| o.time_close).reduce(Bound::latest_or_unbounded);
    let group_limit = groups.iter().filter_map(|o| o.time_limit).reduce(TimeLimit::most_lenient);
    let group_attempts =
        groups.iter().filter_map(|o| o.attempts).reduce(AttemptLimit::most_lenient);

    TestTiming {
        time_open: user
            .and_then(|o| o.time_open)
            .or(group_open)
            .unwrap_or(base.time_open),
        time_close: user
            .and_then(|o| o.time_close)
            .or(group_close)
            .unwrap_or(base.time_close),
        time_limit: user
            .and_then(|o| o.time_limit)
            .or(group_limit)
            .unwrap_or(base.time_limit),
        attempts_allowed: user
            .and_then(|o| o.attempts)
            .or(group_attempts)
            .unwrap_or(base.attempts_allowed),
    }
}

/// Eligibility and deadline rules consulted by the attempt service.
pub trait AccessManager: Send + Sync {
    fn end_time(&self, attempt: &Attempt) -> Option<PrimitiveDateTime>;

    /// Reasons the learner may not enter the test right now. Empty means allowed.
    fn prevent_access(&self, now: PrimitiveDateTime) -> Vec<String>;

    fn prevent_new_attempt(&self, attempts_made: u32, last_attempt: Option<&Attempt>)
        -> Vec<String>;

    /// True once no further attempt could ever be allowed.
    fn is_finished(
        &self,
        attempts_made: u32,
        last_attempt: Option<&Attempt>,
        now: PrimitiveDateTime,
    ) -> bool;
}

/// Default access manager built from open/close window, time limit and attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingRules {
    timing: TestTiming,
}

impl TimingRules {
    pub fn new(timing: TestTiming) -> Self {
        Self { timing }
    }

    pub fn timing(&self) -> &TestTiming {
        &self.timing
    }
}

impl AccessManager for TimingRules {
    fn end_time(&self, attempt: &Attempt) -> Option<PrimitiveDateTime> {
        self.timing.deadline(attempt.time_start)
    }

    fn prevent_access(&self, now: PrimitiveDateTime) -> Vec<String> {
        let mut reasons = Vec::new();
        if let Bound::At(open) = self.timing.time_open {
            if now < open {
                reasons.push(format!("The test is not open until {open}"));
            }
        }
        if let Bound::At(close) = self.timing.time_close {
            if now > close {
                reasons.push(format!("The test closed at {close}"));
            }
        }
        reasons
    }

    fn prevent_new_attempt(
        &self,
        attempts_made: u32,
        _last_attempt: Option<&Attempt>,
    ) -> Vec<String> {
        if self.timing.attempts_allowed.allows(attempts_made) {
            Vec::new()
        } else {
            vec![String::from("No more attempts are allowed")]
        }
    }

    fn is_finished(
        &self,
        attempts_made: u32,
        _last_attempt: Option<&Attempt>,
        now: PrimitiveDateTime,
    ) -> bool {
        let closed = matches!(self.timing.time_close, Bound::At(close) if now > close);
        closed || !self.timing.attempts_allowed.allows(attempts_made)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn minutes(n: i64) -> TimeLimit {
        TimeLimit::Limited(Duration::minutes(n))
    }

    #[test]
    fn deadline_is_earlier_of_limit_and_close() {
        let start = datetime!(2025-03-01 10:00:00);
        let mut timing = TestTiming { time_limit: minutes(30), ..TestTiming::default() };
        assert_eq!(timing.deadline(start), Some(datetime!(2025-03-01 10:30:00)));

        timing.time_close = Bound::At(datetime!(2025-03-01 10:20:00));
        assert_eq!(timing.deadline(start), Some(datetime!(2025-03-01 10:20:00)));

        timing.time_limit = TimeLimit::Unlimited;
        assert_eq!(timing.deadline(start), Some(datetime!(2025-03-01 10:20:00)));

        assert_eq!(TestTiming::default().deadline(start), None);
    }

    #[test]
    fn limit_past_the_calendar_leaves_only_the_close_bound() {
        let start = datetime!(2025-03-01 10:00:00);
        let mut timing = TestTiming {
            time_limit: TimeLimit::from_legacy_seconds(i64::MAX),
            ..TestTiming::default()
        };
        assert_eq!(timing.deadline(start), None);

        timing.time_close = Bound::from_legacy(i64::MAX);
        assert_eq!(timing.deadline(start), timing.time_close.at());
    }

    #[test]
    fn user_override_wins_field_by_field() {
        let base = TestTiming { time_limit: minutes(30), ..TestTiming::default() };
        let user = TimingOverride { time_limit: Some(minutes(10)), ..TimingOverride::default() };
        let group = TimingOverride {
            time_limit: Some(minutes(60)),
            attempts: Some(AttemptLimit::from_legacy(3)),
            ..TimingOverride::default()
        };

        let resolved = resolve_timing(&base, Some(&user), &[group]);
        assert_eq!(resolved.time_limit, minutes(10));
        assert_eq!(resolved.attempts_allowed, AttemptLimit::from_legacy(3));
    }

    #[test]
    fn most_lenient_group_wins_and_zero_means_unlimited() {
        let base = TestTiming {
            time_close: Bound::At(datetime!(2025-03-01 12:00:00)),
            time_limit: minutes(30),
            ..TestTiming::default()
        };
        let groups = [
            TimingOverride {
                time_close: Some(Bound::At(datetime!(2025-03-02 12:00:00))),
                time_limit: Some(minutes(45)),
                ..TimingOverride::default()
            },
            TimingOverride {
                time_close: Some(Bound::At(datetime!(2025-03-03 12:00:00))),
                time_limit: Some(TimeLimit::from_legacy_seconds(0)),
                ..TimingOverride::default()
            },
        ];

        let resolved = resolve_timing(&base, None, &groups);
        assert_eq!(resolved.time_close, Bound::At(datetime!(2025-03-03 12:00:00)));
        assert_eq!(resolved.time_limit, TimeLimit::Unlimited);
    }

    #[test]
    fn timing_rules_gate_access_and_attempts() {
        let rules = TimingRules::new(TestTiming {
            time_open: Bound::At(datetime!(2025-03-01 09:00:00)),
            time_close: Bound::At(datetime!(2025-03-01 17:00:00)),
            attempts_allowed: AttemptLimit::from_legacy(2),
            ..TestTiming::default()
        });

        assert_eq!(rules.prevent_access(datetime!(2025-03-01 08:00:00)).len(), 1);
        assert!(rules.prevent_access(datetime!(2025-03-01 10:00:00)).is_empty());
        assert_eq!(rules.prevent_access(datetime!(2025-03-01 18:00:00)).len(), 1);

        assert!(rules.prevent_new_attempt(1, None).is_empty());
        assert!(!rules.prevent_new_attempt(2, None).is_empty());
        assert!(rules.is_finished(2, None, datetime!(2025-03-01 10:00:00)));
        assert!(rules.is_finished(0, None, datetime!(2025-03-01 18:00:00)));
        assert!(!rules.is_finished(1, None, datetime!(2025-03-01 10:00:00)));
    }

    #[test]
    fn legacy_sentinels_convert_at_the_edge() {
        assert_eq!(TimeLimit::from_legacy_seconds(0), TimeLimit::Unlimited);
        assert_eq!(TimeLimit::from_legacy_seconds(90).to_legacy_seconds(), 90);
        assert_eq!(Bound::from_legacy(0), Bound::Unbounded);
        assert_eq!(AttemptLimit::from_legacy(0), AttemptLimit::Unlimited);
        assert!(AttemptLimit::Unlimited.allows(u32::MAX));
    }
}
