//! Time-driven attempt transitions, kept free of I/O.

use time::{Duration, PrimitiveDateTime};

use crate::core::config::AttemptSettings;
use crate::db::types::{AttemptState, OverdueHandling};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePolicy {
    pub overdue_handling: OverdueHandling,
    pub grace_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeCheckTransition {
    ClearCheck,
    RecheckAt(PrimitiveDateTime),
    Finish { time_finish: PrimitiveDateTime },
    GoOverdue { recheck_at: PrimitiveDateTime },
    Abandon,
}

/// Decides what an attempt's deadline means at `now`.
///
/// Terminal attempts always clear their check time. An offline autosubmit is
/// recorded as finished at the deadline rather than at `now`.
pub fn time_check_transition(
    state: AttemptState,
    is_preview: bool,
    deadline: Option<PrimitiveDateTime>,
    now: PrimitiveDateTime,
    policy: TimePolicy,
    student_online: bool,
) -> TimeCheckTransition {
    if state.is_terminal() {
        return TimeCheckTransition::ClearCheck;
    }
    let deadline = match deadline {
        Some(deadline) if !is_preview => deadline,
        _ => return TimeCheckTransition::ClearCheck,
    };
    if now < deadline {
        return TimeCheckTransition::RecheckAt(deadline);
    }

    let grace_end = deadline.saturating_add(policy.grace_period);
    if state == AttemptState::Overdue {
        return if now - deadline >= policy.grace_period {
            TimeCheckTransition::Abandon
        } else {
            TimeCheckTransition::RecheckAt(grace_end)
        };
    }

    match policy.overdue_handling {
        OverdueHandling::AutoSubmit => TimeCheckTransition::Finish {
            time_finish: if student_online { now } else { deadline },
        },
        OverdueHandling::GracePeriod => TimeCheckTransition::GoOverdue { recheck_at: grace_end },
        OverdueHandling::AutoAbandon => TimeCheckTransition::Abandon,
    }
}

/// Check time the periodic sweep stores for an attempt. Never changes state.
pub fn swept_check_time(
    state: AttemptState,
    is_preview: bool,
    deadline: Option<PrimitiveDateTime>,
    grace_period: Duration,
) -> Option<PrimitiveDateTime> {
    if is_preview {
        return None;
    }
    match state {
        AttemptState::InProgress => deadline,
        AttemptState::Overdue => {
            deadline.map(|deadline| deadline.saturating_add(grace_period))
        }
        AttemptState::Finished | AttemptState::Abandoned => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitAction {
    Continue,
    GoOverdue,
    Finish { time_finish: PrimitiveDateTime },
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionPlan {
    pub action: SubmitAction,
    /// Responses arrived too late to be accepted.
    pub too_late: bool,
}

/// What a page submission does, given where `now` sits relative to the deadline.
///
/// Within `min_time_to_continue` of the deadline the attempt is treated as out of
/// time, whatever the client reported; a client-side `time_up` is never cleared.
/// Past `deadline + grace_period_min` the submitted responses are dropped.
/// Under the grace-period policy the attempt goes overdue, or is abandoned once
/// `deadline + grace + grace_period_min` has passed.
pub fn plan_submission(
    deadline: Option<PrimitiveDateTime>,
    is_preview: bool,
    now: PrimitiveDateTime,
    client_time_up: bool,
    finish_requested: bool,
    policy: TimePolicy,
    thresholds: &AttemptSettings,
) -> SubmissionPlan {
    let deadline = deadline.filter(|_| !is_preview);
    let grace_min = thresholds.grace_period_min();

    let mut time_up = client_time_up;
    let mut too_late = false;
    if let Some(deadline) = deadline {
        if now > deadline.saturating_sub(thresholds.min_time_to_continue()) {
            time_up = true;
        }
        too_late = time_up && now > deadline.saturating_add(grace_min);
    }

    let mut finishing = finish_requested;
    let mut becoming_overdue = false;
    let mut becoming_abandoned = false;
    if time_up {
        match (policy.overdue_handling, deadline) {
            (OverdueHandling::GracePeriod, Some(deadline)) => {
                let abandon_after =
                    deadline.saturating_add(policy.grace_period).saturating_add(grace_min);
                if now > abandon_after {
                    finishing = true;
                    becoming_abandoned = true;
                } else {
                    becoming_overdue = true;
                }
            }
            _ => finishing = true,
        }
    }

    let action = if !finishing {
        if becoming_overdue {
            SubmitAction::GoOverdue
        } else {
            SubmitAction::Continue
        }
    } else if becoming_abandoned {
        SubmitAction::Abandon
    } else {
        let record_deadline = too_late && policy.overdue_handling != OverdueHandling::GracePeriod;
        let time_finish = match deadline {
            Some(deadline) if record_deadline => deadline,
            _ => now,
        };
        SubmitAction::Finish { time_finish }
    };

    SubmissionPlan { action, too_late }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    const DEADLINE: PrimitiveDateTime = datetime!(2025-03-01 11:00:00);

    fn policy(overdue_handling: OverdueHandling) -> TimePolicy {
        TimePolicy { overdue_handling, grace_period: Duration::minutes(10) }
    }

    fn check(
        state: AttemptState,
        now: PrimitiveDateTime,
        handling: OverdueHandling,
    ) -> TimeCheckTransition {
        time_check_transition(state, false, Some(DEADLINE), now, policy(handling), false)
    }

    #[test]
    fn before_deadline_rechecks_at_deadline() {
        for state in [AttemptState::InProgress, AttemptState::Overdue] {
            for handling in [
                OverdueHandling::AutoSubmit,
                OverdueHandling::GracePeriod,
                OverdueHandling::AutoAbandon,
            ] {
                assert_eq!(
                    check(state, datetime!(2025-03-01 10:59:00), handling),
                    TimeCheckTransition::RecheckAt(DEADLINE)
                );
            }
        }
    }

    #[test]
    fn in_progress_past_deadline_follows_policy() {
        let now = datetime!(2025-03-01 11:01:00);
        assert_eq!(
            check(AttemptState::InProgress, now, OverdueHandling::AutoSubmit),
            TimeCheckTransition::Finish { time_finish: DEADLINE }
        );
        assert_eq!(
            check(AttemptState::InProgress, now, OverdueHandling::GracePeriod),
            TimeCheckTransition::GoOverdue { recheck_at: datetime!(2025-03-01 11:10:00) }
        );
        assert_eq!(
            check(AttemptState::InProgress, now, OverdueHandling::AutoAbandon),
            TimeCheckTransition::Abandon
        );
    }

    #[test]
    fn online_autosubmit_finishes_at_now() {
        let now = datetime!(2025-03-01 11:01:00);
        let transition = time_check_transition(
            AttemptState::InProgress,
            false,
            Some(DEADLINE),
            now,
            policy(OverdueHandling::AutoSubmit),
            true,
        );
        assert_eq!(transition, TimeCheckTransition::Finish { time_finish: now });
    }

    #[test]
    fn overdue_waits_for_grace_then_abandons() {
        for handling in [
            OverdueHandling::AutoSubmit,
            OverdueHandling::GracePeriod,
            OverdueHandling::AutoAbandon,
        ] {
            assert_eq!(
                check(AttemptState::Overdue, datetime!(2025-03-01 11:05:00), handling),
                TimeCheckTransition::RecheckAt(datetime!(2025-03-01 11:10:00))
            );
            assert_eq!(
                check(AttemptState::Overdue, datetime!(2025-03-01 11:10:00), handling),
                TimeCheckTransition::Abandon
            );
        }
    }

    #[test]
    fn terminal_previews_and_untimed_attempts_clear_check() {
        let now = datetime!(2025-03-01 11:30:00);
        for state in [AttemptState::Finished, AttemptState::Abandoned] {
            assert_eq!(
                check(state, now, OverdueHandling::GracePeriod),
                TimeCheckTransition::ClearCheck
            );
        }
        let grace = policy(OverdueHandling::GracePeriod);
        assert_eq!(
            time_check_transition(
                AttemptState::InProgress,
                true,
                Some(DEADLINE),
                now,
                grace,
                false
            ),
            TimeCheckTransition::ClearCheck
        );
        assert_eq!(
            time_check_transition(AttemptState::InProgress, false, None, now, grace, false),
            TimeCheckTransition::ClearCheck
        );
    }

    #[test]
    fn sweep_adds_grace_only_when_overdue() {
        let grace = Duration::minutes(10);
        let deadline = Some(DEADLINE);
        assert_eq!(swept_check_time(AttemptState::InProgress, false, deadline, grace), deadline);
        assert_eq!(
            swept_check_time(AttemptState::Overdue, false, deadline, grace),
            Some(datetime!(2025-03-01 11:10:00))
        );
        assert_eq!(swept_check_time(AttemptState::InProgress, true, deadline, grace), None);
        assert_eq!(swept_check_time(AttemptState::Finished, false, deadline, grace), None);
    }

    fn plan(
        now: PrimitiveDateTime,
        finish_requested: bool,
        handling: OverdueHandling,
    ) -> SubmissionPlan {
        plan_submission(
            Some(DEADLINE),
            false,
            now,
            false,
            finish_requested,
            policy(handling),
            &AttemptSettings::default(),
        )
    }

    #[test]
    fn submission_well_before_deadline_continues() {
        let plan = plan(datetime!(2025-03-01 10:59:50), false, OverdueHandling::AutoSubmit);
        assert_eq!(plan, SubmissionPlan { action: SubmitAction::Continue, too_late: false });
    }

    #[test]
    fn submission_within_continue_threshold_finishes() {
        let now = datetime!(2025-03-01 10:59:59);
        let plan = plan(now, false, OverdueHandling::AutoSubmit);
        assert_eq!(plan.action, SubmitAction::Finish { time_finish: now });
        assert!(!plan.too_late);
    }

    #[test]
    fn late_submission_records_deadline_as_finish_time() {
        let plan = plan(datetime!(2025-03-01 11:02:00), false, OverdueHandling::AutoSubmit);
        assert_eq!(plan.action, SubmitAction::Finish { time_finish: DEADLINE });
        assert!(plan.too_late);
    }

    #[test]
    fn grace_policy_goes_overdue_then_abandons() {
        let going_overdue =
            plan(datetime!(2025-03-01 11:05:00), false, OverdueHandling::GracePeriod);
        assert_eq!(going_overdue.action, SubmitAction::GoOverdue);
        assert!(going_overdue.too_late);

        let abandoned = plan(datetime!(2025-03-01 11:11:01), false, OverdueHandling::GracePeriod);
        assert_eq!(abandoned.action, SubmitAction::Abandon);
    }

    #[test]
    fn grace_policy_honours_explicit_finish_while_overdue() {
        let now = datetime!(2025-03-01 11:00:30);
        let plan = plan(now, true, OverdueHandling::GracePeriod);
        assert_eq!(plan.action, SubmitAction::Finish { time_finish: now });
    }

    #[test]
    fn previews_ignore_deadlines() {
        let plan = plan_submission(
            Some(DEADLINE),
            true,
            datetime!(2025-03-01 12:00:00),
            false,
            false,
            policy(OverdueHandling::AutoAbandon),
            &AttemptSettings::default(),
        );
        assert_eq!(plan, SubmissionPlan { action: SubmitAction::Continue, too_late: false });
    }

    #[test]
    fn client_timer_finishes_even_with_time_left() {
        let now = datetime!(2025-03-01 10:50:00);
        let plan = plan_submission(
            Some(DEADLINE),
            false,
            now,
            true,
            false,
            policy(OverdueHandling::AutoSubmit),
            &AttemptSettings::default(),
        );
        assert_eq!(plan.action, SubmitAction::Finish { time_finish: now });
        assert!(!plan.too_late);
    }

    #[test]
    fn deadline_at_the_edge_of_time_does_not_overflow() {
        let far = datetime!(9999-12-31 23:59:00);
        assert_eq!(
            swept_check_time(AttemptState::Overdue, false, Some(far), Duration::days(1)),
            Some(far.saturating_add(Duration::days(1)))
        );
        let transition = time_check_transition(
            AttemptState::InProgress,
            false,
            Some(far),
            far,
            policy(OverdueHandling::GracePeriod),
            false,
        );
        assert!(matches!(transition, TimeCheckTransition::GoOverdue { .. }));
    }

    #[test]
    fn client_timer_without_deadline_finishes() {
        let now = datetime!(2025-03-01 12:00:00);
        let plan = plan_submission(
            None,
            false,
            now,
            true,
            false,
            policy(OverdueHandling::GracePeriod),
            &AttemptSettings::default(),
        );
        assert_eq!(plan.action, SubmitAction::Finish { time_finish: now });
    }
}
