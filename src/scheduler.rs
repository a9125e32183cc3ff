//! Per-feed polling decisions.
//!
//! A feed is attempted only when its effective period has elapsed since
//! the last check. The effective period stretches with a small grace
//! slack for long periods, shrinks while a transient failure is likely,
//! and grows linearly under sustained failure.

/// Whether this run should attempt a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    /// Not due yet; try again in this many seconds.
    Later(i64),
}

/// Grace slack in minutes: 1% of the period rounded up, capped at 10,
/// applied only when the period exceeds 30 minutes.
pub fn slack_minutes(period: u64) -> u64 {
    if period > 30 {
        ((period + 50).div_ceil(100)).min(10)
    } else {
        0
    }
}

/// Effective polling period in minutes under the failure policy.
///
/// `failure_threshold` is the number of consecutive failures treated as
/// transient. Up to it, retry sooner (half period, ceiling); past it,
/// back off linearly.
pub fn effective_period(period: u64, failures: u32, failure_threshold: u32) -> u64 {
    let base = period + slack_minutes(period);
    if failures == 0 {
        base
    } else if failures <= failure_threshold {
        base.div_ceil(2)
    } else {
        base * u64::from(failures - failure_threshold)
    }
}

/// Decide whether a feed is due.
///
/// `last_checked` and `now` are epoch seconds; a zero `last_checked`
/// means never checked. `recheck` bypasses the timer entirely (unsafe
/// for automated runs, it defeats the back-off).
pub fn decide(
    period: u64,
    failures: u32,
    failure_threshold: u32,
    last_checked: i64,
    now: i64,
    recheck: bool,
) -> Decision {
    if recheck || last_checked <= 0 {
        return Decision::Run;
    }
    let effective_secs = effective_period(period, failures, failure_threshold) as i64 * 60;
    let elapsed = now - last_checked;
    if elapsed >= effective_secs {
        Decision::Run
    } else {
        Decision::Later(effective_secs - elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const F0: u32 = 10;

    #[test]
    fn test_slack_only_for_long_periods() {
        assert_eq!(slack_minutes(30), 0);
        assert_eq!(slack_minutes(31), 1);
        assert_eq!(slack_minutes(60), 2);
        assert_eq!(slack_minutes(1440), 10);
        assert_eq!(slack_minutes(10080), 10);
    }

    #[test]
    fn test_effective_period_no_failures() {
        assert_eq!(effective_period(60, 0, F0), 62);
        assert_eq!(effective_period(30, 0, F0), 30);
    }

    #[test]
    fn test_transient_failures_halve() {
        for f in 1..=F0 {
            let eff = effective_period(60, f, F0);
            assert_eq!(eff, 31);
            assert!(eff * 2 <= effective_period(60, 0, F0) + 1);
        }
    }

    #[test]
    fn test_sustained_failures_back_off_linearly() {
        // 11 consecutive failures with P = 60: at least 60 minutes.
        assert_eq!(effective_period(60, 11, F0), 62);
        // 20 consecutive failures: at least 600 minutes.
        assert_eq!(effective_period(60, 20, F0), 620);
    }

    #[test]
    fn test_decide_skips_within_period() {
        // Period 60 (+2 slack). Checked 30 minutes ago: not due.
        let d = decide(60, 0, F0, 1000, 1000 + 30 * 60, false);
        assert_eq!(d, Decision::Later(32 * 60));
        // 62 minutes later: due.
        assert_eq!(decide(60, 0, F0, 1000, 1000 + 62 * 60, false), Decision::Run);
    }

    #[test]
    fn test_decide_never_checked_runs() {
        assert_eq!(decide(60, 0, F0, 0, 1000, false), Decision::Run);
    }

    #[test]
    fn test_recheck_bypasses_timer() {
        assert_eq!(decide(60, 0, F0, 1000, 1001, true), Decision::Run);
    }
}
