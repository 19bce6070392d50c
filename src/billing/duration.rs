use chrono::{DateTime, Duration, Utc};

/// key: billing-duration -> timestamps to billable minutes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BillableDuration {
    pub minutes: i64,
    /// Set when the end precedes the start; the duration is forced to zero.
    pub clock_skew: bool,
}

/// Billable minutes between two instants, rounded up to whole minutes.
///
/// Missing timestamps and reversed intervals yield zero. Any positive elapsed
/// time, however short, bills at least one minute.
pub fn compute(
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
) -> BillableDuration {
    let (Some(started_at), Some(ended_at)) = (started_at, ended_at) else {
        return BillableDuration {
            minutes: 0,
            clock_skew: false,
        };
    };

    let elapsed = ended_at - started_at;
    if elapsed < Duration::zero() {
        return BillableDuration {
            minutes: 0,
            clock_skew: true,
        };
    }

    let whole_seconds = elapsed.num_seconds();
    let has_fraction = elapsed > Duration::seconds(whole_seconds);
    let partial_minute = whole_seconds % 60 > 0 || has_fraction;
    BillableDuration {
        minutes: whole_seconds / 60 + i64::from(partial_minute),
        clock_skew: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    fn minutes_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        compute(Some(start), Some(end)).minutes
    }

    #[test]
    fn partial_minutes_round_up() {
        assert_eq!(minutes_between(at(10, 0, 0), at(10, 15, 30)), 16);
        assert_eq!(minutes_between(at(10, 0, 0), at(10, 0, 59)), 1);
        assert_eq!(
            minutes_between(at(10, 0, 0), at(10, 0, 0) + Duration::microseconds(1)),
            1
        );
        assert_eq!(
            minutes_between(at(10, 0, 0), at(10, 1, 0) + Duration::milliseconds(1)),
            2
        );
    }

    #[test]
    fn whole_minutes_are_exact() {
        assert_eq!(minutes_between(at(10, 0, 0), at(10, 1, 0)), 1);
        assert_eq!(minutes_between(at(10, 0, 0), at(11, 0, 0)), 60);
    }

    #[test]
    fn zero_elapsed_is_free() {
        assert_eq!(compute(Some(at(10, 0, 0)), Some(at(10, 0, 0))), BillableDuration {
            minutes: 0,
            clock_skew: false,
        });
    }

    #[test]
    fn missing_timestamps_yield_zero() {
        assert_eq!(compute(None, Some(at(10, 0, 0))).minutes, 0);
        assert_eq!(compute(Some(at(10, 0, 0)), None).minutes, 0);
        assert_eq!(compute(None, None).minutes, 0);
    }

    #[test]
    fn reversed_interval_is_flagged() {
        let duration = compute(Some(at(10, 5, 0)), Some(at(10, 0, 0)));
        assert_eq!(duration.minutes, 0);
        assert!(duration.clock_skew);
    }
}
