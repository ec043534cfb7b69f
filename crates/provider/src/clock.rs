//! Quota reset clock

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Seconds from `now` until the next local midnight in `tz`. Always at least 1.
pub fn seconds_until_midnight(tz: Tz, now: DateTime<Utc>) -> u64 {
    let local = now.with_timezone(&tz);
    let Some(next_day) = local.date_naive().succ_opt() else {
        return DAY_SECS;
    };
    let Some(midnight) = next_day.and_hms_opt(0, 0, 0) else {
        return DAY_SECS;
    };
    // Midnight can be skipped or repeated in zones that shift DST at 00:00.
    let reset = tz
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(midnight + Duration::hours(1)))
                .earliest()
        });
    let Some(reset) = reset else {
        return DAY_SECS;
    };
    let secs = (reset.with_timezone(&Utc) - now).num_seconds();
    secs.clamp(1, DAY_SECS as i64 + 3600) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;

    #[test]
    fn one_hour_before_pacific_midnight_in_winter() {
        // 2025-01-15 23:00 PST == 2025-01-16 07:00 UTC
        let now = Utc.with_ymd_and_hms(2025, 1, 16, 7, 0, 0).unwrap();
        assert_eq!(seconds_until_midnight(Los_Angeles, now), 3600);
    }

    #[test]
    fn summer_uses_daylight_offset() {
        // 2025-07-01 00:00:30 PDT == 2025-07-01 07:00:30 UTC
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 7, 0, 30).unwrap();
        assert_eq!(seconds_until_midnight(Los_Angeles, now), DAY_SECS - 30);
    }

    #[test]
    fn dst_spring_forward_day_is_short() {
        // 2025-03-09 00:00 PST; clocks jump at 02:00 so the day has 23 hours.
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 8, 0, 0).unwrap();
        assert_eq!(seconds_until_midnight(Los_Angeles, now), 23 * 3600);
    }

    #[test]
    fn never_returns_zero() {
        let now = Utc.with_ymd_and_hms(2025, 1, 16, 7, 59, 59).unwrap();
        assert!(seconds_until_midnight(Los_Angeles, now) >= 1);
        let utc_midnight = Utc.with_ymd_and_hms(2025, 1, 16, 0, 0, 0).unwrap();
        assert_eq!(seconds_until_midnight(chrono_tz::UTC, utc_midnight), DAY_SECS);
    }
}
