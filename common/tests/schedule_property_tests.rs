// Property-based tests for recurrence computation

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use common::models::Recurrence;
use common::schedule::{next_occurrence, parse_cron_expression};
use proptest::prelude::*;

const TIMEZONES: &[chrono_tz::Tz] = &[
    chrono_tz::UTC,
    chrono_tz::Asia::Ho_Chi_Minh,
    chrono_tz::Europe::Berlin,
    chrono_tz::America::New_York,
    chrono_tz::Australia::Adelaide,
];

fn instant(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

/// Successive occurrences strictly increase and never precede the reference
#[test]
fn property_next_occurrence_is_strictly_after() {
    proptest!(|(
        minute in 0u32..60,
        hour in 0u32..24,
        tz_pick in any::<prop::sample::Index>(),
        start in 1_600_000_000i64..1_900_000_000i64
    )| {
        let tz = TIMEZONES[tz_pick.index(TIMEZONES.len())];
        let recurrence = Recurrence::new(format!("{minute} {hour} * * *"), tz);
        let after = instant(start);

        let first = next_occurrence(&recurrence, after).unwrap();
        let second = next_occurrence(&recurrence, first).unwrap();

        prop_assert!(first > after);
        prop_assert!(second > first);
        // Daily; a wall time lost to a DST jump can push it to the day after
        prop_assert!(second - first <= Duration::hours(49));
    });
}

/// The occurrence lands on the requested wall-clock minute in the job's zone
#[test]
fn property_occurrence_matches_local_minute() {
    proptest!(|(
        minute in 0u32..60,
        tz_pick in any::<prop::sample::Index>(),
        start in 1_600_000_000i64..1_900_000_000i64
    )| {
        let tz = TIMEZONES[tz_pick.index(TIMEZONES.len())];
        let recurrence = Recurrence::new(format!("{minute} * * * *"), tz);

        let next = next_occurrence(&recurrence, instant(start)).unwrap();
        let local = next.with_timezone(&tz);

        prop_assert_eq!(local.minute(), minute);
        prop_assert_eq!(local.second(), 0);
        // An hour, or a little more around DST transitions
        prop_assert!(next - instant(start) <= Duration::hours(3));
    });
}

/// Five-field weekdays count from Sunday = 0, with 7 also meaning Sunday
#[test]
fn property_weekly_occurrence_lands_on_weekday() {
    proptest!(|(
        day in 0u32..=7,
        tz_pick in any::<prop::sample::Index>(),
        start in 1_600_000_000i64..1_900_000_000i64
    )| {
        let tz = TIMEZONES[tz_pick.index(TIMEZONES.len())];
        let recurrence = Recurrence::new(format!("0 12 * * {day}"), tz);

        let next = next_occurrence(&recurrence, instant(start)).unwrap();
        let local = next.with_timezone(&tz);

        prop_assert_eq!(local.weekday().num_days_from_sunday(), day % 7);
        prop_assert_eq!(local.hour(), 12);
        prop_assert!(next - instant(start) <= Duration::days(8));
    });
}

/// Anything that is not 5, 6 or 7 fields is rejected
#[test]
fn property_wrong_field_count_is_rejected() {
    proptest!(|(fields in prop::collection::vec("[0-9*]{1,2}", 0..10))| {
        let expression = fields.join(" ");
        let result = parse_cron_expression(&expression);
        if !(5..=7).contains(&fields.len()) {
            prop_assert!(result.is_err());
        }
    });
}
