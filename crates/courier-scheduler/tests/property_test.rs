//! Property-based tests for schedule parsing and fire-time computation.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use courier_scheduler::{schedule::parse_interval, Schedule};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn instant_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    // 2020-01-01 through roughly 2035.
    (1_577_836_800i64..2_051_222_400).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn cron_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "*/5 * * * *",
        "0 3 * * *",
        "30 9 * * Mon-Fri",
        "0 0 1 * *",
        "15 */2 * * 0",
        "*/10 * * * * *",
        "@hourly",
        "@daily",
        "@weekly",
    ])
    .prop_map(str::to_string)
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn cron_fire_times_are_strictly_increasing(
        expression in cron_strategy(),
        start in instant_strategy(),
    ) {
        let schedule = Schedule::parse(&expression).unwrap();
        let mut previous = start;
        for _ in 0..5 {
            let next = schedule.next_after(previous).unwrap();
            prop_assert!(next > previous, "{expression}: {next} not after {previous}");
            previous = next;
        }
    }

    #[test]
    fn every_fires_exactly_one_interval_later(
        hours in 0u64..48,
        minutes in 0u64..60,
        seconds in 1u64..60,
        start in instant_strategy(),
    ) {
        let expression = format!("@every {hours}h{minutes}m{seconds}s");
        let expected = Duration::from_secs(hours * 3600 + minutes * 60 + seconds);
        let schedule = Schedule::parse(&expression).unwrap();

        prop_assert_eq!(schedule.interval(), Some(expected));
        prop_assert_eq!(schedule.delay_from(start), Some(expected));
    }

    #[test]
    fn interval_units_scale_consistently(value in 1u64..10_000) {
        prop_assert_eq!(
            parse_interval(&format!("{value}m")).unwrap(),
            parse_interval(&format!("{}s", value * 60)).unwrap()
        );
        prop_assert_eq!(
            parse_interval(&format!("{value}s")).unwrap(),
            parse_interval(&format!("{}ms", value * 1000)).unwrap()
        );
    }

    #[test]
    fn garbage_never_parses(noise in "[a-z]{1,12}") {
        prop_assert!(Schedule::parse(&noise).is_err());
    }
}
