use chrono::{DateTime, TimeDelta, Utc};
use proptest::prelude::*;

use forecycle::chain::Schedule;

fn schedule_strategy() -> impl Strategy<Value = Schedule> {
    (1i64..=48, 0i64..=24 * 60, 0u32..6)
        .prop_flat_map(|(cadence_h, lead_min, catch_up)| {
            (Just(cadence_h), Just(lead_min), Just(catch_up), 0..cadence_h)
        })
        .prop_map(|(cadence_h, lead_min, catch_up, offset_h)| {
            Schedule::new(TimeDelta::hours(cadence_h), TimeDelta::minutes(lead_min))
                .unwrap()
                .with_offset(TimeDelta::hours(offset_h))
                .with_catch_up(catch_up)
        })
}

fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    // 2020-01-01 .. 2030-01-01, second resolution
    (1_577_836_800i64..1_893_456_000).prop_map(|s| DateTime::from_timestamp(s, 0).unwrap())
}

proptest! {
    #[test]
    fn due_times_are_aligned_due_and_bounded(schedule in schedule_strategy(), now in instant()) {
        let due = schedule.due_reference_times(now, None);
        let step = schedule.cadence().num_seconds();

        prop_assert!(!due.is_empty());
        prop_assert!(due.len() <= schedule.catch_up() as usize + 1);
        for reference in &due {
            prop_assert!(*reference + schedule.lead_time() <= now);
            let latest = schedule.latest_due(now).unwrap();
            prop_assert_eq!((latest - *reference).num_seconds() % step, 0);
        }
        for pair in due.windows(2) {
            prop_assert_eq!(pair[0] - pair[1], schedule.cadence());
        }
    }

    #[test]
    fn the_next_window_is_not_yet_due(schedule in schedule_strategy(), now in instant()) {
        let latest = schedule.latest_due(now).unwrap();
        prop_assert!(latest + schedule.lead_time() <= now);
        prop_assert!(latest + schedule.cadence() + schedule.lead_time() > now);
    }

    #[test]
    fn latest_due_is_stable_within_a_window(schedule in schedule_strategy(), now in instant()) {
        let latest = schedule.latest_due(now).unwrap();
        let window_start = latest + schedule.lead_time();
        prop_assert_eq!(schedule.latest_due(window_start), Some(latest));
        let window_end = window_start + schedule.cadence() - TimeDelta::seconds(1);
        prop_assert_eq!(schedule.latest_due(window_end), Some(latest));
    }

    #[test]
    fn nothing_before_the_floor_is_returned(
        schedule in schedule_strategy(),
        now in instant(),
        back_h in 0i64..200,
    ) {
        let floor = now - TimeDelta::hours(back_h);
        for reference in schedule.due_reference_times(now, Some(floor)) {
            prop_assert!(reference >= floor);
        }
    }
}
