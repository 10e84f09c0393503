use std::time::Duration;

use proptest::prelude::*;

use forecycle::chain::{Backoff, RetryPolicy};

proptest! {
    #[test]
    fn exponential_delays_never_shrink(
        base_ms in 0u64..60_000,
        factor in 1u32..5,
        cap_ms in proptest::option::of(1u64..3_600_000),
    ) {
        let max = cap_ms.map(Duration::from_millis);
        let backoff = Backoff::exponential(Duration::from_millis(base_ms), factor, max);

        let delays: Vec<Duration> = (0..48).map(|n| backoff.delay_for(n)).collect();
        prop_assert_eq!(delays[0], max.map_or(backoff.base, |m| backoff.base.min(m)));
        for pair in delays.windows(2) {
            prop_assert!(pair[0] <= pair[1], "{:?} then {:?}", pair[0], pair[1]);
        }
        if let Some(max) = max {
            prop_assert!(delays.iter().all(|d| *d <= max));
        }
    }

    #[test]
    fn fixed_delay_is_constant(base_ms in 0u64..86_400_000, n in 0u32..1_000) {
        let backoff = Backoff::fixed(Duration::from_millis(base_ms));
        prop_assert_eq!(backoff.delay_for(n), Duration::from_millis(base_ms));
    }

    #[test]
    fn a_policy_allows_exactly_max_retries(max_retries in 0u32..20) {
        let policy = RetryPolicy {
            max_retries,
            backoff: Backoff::fixed(Duration::ZERO),
        };
        let allowed = (0..100).filter(|n| policy.allows_retry(*n)).count();
        prop_assert_eq!(allowed, max_retries as usize);
    }
}
