//! Property-based tests for probe scheduling.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use crabrig::policy::DiscoveryPolicy;
use proptest::prelude::*;
use std::time::Duration;

fn policy_strategy() -> impl Strategy<Value = DiscoveryPolicy> {
    (1u64..2_000, 1u64..64, 1u32..10, any::<bool>(), 1u64..86_400).prop_map(
        |(base_ms, cap_factor, disable_after, prefer_cache, refresh_secs)| DiscoveryPolicy {
            refresh_interval: Duration::from_secs(refresh_secs),
            prefer_cache,
            backoff_base: Duration::from_millis(base_ms),
            backoff_cap: Duration::from_millis(base_ms * cap_factor),
            disable_after,
        },
    )
}

proptest! {
    /// Delays never shrink as failures accumulate and never pass the cap.
    #[test]
    fn backoff_is_monotonic_and_capped(policy in policy_strategy(), failures in 1u32..80) {
        let previous = policy.next_probe_delay(failures - 1);
        let current = policy.next_probe_delay(failures);
        prop_assert!(current >= previous);
        prop_assert!(current <= policy.backoff_cap);
        prop_assert!(current >= policy.backoff_base.min(policy.backoff_cap));
    }

    #[test]
    fn success_resets_backoff(policy in policy_strategy()) {
        prop_assert_eq!(policy.next_probe_delay(0), Duration::ZERO);
    }

    /// Once disabled, further failures keep probing disabled.
    #[test]
    fn disable_is_sticky(policy in policy_strategy(), failures in 0u32..40) {
        if policy.should_disable(failures) {
            prop_assert!(policy.should_disable(failures + 1));
        } else {
            prop_assert!(failures < policy.disable_after);
        }
    }

    /// Freshness depends only on elapsed time unless a cached copy may be
    /// preferred.
    #[test]
    fn probe_decision_follows_elapsed_time(
        policy in policy_strategy(),
        elapsed_secs in 0i64..200_000,
        cached in any::<bool>(),
    ) {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let last = now - ChronoDuration::seconds(elapsed_secs);
        let cache_ts = cached.then_some(last);
        let decision = policy.should_probe(Some(last), cache_ts, now);
        if policy.prefer_cache && cached {
            prop_assert!(!decision);
        } else {
            prop_assert_eq!(decision, elapsed_secs as u64 >= policy.refresh_interval.as_secs());
        }
        prop_assert!(policy.should_probe(None, cache_ts, now));
    }
}
