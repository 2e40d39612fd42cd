//! Probe scheduling decisions.
//!
//! Pure functions of their inputs: no clock reads, no I/O. The registry feeds
//! in timestamps and failure counts and acts on the answers.

use crate::config::DiscoveryConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryPolicy {
    pub refresh_interval: Duration,
    pub prefer_cache: bool,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub disable_after: u32,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self::from_config(&DiscoveryConfig::default())
    }
}

impl DiscoveryPolicy {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            prefer_cache: config.prefer_cache,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            disable_after: config.disable_after_failures,
        }
    }

    /// Whether a device needs a fresh probe.
    ///
    /// A timestamp from the future (clock skew, restored RTC) counts as stale.
    pub fn should_probe(
        &self,
        last_probe: Option<DateTime<Utc>>,
        cache_ts: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last_probe) = last_probe else {
            return true;
        };
        if self.prefer_cache && cache_ts.is_some() {
            return false;
        }
        match now.signed_duration_since(last_probe).to_std() {
            Ok(elapsed) => elapsed >= self.refresh_interval,
            Err(_) => true,
        }
    }

    /// Delay before the next probe attempt after `failures` consecutive
    /// failures. Zero after a success.
    pub fn next_probe_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    pub fn should_disable(&self, failures: u32) -> bool {
        failures >= self.disable_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn policy() -> DiscoveryPolicy {
        DiscoveryPolicy {
            refresh_interval: Duration::from_secs(3600),
            prefer_cache: false,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            disable_after: 3,
        }
    }

    #[test]
    fn test_never_probed_always_probes() {
        let now = Utc::now();
        assert!(policy().should_probe(None, None, now));
        let prefer = DiscoveryPolicy {
            prefer_cache: true,
            ..policy()
        };
        assert!(prefer.should_probe(None, Some(now), now));
    }

    #[test]
    fn test_prefer_cache_skips_probe() {
        let now = Utc::now();
        let old = now - ChronoDuration::days(30);
        let prefer = DiscoveryPolicy {
            prefer_cache: true,
            ..policy()
        };
        assert!(!prefer.should_probe(Some(old), Some(old), now));
        assert!(prefer.should_probe(Some(old), None, now));
    }

    #[test]
    fn test_refresh_interval() {
        let now = Utc::now();
        let p = policy();
        assert!(!p.should_probe(Some(now - ChronoDuration::minutes(59)), Some(now), now));
        assert!(p.should_probe(Some(now - ChronoDuration::minutes(60)), Some(now), now));
    }

    #[test]
    fn test_future_timestamp_is_stale() {
        let now = Utc::now();
        assert!(policy().should_probe(Some(now + ChronoDuration::hours(2)), None, now));
    }

    #[test]
    fn test_backoff_sequence() {
        let p = policy();
        let delays: Vec<u64> = (0..9).map(|n| p.next_probe_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![0, 1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(p.next_probe_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_disable_threshold() {
        let p = policy();
        assert!(!p.should_disable(2));
        assert!(p.should_disable(3));
        assert!(p.should_disable(10));
    }
}
