use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Shape of the delay curve between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

/// Backoff policy stored on every job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn exponential(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
        }
    }

    pub fn fixed(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(1000)
    }
}

/// Engine-wide adjustments applied on top of a job's [`BackoffPolicy`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Symmetric jitter as a fraction of the computed delay (0.2 means ±20%).
    /// Zero, the default, keeps delays exact.
    pub jitter_ratio: f64,
    /// Upper bound on any single retry delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            jitter_ratio: 0.0,
            max_delay_ms: 3_600_000,
        }
    }
}

/// Delay before the next attempt once `attempts_made` attempts have failed.
///
/// Exponential: `base * 2^(attempts_made - 1)`. Fixed: `base`.
/// Zero attempts yields no delay.
pub fn compute_delay(attempts_made: u32, policy: &BackoffPolicy) -> Duration {
    if attempts_made == 0 {
        return Duration::ZERO;
    }

    let ms = match policy.kind {
        BackoffKind::Fixed => policy.base_delay_ms,
        BackoffKind::Exponential => {
            let exp = attempts_made.saturating_sub(1).min(63);
            policy
                .base_delay_ms
                .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX))
        }
    };

    Duration::from_millis(ms)
}

/// Caps `delay` and spreads it by up to `jitter_ratio` in either direction.
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, config: &RetryConfig, rng: &mut R) -> Duration {
    let capped_ms = (delay.as_millis() as u64).min(config.max_delay_ms);
    let ratio = config.jitter_ratio.clamp(0.0, 1.0);
    if ratio == 0.0 || capped_ms == 0 {
        return Duration::from_millis(capped_ms);
    }

    let spread = capped_ms as f64 * ratio;
    let offset = rng.gen_range(-spread..=spread);
    let jittered = (capped_ms as f64 + offset).max(0.0) as u64;
    Duration::from_millis(jittered.min(config.max_delay_ms))
}

/// What to do with a job whose attempt just failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Park the job in `delayed` for this long.
    Retry { delay: Duration },
    /// Terminal failure.
    Fail,
}

/// Decides between another attempt and terminal failure.
///
/// `attempts_made` counts the attempt that just ended.
pub fn decide(
    attempts_made: u32,
    max_attempts: u32,
    policy: &BackoffPolicy,
    permanent: bool,
    config: &RetryConfig,
) -> RetryDecision {
    if permanent || attempts_made >= max_attempts {
        return RetryDecision::Fail;
    }

    let delay = apply_jitter(
        compute_delay(attempts_made, policy),
        config,
        &mut rand::thread_rng(),
    );
    RetryDecision::Retry { delay }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter_ratio: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_delays_double() {
        let policy = BackoffPolicy::exponential(1000);
        assert_eq!(compute_delay(1, &policy), Duration::from_millis(1000));
        assert_eq!(compute_delay(2, &policy), Duration::from_millis(2000));
        assert_eq!(compute_delay(3, &policy), Duration::from_millis(4000));
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = BackoffPolicy::fixed(250);
        for attempt in 1..=5 {
            assert_eq!(compute_delay(attempt, &policy), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_zero_attempts_has_no_delay() {
        assert_eq!(
            compute_delay(0, &BackoffPolicy::exponential(1000)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_huge_attempt_counts_saturate() {
        let delay = compute_delay(200, &BackoffPolicy::exponential(1000));
        assert_eq!(delay, Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let config = RetryConfig {
            jitter_ratio: 0.2,
            max_delay_ms: 60_000,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let delay = apply_jitter(Duration::from_millis(1000), &config, &mut rng);
            let ms = delay.as_millis() as u64;
            assert!((800..=1200).contains(&ms), "delay {ms} out of range");
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig {
            jitter_ratio: 0.0,
            max_delay_ms: 5000,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let delay = apply_jitter(
            compute_delay(10, &BackoffPolicy::exponential(1000)),
            &config,
            &mut rng,
        );
        assert_eq!(delay, Duration::from_millis(5000));
    }

    #[test]
    fn test_decide_retries_until_exhausted() {
        let policy = BackoffPolicy::exponential(1000);
        assert_eq!(
            decide(1, 3, &policy, false, &no_jitter()),
            RetryDecision::Retry {
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            decide(2, 3, &policy, false, &no_jitter()),
            RetryDecision::Retry {
                delay: Duration::from_millis(2000)
            }
        );
        assert_eq!(decide(3, 3, &policy, false, &no_jitter()), RetryDecision::Fail);
    }

    #[test]
    fn test_default_config_gives_exact_delays() {
        let policy = BackoffPolicy::exponential(1000);
        let config = RetryConfig::default();
        for _ in 0..50 {
            let delays: Vec<_> = (1..=4)
                .map(|attempt| decide(attempt, 5, &policy, false, &config))
                .collect();
            assert_eq!(
                delays,
                [1000, 2000, 4000, 8000]
                    .map(|ms| RetryDecision::Retry {
                        delay: Duration::from_millis(ms)
                    })
                    .to_vec()
            );
        }
    }

    #[test]
    fn test_permanent_errors_skip_remaining_attempts() {
        let policy = BackoffPolicy::fixed(10);
        assert_eq!(decide(1, 5, &policy, true, &no_jitter()), RetryDecision::Fail);
    }
}
