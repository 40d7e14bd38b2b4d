use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Exponential backoff parameters.
///
/// The connection manager and every RPC call hold their own copy; nothing about a schedule is
/// shared between them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the additive jitter as a fraction of the nominal delay.
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_ratio: 0.3,
        }
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() && ratio >= 0.0 {
            ratio
        } else {
            0.0
        };
        self
    }

    /// `min(base * 2^attempt, max)` without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 1u128.checked_shl(attempt).unwrap_or(u128::MAX);
        let nanos = self
            .base
            .as_nanos()
            .saturating_mul(factor)
            .min(self.max.as_nanos());
        duration_from_nanos(nanos)
    }

    /// Delay for `attempt` using a jitter sample `unit` in `[0, 1)`.
    ///
    /// Below the cap the delay is `nominal + nominal * jitter_ratio * unit`. Once that would
    /// pass `max`, the same relative spread is taken below `max` instead, so capped delays stay
    /// randomized and never exceed `max`.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let nominal = self.nominal(attempt).as_nanos();
        let max = self.max.as_nanos();
        let unit = unit.clamp(0.0, 1.0);
        let ratio = self.jitter_ratio;
        let span = (nominal as f64 * ratio) as u128;
        if nominal.saturating_add(span) <= max {
            let jitter = (span as f64 * unit) as u128;
            return duration_from_nanos(nominal + jitter);
        }
        let spread = (max as f64 * ratio / (1.0 + ratio) * (1.0 - unit)) as u128;
        duration_from_nanos(max.saturating_sub(spread))
    }

    /// Delay for `attempt` with jitter drawn from `[0, nominal * jitter_ratio)`, spread below
    /// `max` once capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = SmallRng::from_entropy();
        self.delay_with(attempt, rng.gen_range(0.0..1.0))
    }
}

fn duration_from_nanos(nanos: u128) -> Duration {
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// What the connection manager should do after a failed or lost connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPlan {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Reconnect policy: a backoff schedule plus a budget of consecutive attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(backoff: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts,
        }
    }

    /// Plan the next retry given the number of consecutive failures so far.
    ///
    /// The returned attempt number is the incremented counter the caller should store.
    pub fn plan(&self, attempt: u32) -> ReconnectPlan {
        if attempt >= self.max_attempts {
            return ReconnectPlan::GiveUp { attempts: attempt };
        }
        ReconnectPlan::Retry {
            attempt: attempt.saturating_add(1),
            delay: self.backoff.delay(attempt),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1_000));
        let delays: Vec<_> = (0..6).map(|a| policy.nominal(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1_000),
                Duration::from_millis(1_000),
            ]
        );
        assert_eq!(policy.nominal(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn jittered_delay_stays_in_band_and_under_max() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2));
        for attempt in 0..8 {
            let nominal = policy.nominal(attempt).as_secs_f64();
            for _ in 0..200 {
                let delay = policy.delay(attempt);
                assert!(delay <= policy.max);
                assert!(delay.as_secs_f64() <= nominal * 1.3 + 1e-9);
                assert!(delay.as_secs_f64() >= nominal / 1.3 - 1e-9);
            }
        }
        for attempt in 0..4 {
            let nominal = policy.nominal(attempt);
            assert_eq!(policy.delay_with(attempt, 0.0), nominal);
        }
    }

    #[test]
    fn capped_delays_keep_their_spread() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: std::collections::BTreeSet<Duration> =
            (0..200).map(|_| policy.delay(9)).collect();
        assert!(delays.len() > 1, "capped delays collapsed to {delays:?}");
        assert!(delays.iter().all(|d| *d <= policy.max));
        assert!(delays.iter().all(|d| d.as_secs_f64() >= 30.0 / 1.3 - 1e-6));

        assert_eq!(policy.delay_with(9, 1.0), policy.max);
        assert!(policy.delay_with(9, 0.0) < policy.delay_with(9, 0.5));
    }

    #[test]
    fn mean_delay_increases_with_attempt_up_to_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(50), Duration::from_millis(900));
        let mean = |attempt: u32| {
            (0..500)
                .map(|_| policy.delay(attempt).as_secs_f64())
                .sum::<f64>()
                / 500.0
        };
        let means: Vec<f64> = (0..4).map(mean).collect();
        for pair in means.windows(2) {
            assert!(pair[1] > pair[0], "means not increasing: {means:?}");
        }
        assert!(mean(10) <= 0.9);
    }

    #[test]
    fn invalid_jitter_ratio_disables_jitter() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_secs(1))
            .with_jitter_ratio(f64::NAN);
        assert_eq!(policy.delay_with(1, 0.99), Duration::from_millis(20));
    }

    #[test]
    fn reconnect_policy_gives_up_after_budget() {
        let policy = ReconnectPolicy::new(
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
            2,
        );
        assert!(matches!(policy.plan(0), ReconnectPlan::Retry { attempt: 1, .. }));
        assert!(matches!(policy.plan(1), ReconnectPlan::Retry { attempt: 2, .. }));
        assert_eq!(policy.plan(2), ReconnectPlan::GiveUp { attempts: 2 });
    }
}
