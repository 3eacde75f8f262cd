use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Exponential backoff policy with cap and jitter.
///
/// This is policy only: the engine owns the attempt counter and the retry
/// timer. Jitter spreads simultaneous reconnects across clients so a backend
/// restart does not produce a thundering herd.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub cap_exponent: u32,
    /// Upper bound of the multiplicative jitter, as a fraction of the raw delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay,
            cap_exponent: 6,
            jitter: 0.2,
        }
    }

    /// Delay before the next attempt, using an entropy-seeded RNG for jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = SmallRng::from_entropy();
        self.delay_with_rng(attempt, &mut rng)
    }

    /// Deterministic variant: callers pass a seeded RNG.
    ///
    /// The result is always within `[base, max_delay]`: the exponential part is
    /// clamped first, then up to `jitter` is added, then the cap is re-applied.
    pub fn delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let max = self.max_delay.max(self.base);
        let exponent = attempt.min(self.cap_exponent).min(32);
        let raw = (self.base.as_secs_f64() * 2f64.powi(exponent as i32))
            .clamp(self.base.as_secs_f64(), max.as_secs_f64());

        let jitter = if self.jitter > 0.0 {
            rng.gen_range(0.0..=self.jitter)
        } else {
            0.0
        };

        let jittered = (raw * (1.0 + jitter)).min(max.as_secs_f64());
        Duration::from_secs_f64(jittered)
    }
}
