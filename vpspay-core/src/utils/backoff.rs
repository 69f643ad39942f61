use rand::Rng;
use std::time::Duration;

/// Exponent cap; `base * 2^16` is far above any sensible `max`.
const MAX_EXPONENT: u32 = 16;

/// Exponential backoff with jitter, bounded by `max`.
///
/// The delay for attempt `n` is drawn uniformly from
/// `[ceiling / 2, ceiling]` where `ceiling = min(base * 2^n, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the delay for the current attempt, without jitter.
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(MAX_EXPONENT));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next retry; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms < 2 {
            return ceiling;
        }
        let jittered = rand::rng().random_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(jittered)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
