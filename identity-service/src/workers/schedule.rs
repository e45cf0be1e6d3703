//! Retry backoff, idle sleep and batch sizing shared by the event workers.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::config::WorkerConfig;

/// Relative jitter applied to retry delays.
const RETRY_JITTER: f64 = 0.2;

/// Delay before the next attempt of a row that has failed `attempts` times:
/// `min * 2^(attempts-1)` capped at `max`, jittered by ±20% and clamped to
/// `[min, max]`.
pub fn retry_delay(attempts: i32, min: Duration, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
    let base = min
        .checked_mul(2u32.saturating_pow(exponent))
        .unwrap_or(max)
        .min(max);

    let factor = rand::thread_rng().gen_range((1.0 - RETRY_JITTER)..=(1.0 + RETRY_JITTER));
    base.mul_f64(factor).clamp(min, max.max(min))
}

pub fn next_attempt_at(
    now: DateTime<Utc>,
    attempts: i32,
    config: &WorkerConfig,
) -> DateTime<Utc> {
    let delay = retry_delay(attempts, config.min_next_attempt(), config.max_next_attempt());
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Random pause in `[min, max]` after a poll that found nothing.
pub fn idle_sleep(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

/// Batch size that grows while batches come back full and shrinks when
/// they come back short.
#[derive(Debug, Clone)]
pub struct AdaptiveBatch {
    current: usize,
    min: usize,
    max: usize,
}

impl AdaptiveBatch {
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self {
            current: min,
            min,
            max: max.max(min),
        }
    }

    pub fn size(&self) -> usize {
        self.current
    }

    /// Adjusts the size after a batch that asked for `requested` rows and
    /// got `claimed`.
    pub fn record(&mut self, claimed: usize, requested: usize) {
        if requested > 0 && claimed >= requested {
            self.current = (self.current * 2).min(self.max);
        } else {
            self.current = (self.current / 2).max(self.min);
        }
    }
}
