use std::time::Duration;

use rand::Rng;

/// Spread applied to each delay, as a fraction either side of the base.
pub const DEFAULT_JITTER: f64 = 0.2;

/// Doubling delay between relist attempts, capped at `max`.
///
/// The base delay doubles deterministically; each returned delay is the base scaled by a random
/// factor in `1 ± jitter`, still capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    current: Option<Duration>,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial), jitter: DEFAULT_JITTER, current: None, attempts: 0 }
    }

    /// Override the spread; 0 gives the plain doubling sequence.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = match self.current {
            None => self.initial,
            Some(cur) => cur.saturating_mul(2).min(self.max),
        };
        self.current = Some(base);
        self.attempts = self.attempts.saturating_add(1);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor).min(self.max)
    }

    pub fn attempts(&self) -> u32 { self.attempts }

    pub fn reset(&mut self) {
        self.current = None;
        self.attempts = 0;
    }
}
