//! When, and how soon, to dial the relay again
//!
//! A dropped connection is retried with a growing, jittered delay. A
//! rejected registration is not: the relay would answer the same way.

use std::time::Duration;

use mole_shared::Error;
use rand::Rng;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);
const FACTOR: f64 = 2.0;
/// Fraction of the delay added or removed at random
const JITTER: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    enabled: bool,
    base: Duration,
    max: Duration,
    jitter: f64,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            base: BASE_DELAY,
            max: MAX_DELAY,
            jitter: JITTER,
            failures: 0,
        }
    }

    /// The relay accepted us; the next failure starts from the base delay.
    pub fn connected(&mut self) {
        self.failures = 0;
    }

    /// Delay before redialling after `err`, or `None` to give up.
    pub fn retry_after(&mut self, err: &Error) -> Option<Duration> {
        if !self.enabled || err.is_permanent() {
            return None;
        }
        let delay = self.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        Some(delay)
    }

    fn delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let nominal = (self.base.as_secs_f64() * FACTOR.powi(exponent)).min(self.max.as_secs_f64());

        let spread = nominal * self.jitter;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((nominal + offset).clamp(0.0, self.max.as_secs_f64()))
    }
}
