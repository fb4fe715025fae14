//! Exponential reconnect backoff
//!
//! `delay(n) = min(initial * multiplier^n, max)` with a symmetric jitter of
//! `jitter * delay` applied on top. The jittered value is clamped to `max`, so
//! the interval never exceeds the configured cap.

use super::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            initial_ms: config.initial_ms.max(1),
            max_ms: config.max_ms.max(config.initial_ms.max(1)),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay for the given zero-based attempt before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let ms = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Jittered delay for the given zero-based attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let spread = base * self.jitter;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        let ms = (base + offset).clamp(0.0, self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: f64) -> Backoff {
        Backoff::from_config(&BackoffConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter,
        })
    }

    #[test]
    fn base_delay_grows_then_caps() {
        let b = backoff(0.0);
        assert_eq!(b.base_delay(0), Duration::from_millis(100));
        assert_eq!(b.base_delay(1), Duration::from_millis(200));
        assert_eq!(b.base_delay(3), Duration::from_millis(800));
        assert_eq!(b.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(b.base_delay(1_000), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = backoff(0.5);
        for attempt in 0..20 {
            let base = b.base_delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let d = b.delay(attempt).as_millis() as f64;
                assert!(d <= 1_000.0, "delay {} exceeds cap", d);
                assert!(d >= base * 0.5 - 1.0, "delay {} below jitter floor", d);
            }
        }
    }

    #[test]
    fn config_is_sanitised() {
        let b = Backoff::from_config(&BackoffConfig {
            initial_ms: 0,
            max_ms: 0,
            multiplier: 0.5,
            jitter: 3.0,
        });
        assert_eq!(b.base_delay(0), Duration::from_millis(1));
        assert_eq!(b.max(), Duration::from_millis(1));
        assert!(b.delay(10) <= Duration::from_millis(1));
    }
}
