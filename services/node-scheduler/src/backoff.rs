//! Reconnect backoff shared by every watcher task.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, capped at `max`.
///
/// Watchers sleep for `delay(attempt)` before re-subscribing. The cap keeps
/// the delay in a fixed band once a collaborator stays down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any delay, jitter included.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            max: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// A policy without jitter, for deterministic timing.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis() as f64;
        let max = self.max.as_millis() as f64;
        let delay = (base * 2.0_f64.powi(attempt.min(16) as i32)).min(max);

        let range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if range > 0.0 {
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).clamp(0.0, max) as u64)
    }
}
