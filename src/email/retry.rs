//! Backoff schedule for the outbox
//!
//! Each `process_outbox` pass that cannot hand a thread to a station counts
//! as one failed pass. The next attempt waits an exponentially growing,
//! capped delay; after `max_failed_passes` the thread is marked failed.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for undeliverable threads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failed passes before the thread moves to `failed`
    pub max_failed_passes: u32,
    /// Delay after the first failed pass, in seconds
    pub base_delay_secs: u64,
    /// Ceiling for the delay, in seconds
    pub max_delay_secs: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add up to 10% jitter
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failed_passes: 8,
            base_delay_secs: 5,
            max_delay_secs: 15 * 60,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    /// Policy without waiting between passes
    pub fn immediate(max_failed_passes: u32) -> Self {
        Self {
            max_failed_passes,
            base_delay_secs: 0,
            max_delay_secs: 0,
            backoff_multiplier: 1.0,
            jitter_enabled: false,
        }
    }

    pub fn is_exhausted(&self, failed_passes: u32) -> bool {
        failed_passes >= self.max_failed_passes
    }

    /// Delay before the next attempt after `failed_passes` failures
    pub fn delay_for(&self, failed_passes: u32) -> Duration {
        if failed_passes == 0 || self.base_delay_secs == 0 {
            return Duration::ZERO;
        }

        let exponent = (failed_passes - 1).min(32) as i32;
        let secs = self.base_delay_secs as f64 * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay_secs as f64).max(0.0);
        let delay = Duration::from_secs_f64(capped);

        if self.jitter_enabled {
            add_jitter(delay)
        } else {
            delay
        }
    }

    /// When the next attempt becomes eligible
    pub fn next_attempt_at(&self, now: DateTime<Utc>, failed_passes: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(failed_passes))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay_secs as i64));
        now + delay
    }
}

/// Up to 10% either way, so stations coming back are not hit all at once
fn add_jitter(delay: Duration) -> Duration {
    let range = delay.as_millis() as f64 * 0.1;
    if range < 1.0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(-range..=range);
    let adjusted = (delay.as_millis() as f64 + jitter).max(0.0) as u64;
    Duration::from_millis(adjusted)
}
