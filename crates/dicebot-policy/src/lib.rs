//! Dicebot Policy Engine
//!
//! Per-platform outbound pacing and send timeouts

use dicebot_config::{PacingConfig, MAX_PACING_DELAY_SECS};
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Negative, NaN and oversized values fall back into `[0, MAX_PACING_DELAY_SECS]`.
fn clamped_delay(secs: f64) -> Duration {
    let max = Duration::from_secs_f64(MAX_PACING_DELAY_SECS);
    Duration::try_from_secs_f64(secs.max(0.0))
        .unwrap_or(max)
        .min(max)
}

#[derive(Debug, Clone)]
pub struct PacingPolicy {
    platforms: HashSet<String>,
    delay_min: Duration,
    delay_max: Duration,
    send_timeout: Duration,
}

impl PacingPolicy {
    pub fn new(config: Option<&PacingConfig>) -> Self {
        let defaults = PacingConfig::default();
        let config = config.unwrap_or(&defaults);

        let platforms = config
            .platforms
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let delay_min = clamped_delay(config.delay_min_secs);
        let delay_max = clamped_delay(config.delay_max_secs).max(delay_min);

        Self {
            platforms,
            delay_min,
            delay_max,
            send_timeout: Duration::from_secs(config.send_timeout_secs.max(1)),
        }
    }

    /// Policy that never paces; used by tests and console sessions.
    pub fn disabled() -> Self {
        Self {
            platforms: HashSet::new(),
            delay_min: Duration::ZERO,
            delay_max: Duration::ZERO,
            send_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn is_paced(&self, platform: &str) -> bool {
        self.platforms.contains(platform)
    }

    /// Delay to wait before one send on `platform`, or `None` if it is not paced.
    pub fn delay_for(&self, platform: &str) -> Option<Duration> {
        if !self.is_paced(platform) {
            return None;
        }
        if self.delay_max == self.delay_min {
            return Some(self.delay_min);
        }
        let secs = rand::thread_rng()
            .gen_range(self.delay_min.as_secs_f64()..=self.delay_max.as_secs_f64());
        Some(Duration::from_secs_f64(secs))
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::new(None)
    }
}
