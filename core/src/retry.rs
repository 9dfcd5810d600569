//! Switch-back pacing: exponential backoff while the user drags a tab, and
//! the debounce guard that collapses bursts of activation events.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::EngineConfig;

/// Delay sequence for drag retries.
///
/// Yields the current delay and then grows it by `factor` (floored to whole
/// milliseconds), capped at `max`. Never terminates on its own; the caller
/// stops when the lock moves.
#[derive(Debug, Clone)]
pub struct Backoff {
    current_ms: u64,
    max_ms: u64,
    factor: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        let max_ms = max.as_millis() as u64;
        Self {
            current_ms: (initial.as_millis() as u64).min(max_ms),
            max_ms,
            factor,
            attempt: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.initial_retry_delay(),
            config.retry_factor,
            config.max_retry_delay(),
        )
    }

    /// Retries handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        let grown = (self.current_ms as f64 * self.factor).floor() as u64;
        self.current_ms = grown.min(self.max_ms);
        self.attempt += 1;
        Duration::from_millis(delay)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Tracks whether a switch-back is running and when the last one started.
#[derive(Debug, Clone)]
pub struct SwitchGuard {
    in_progress: bool,
    last_attempt: Option<Instant>,
    debounce: Duration,
}

impl SwitchGuard {
    pub fn new(debounce: Duration) -> Self {
        Self {
            in_progress: false,
            last_attempt: None,
            debounce,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// True when a switch-back is already running and started less than the
    /// debounce window ago.
    pub fn should_debounce(&self, now: Instant) -> bool {
        match self.last_attempt {
            Some(last) if self.in_progress => now.saturating_duration_since(last) < self.debounce,
            _ => false,
        }
    }

    pub fn begin(&mut self, now: Instant) {
        self.in_progress = true;
        self.last_attempt = Some(now);
    }

    pub fn finish(&mut self) {
        self.in_progress = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_grows_by_half_and_caps() {
        let delays: Vec<u64> = Backoff::from_config(&EngineConfig::default())
            .take(9)
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 150, 225, 337, 505, 757, 1000, 1000, 1000]);
    }

    #[test]
    fn backoff_counts_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(10), 2.0, Duration::from_millis(50));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_debounces_only_while_in_progress() {
        let mut guard = SwitchGuard::new(Duration::from_millis(500));
        let start = Instant::now();
        assert!(!guard.should_debounce(start));

        guard.begin(start);
        assert!(guard.should_debounce(start + Duration::from_millis(499)));
        assert!(!guard.should_debounce(start + Duration::from_millis(500)));

        guard.finish();
        assert!(!guard.should_debounce(start + Duration::from_millis(10)));
    }
}
