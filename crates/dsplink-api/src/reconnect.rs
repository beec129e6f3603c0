use std::time::Duration;

/// Exponential backoff configuration for command-channel reconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Consecutive failed attempts before the channel parks in
    /// `Disconnected`. `None` means retry forever.
    pub max_attempts: Option<u32>,

    /// How long a parked channel sleeps before trying again. A new
    /// request wakes it early. Default: 5 minutes.
    pub long_sleep: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            long_sleep: Duration::from_secs(300),
        }
    }
}

impl ReconnectConfig {
    /// Whether `failures` consecutive failed attempts exhaust the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt * jitter, max)`
///
/// Jitter is +-25%, seeded from the attempt number so the sequence is
/// reproducible. The first attempt waits exactly `initial_delay`.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let max = config.max_delay.as_secs_f64();
    let capped = base.min(max);

    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).clamp(0.0, max);

    Duration::from_secs_f64(with_jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.max_attempts.is_none());
        assert_eq!(config.long_sleep, Duration::from_secs(300));
    }

    #[test]
    fn first_attempt_waits_initial_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(calculate_backoff(0, &config), Duration::from_secs(1));
    }

    #[test]
    fn backoff_grows_then_caps() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d2 = calculate_backoff(2, &config);
        let d4 = calculate_backoff(4, &config);
        assert!(d2 > d0, "d2 ({d2:?}) should exceed d0 ({d0:?})");
        assert!(d4 > d2, "d4 ({d4:?}) should exceed d2 ({d2:?})");

        for attempt in 0..64 {
            let d = calculate_backoff(attempt, &config);
            assert!(d <= Duration::from_secs(30), "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn exhausted_only_with_a_limit() {
        let unlimited = ReconnectConfig::default();
        assert!(!unlimited.exhausted(u32::MAX));

        let limited = ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::default()
        };
        assert!(!limited.exhausted(2));
        assert!(limited.exhausted(3));
    }
}
