//! Configuration for the streaming engine.

use std::time::Duration;
use streamsync_protocol::StreamRequirements;

/// Environment variable overriding [`EngineConfig::min_ack_interval`].
pub const ENV_ACK_INTERVAL_MS: &str = "STREAMSYNC_ACK_INTERVAL_MS";

/// Environment variable overriding [`EngineConfig::reconnect_delay`].
pub const ENV_RECONNECT_DELAY_MS: &str = "STREAMSYNC_RECONNECT_DELAY_MS";

/// Configuration for the streaming engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the control-channel WebSocket endpoint.
    pub control_path: String,
    /// Path of the ad-hoc query streaming endpoint.
    pub query_path: String,
    /// Minimum spacing between two `next` messages for the same stream.
    pub min_ack_interval: Duration,
    /// Delay before reconnecting the control channel after a failure.
    pub reconnect_delay: Duration,
    /// Data-channel retry configuration.
    pub retry: RetryConfig,
    /// Reserved streams that are never opened automatically.
    pub requirements: StreamRequirements,
    /// Whether every non-reserved catalog stream is activated on registration.
    pub auto_activate_catalog: bool,
    /// Default `Accept` header for data channels.
    pub default_accept: String,
    /// How long `dispose` waits for data channels to settle.
    pub shutdown_timeout: Duration,
}

impl EngineConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            control_path: "/events".into(),
            query_path: "/core/query/v1/eql".into(),
            min_ack_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_secs(2),
            retry: RetryConfig::default(),
            requirements: StreamRequirements::default(),
            auto_activate_catalog: true,
            default_accept: "text/event-stream".into(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the control-channel path.
    pub fn with_control_path(mut self, path: impl Into<String>) -> Self {
        self.control_path = path.into();
        self
    }

    /// Sets the query endpoint path.
    pub fn with_query_path(mut self, path: impl Into<String>) -> Self {
        self.query_path = path.into();
        self
    }

    /// Sets the minimum acknowledgement interval.
    pub fn with_min_ack_interval(mut self, interval: Duration) -> Self {
        self.min_ack_interval = interval;
        self
    }

    /// Sets the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the reserved-stream table.
    pub fn with_requirements(mut self, requirements: StreamRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Enables or disables catalog auto-activation.
    pub fn with_auto_activate_catalog(mut self, enabled: bool) -> Self {
        self.auto_activate_catalog = enabled;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Applies overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_millis(&lookup, ENV_ACK_INTERVAL_MS) {
            self.min_ack_interval = ms;
        }
        if let Some(ms) = parse_millis(&lookup, ENV_RECONNECT_DELAY_MS) {
            self.reconnect_delay = ms;
        }
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring non-numeric override");
            None
        }
    }
}

/// Configuration for data-channel retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% extra
            let jitter = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.min_ack_interval, Duration::from_millis(50));
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.auto_activate_catalog);
        assert!(config.requirements.is_excluded("summary"));
    }

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new()
            .with_control_path("/ws")
            .with_min_ack_interval(Duration::from_millis(10))
            .with_auto_activate_catalog(false);

        assert_eq!(config.control_path, "/ws");
        assert_eq!(config.min_ack_interval, Duration::from_millis(10));
        assert!(!config.auto_activate_catalog);
    }

    #[test]
    fn overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_ACK_INTERVAL_MS, "120"),
            (ENV_RECONNECT_DELAY_MS, "soon"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::new().with_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.min_ack_interval, Duration::from_millis(120));
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn retry_delay_doubles_from_one_second() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10);
        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(30));
    }

    #[test]
    fn retry_jitter_stays_within_bounds() {
        let config = RetryConfig {
            add_jitter: true,
            ..RetryConfig::default()
        };
        let delay = config.delay_for_attempt(2);
        assert!(delay >= Duration::from_secs(2));
        assert!(delay <= Duration::from_millis(2500));
    }
}
