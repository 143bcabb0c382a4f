//! Configuration for the sync manager.

use std::time::Duration;

/// Configuration for a [`SyncManager`](crate::SyncManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Credential refresh retry configuration.
    pub refresh: RefreshConfig,
    /// Whether units are gated on a bearer credential at all.
    ///
    /// When false the manager skips all credential handling and starts units
    /// directly. Default is true.
    pub uses_credential: bool,
}

impl ManagerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            refresh: RefreshConfig::default(),
            uses_credential: true,
        }
    }

    /// Sets the credential refresh configuration.
    pub fn with_refresh(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = refresh;
        self
    }

    /// Sets whether the manager performs credential handling.
    pub fn with_uses_credential(mut self, uses_credential: bool) -> Self {
        self.uses_credential = uses_credential;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry configuration for credential refresh.
///
/// Refresh attempts back off linearly: the wait after a failed attempt is
/// `attempt_number * base_delay`.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Maximum number of refresh attempts before giving up.
    pub max_attempts: u32,
    /// Base delay unit for the linear backoff.
    pub base_delay: Duration,
}

impl RefreshConfig {
    /// Creates a refresh configuration with the given attempt limit.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(3),
        }
    }

    /// Sets the base backoff delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Returns the wait before the attempt following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_config_builder() {
        let config = ManagerConfig::new()
            .with_uses_credential(false)
            .with_refresh(RefreshConfig::new(5).with_base_delay(Duration::from_millis(50)));

        assert!(!config.uses_credential);
        assert_eq!(config.refresh.max_attempts, 5);
        assert_eq!(config.refresh.base_delay, Duration::from_millis(50));
    }

    #[test]
    fn defaults() {
        let config = ManagerConfig::default();
        assert!(config.uses_credential);
        assert_eq!(config.refresh.max_attempts, 3);
        assert_eq!(config.refresh.base_delay, Duration::from_secs(3));
    }

    #[test]
    fn linear_backoff() {
        let config = RefreshConfig::new(3).with_base_delay(Duration::from_secs(3));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(3));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(6));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(9));
    }
}
