//! Limiter policy configuration.
//!
//! A [`LimiterConfig`] is validated on construction and immutable afterwards.
//! Routes that need different policies each build their own config and their
//! own [`crate::Limiter`].

use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

/// Default counting window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Default cap on compare-and-persist conflicts per decision.
pub const DEFAULT_MAX_CONFLICT_RETRIES: usize = 32;

/// How a request's identity is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityMode {
    /// Track by client address with the default IP budget.
    IpOnly,
    /// Track by API key with the key's own budget.
    ApiKeyOnly,
    /// Prefer a known API key, fall back to the client address.
    #[default]
    IpOrApiKey,
}

impl IdentityMode {
    /// Stable label used in logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityMode::IpOnly => "ip",
            IdentityMode::ApiKeyOnly => "api_key",
            IdentityMode::IpOrApiKey => "ip_or_api_key",
        }
    }
}

impl std::fmt::Display for IdentityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityMode {
    type Err = ConfigError;

    /// Accepts the labels from [`IdentityMode::as_str`] and the legacy numeric
    /// codes `0` (ip), `1` (api key) and `2` (either).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "ip" | "ip_only" => Ok(IdentityMode::IpOnly),
            "1" | "api_key" | "api_key_only" | "apikey" => Ok(IdentityMode::ApiKeyOnly),
            "2" | "ip_or_api_key" | "ip-apikey" | "either" => Ok(IdentityMode::IpOrApiKey),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// Validated, immutable configuration for one limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    mode: IdentityMode,
    window: Duration,
    block_duration: Duration,
    default_max_requests_for_ip: u32,
    max_conflict_retries: usize,
}

impl LimiterConfig {
    /// Create a config with a one second window.
    ///
    /// # Examples
    /// ```
    /// use gatekeep::{IdentityMode, LimiterConfig};
    /// use std::time::Duration;
    /// let cfg = LimiterConfig::new(IdentityMode::IpOnly, 10, Duration::from_secs(5)).unwrap();
    /// assert_eq!(cfg.window(), Duration::from_secs(1));
    /// ```
    pub fn new(
        mode: IdentityMode,
        default_max_requests_for_ip: u32,
        block_duration: Duration,
    ) -> Result<Self, ConfigError> {
        if default_max_requests_for_ip == 0 {
            return Err(ConfigError::InvalidBudget { provided: 0 });
        }
        if block_duration.is_zero() {
            return Err(ConfigError::InvalidBlockDuration(block_duration));
        }
        Ok(Self {
            mode,
            window: DEFAULT_WINDOW,
            block_duration,
            default_max_requests_for_ip,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        })
    }

    /// Override the counting window; must be > 0.
    pub fn with_window(mut self, window: Duration) -> Result<Self, ConfigError> {
        if window.is_zero() {
            return Err(ConfigError::InvalidWindow(window));
        }
        self.window = window;
        Ok(self)
    }

    /// Override the compare-and-persist conflict cap; must be > 0.
    pub fn with_conflict_retries(mut self, retries: usize) -> Result<Self, ConfigError> {
        if retries == 0 {
            return Err(ConfigError::InvalidConflictRetries);
        }
        self.max_conflict_retries = retries;
        Ok(self)
    }

    /// Identity selection mode.
    pub fn mode(&self) -> IdentityMode {
        self.mode
    }

    /// Length of the counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Cooldown applied once a budget is exceeded.
    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Budget used when the identity is a client address.
    pub fn default_max_requests_for_ip(&self) -> u32 {
        self.default_max_requests_for_ip
    }

    /// Maximum compare-and-persist attempts for a single decision.
    pub fn max_conflict_retries(&self) -> usize {
        self.max_conflict_retries
    }
}
