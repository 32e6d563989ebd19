//! Session assurance configuration.
//!
//! Durations are written in humantime notation (`"15s"`, `"24h"`).
//!
//! # Example (TOML)
//!
//! ```toml
//! [session]
//! lifetime = "24h"
//!
//! [marker]
//! ttl = "15s"
//!
//! [bridge]
//! retry_delay = "150ms"
//! retry_after = "1s"
//!
//! [provider]
//! kind = "http"
//! base_url = "https://kratos.internal:4433"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the transition marker TTL.
const MAX_MARKER_TTL: Duration = Duration::from_secs(300);

/// Root configuration for the assurance coordinator.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AssuranceConfig {
    /// Session lifetime settings.
    pub session: SessionConfig,

    /// Step-up challenge settings.
    pub step_up: StepUpConfig,

    /// Transition marker settings.
    pub marker: MarkerConfig,

    /// Bridging-window settings.
    pub bridge: BridgeConfig,

    /// Timeouts on store and provider calls.
    pub timeouts: TimeoutConfig,

    /// Identity provider adapter selection.
    pub provider: ProviderConfig,
}

/// Session lifetime configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a session from creation or renewal.
    #[serde(with = "humantime_serde")]
    pub lifetime: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(24 * 3600), // 24 hours
        }
    }
}

/// Step-up configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StepUpConfig {
    /// Maximum lifetime of a pending challenge, whatever the provider says.
    #[serde(with = "humantime_serde")]
    pub challenge_ttl: Duration,

    /// Compare-and-swap rounds before a write reports contention.
    pub max_write_attempts: u32,
}

impl Default for StepUpConfig {
    fn default() -> Self {
        Self {
            challenge_ttl: Duration::from_secs(300), // 5 minutes
            max_write_attempts: 5,
        }
    }
}

/// Transition marker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// How long an issued marker counts as evidence of recent authentication.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
        }
    }
}

/// Bridging-window configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Delay before the single confirming re-read of the store.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Retry hint returned to callers with a pending decision.
    #[serde(with = "humantime_serde")]
    pub retry_after: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(150),
            retry_after: Duration::from_secs(1),
        }
    }
}

/// Timeouts applied to every suspension point.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Limit on a single store read or write.
    #[serde(with = "humantime_serde")]
    pub store: Duration,

    /// Limit on a single identity provider call.
    #[serde(with = "humantime_serde")]
    pub provider: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store: Duration::from_millis(50),
            provider: Duration::from_secs(5),
        }
    }
}

/// Which identity provider adapter to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Vendor-neutral JSON-over-HTTP adapter.
    #[default]
    Http,
}

/// Identity provider adapter configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Adapter selected for this deployment.
    pub kind: ProviderKind,

    /// Base URL of the provider's API.
    pub base_url: String,

    /// Allow a plain `http://` base URL (local development only).
    pub allow_http: bool,

    /// How long completed challenge outcomes are remembered for replays.
    #[serde(with = "humantime_serde")]
    pub replay_retention: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Http,
            base_url: "https://localhost:4433".to_string(),
            allow_http: false,
            replay_retention: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration sources could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl AssuranceConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - Any lifetime, TTL or timeout is zero
    /// - The marker TTL exceeds five minutes
    /// - The bridge retry delay is not shorter than the marker TTL
    /// - `max_write_attempts` is zero
    /// - The provider base URL is not a valid URL, or is plain HTTP without `allow_http`
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("session.lifetime", self.session.lifetime),
            ("step_up.challenge_ttl", self.step_up.challenge_ttl),
            ("marker.ttl", self.marker.ttl),
            ("bridge.retry_after", self.bridge.retry_after),
            ("timeouts.store", self.timeouts.store),
            ("timeouts.provider", self.timeouts.provider),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(format!("{name} must be > 0")));
            }
        }

        if self.marker.ttl > MAX_MARKER_TTL {
            return Err(ConfigError::InvalidValue(format!(
                "marker.ttl must be at most {}s",
                MAX_MARKER_TTL.as_secs()
            )));
        }

        if self.bridge.retry_delay >= self.marker.ttl {
            return Err(ConfigError::InvalidValue(
                "bridge.retry_delay must be shorter than marker.ttl".to_string(),
            ));
        }

        if self.step_up.max_write_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "step_up.max_write_attempts must be > 0".to_string(),
            ));
        }

        let url = url::Url::parse(&self.provider.base_url).map_err(|e| {
            ConfigError::InvalidValue(format!(
                "provider.base_url '{}' is not a valid URL: {e}",
                self.provider.base_url
            ))
        })?;
        match url.scheme() {
            "https" => {}
            "http" if self.provider.allow_http => {}
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "provider.base_url scheme '{other}' is not allowed. Use https, or set provider.allow_http"
                )));
            }
        }

        Ok(())
    }
}

pub mod loader {
    //! Loads [`AssuranceConfig`] from a TOML file and `STING__*` environment
    //! variables.

    use std::path::{Path, PathBuf};

    use config::{Config, Environment, File};

    use super::{AssuranceConfig, ConfigError};

    /// Default configuration file, looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "sting-auth.toml";

    /// Loads and validates the configuration.
    ///
    /// Sources, lowest priority first: built-in defaults, the TOML file at
    /// `path` (or [`DEFAULT_CONFIG_FILE`] if it exists), then environment
    /// variables such as `STING__MARKER__TTL=20s`.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load_config(path: Option<&Path>) -> Result<AssuranceConfig, ConfigError> {
        let mut builder = Config::builder();
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if file.exists() {
            builder = builder.add_source(File::from(file));
        } else if let Some(explicit) = path {
            return Err(ConfigError::Load(format!(
                "config file '{}' does not exist",
                explicit.display()
            )));
        }
        builder = builder.add_source(
            Environment::with_prefix("STING")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let merged: AssuranceConfig = builder
            .build()
            .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;

        merged.validate()?;
        tracing::debug!(
            marker_ttl = ?merged.marker.ttl,
            bridge_delay = ?merged.bridge.retry_delay,
            "Assurance configuration loaded"
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AssuranceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeouts.store, Duration::from_millis(50));
        assert_eq!(config.timeouts.provider, Duration::from_secs(5));
        assert_eq!(config.marker.ttl, Duration::from_secs(15));
    }

    #[test]
    fn test_marker_ttl_bounds() {
        let mut config = AssuranceConfig::default();
        config.marker.ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        config.marker.ttl = Duration::from_secs(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bridge_delay_must_fit_inside_marker_ttl() {
        let mut config = AssuranceConfig::default();
        config.bridge.retry_delay = config.marker.ttl;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry_delay"));
    }

    #[test]
    fn test_plain_http_requires_opt_in() {
        let mut config = AssuranceConfig::default();
        config.provider.base_url = "http://localhost:4433".to_string();
        assert!(config.validate().is_err());

        config.provider.allow_http = true;
        assert!(config.validate().is_ok());

        config.provider.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_humantime_deserialization() {
        let config: AssuranceConfig = serde_json::from_value(serde_json::json!({
            "session": { "lifetime": "8h" },
            "bridge": { "retry_delay": "200ms" }
        }))
        .unwrap();
        assert_eq!(config.session.lifetime, Duration::from_secs(8 * 3600));
        assert_eq!(config.bridge.retry_delay, Duration::from_millis(200));
        assert_eq!(config.bridge.retry_after, Duration::from_secs(1));
    }
}
