//! Runtime tunables for the command substrate
use crate::error::ConfigError;
use crate::mirror::MirrorMode;
use anyhow::Context;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

// keeps `now + span` far from chrono's range limits
const MAX_SPAN_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub idempotency_ttl_secs: u64,
    pub mirror: MirrorMode,
    pub lockout: LockoutConfig,
    pub rate_window: RateWindowConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockoutConfig {
    pub threshold: u32,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateWindowConfig {
    pub max_attempts: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idempotency_ttl_secs: 24 * 60 * 60,
            mirror: MirrorMode::Enabled,
            lockout: LockoutConfig::default(),
            rate_window: RateWindowConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            ttl_secs: 15 * 60,
        }
    }
}

impl Default for RateWindowConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window_secs: 60,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 30 * 24 * 60 * 60,
        }
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(ConfigError::from)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("failed to load {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idempotency_ttl_secs == 0 {
            return Err(ConfigError::Invalid("idempotency_ttl_secs must be positive".into()));
        }
        if self.lockout.threshold == 0 || self.lockout.ttl_secs == 0 {
            return Err(ConfigError::Invalid("lockout threshold and ttl must be positive".into()));
        }
        if self.rate_window.max_attempts == 0 || self.rate_window.window_secs == 0 {
            return Err(ConfigError::Invalid("rate window limits must be positive".into()));
        }
        if self.session.access_ttl_secs == 0 || self.session.refresh_ttl_secs == 0 {
            return Err(ConfigError::Invalid("session ttls must be positive".into()));
        }
        let longest = [
            self.idempotency_ttl_secs,
            self.lockout.ttl_secs,
            self.rate_window.window_secs,
            self.session.access_ttl_secs,
            self.session.refresh_ttl_secs,
        ];
        if longest.iter().any(|&secs| secs > MAX_SPAN_SECS) {
            return Err(ConfigError::Invalid("durations may not exceed 100 years".into()));
        }
        Ok(())
    }

    pub fn idempotency_ttl(&self) -> Duration {
        secs(self.idempotency_ttl_secs)
    }
}

impl LockoutConfig {
    pub fn ttl(&self) -> Duration {
        secs(self.ttl_secs)
    }
}

impl RateWindowConfig {
    pub fn window(&self) -> Duration {
        secs(self.window_secs)
    }
}

impl SessionConfig {
    pub fn access_ttl(&self) -> Duration {
        secs(self.access_ttl_secs)
    }
    pub fn refresh_ttl(&self) -> Duration {
        secs(self.refresh_ttl_secs)
    }
}

fn secs(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            mirror = "disabled"

            [lockout]
            threshold = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.mirror, MirrorMode::Disabled);
        assert_eq!(config.lockout.threshold, 3);
        assert_eq!(config.lockout.ttl_secs, 900);
        assert_eq!(config.rate_window, RateWindowConfig::default());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = Config::from_toml_str("[lockout]\nthreshold = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn absurd_ttl_is_rejected() {
        let err = Config::from_toml_str("idempotency_ttl_secs = 9223372036854775807\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
