use std::env;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};

pub const LOCK_TIMEOUT_ENV: &str = "HIERARCHY_LOCK_TIMEOUT_MS";
pub const MAX_ATTEMPTS_ENV: &str = "HIERARCHY_MAX_ATTEMPTS";

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Tuning for the mutation coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    /// How long a mutation may wait for any single lock before failing with a timeout.
    pub lock_timeout_ms: u64,
    /// Attempts per mutation when the store reports a transient conflict.
    pub max_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl CoordinatorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from a key lookup, falling back to defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(LOCK_TIMEOUT_ENV) {
            config.lock_timeout_ms = parse_setting(LOCK_TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(MAX_ATTEMPTS_ENV) {
            config.max_attempts = parse_setting(MAX_ATTEMPTS_ENV, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(LibError::invalid(
                "Lock timeout must be positive",
                anyhow!("lock_timeout_ms was 0"),
            ));
        }
        if self.max_attempts == 0 {
            return Err(LibError::invalid(
                "At least one attempt is required",
                anyhow!("max_attempts was 0"),
            ));
        }
        Ok(())
    }
}

fn parse_setting<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid {} '{}'", key, raw))
        .map_err(|err| LibError::invalid("Invalid hierarchy configuration", err))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn missing_keys_use_defaults() {
        let config = CoordinatorConfig::from_lookup(lookup(&[])).expect("defaults");
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn keys_override_defaults() {
        let config = CoordinatorConfig::from_lookup(lookup(&[
            (LOCK_TIMEOUT_ENV, " 250 "),
            (MAX_ATTEMPTS_ENV, "7"),
        ]))
        .expect("parsed");
        assert_eq!(config.lock_timeout_ms, 250);
        assert_eq!(config.max_attempts, 7);
    }

    #[test]
    fn garbage_and_zero_values_are_rejected() {
        let err = CoordinatorConfig::from_lookup(lookup(&[(LOCK_TIMEOUT_ENV, "soon")]))
            .expect_err("not a number");
        assert_eq!(err.public, "Invalid hierarchy configuration");

        let err = CoordinatorConfig::from_lookup(lookup(&[(MAX_ATTEMPTS_ENV, "0")]))
            .expect_err("zero attempts");
        assert_eq!(err.public, "At least one attempt is required");
    }

    #[test]
    fn deserializes_partial_camel_case() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"lockTimeoutMs": 100}"#).expect("valid json");
        assert_eq!(config.lock_timeout_ms, 100);
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }
}
