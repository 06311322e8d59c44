//! Host configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! `CELLRUN_*` environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the cancellation coordinator signals an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    /// Use shared memory when the unit supports it, messages otherwise.
    #[default]
    Auto,
    /// Require shared memory; falls back to messages when unavailable.
    SharedMemory,
    /// Always use the message-based fallback.
    Message,
}

impl std::str::FromStr for InterruptMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "shared_memory" | "shared-memory" => Ok(Self::SharedMemory),
            "message" => Ok(Self::Message),
            other => Err(Error::Config(format!("unknown interrupt mode '{}'", other))),
        }
    }
}

/// Timing and strategy settings for an `ExecutionHost`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Budget for the unit's init handshake.
    pub init_timeout_ms: u64,
    /// Hard budget for a single execution.
    pub execution_timeout_ms: u64,
    /// Window after an interrupt request before the unit is forcibly recreated.
    pub watchdog_ms: u64,
    /// Delay after a fallback interrupt before the execution is assumed cancelled.
    pub fallback_grace_ms: u64,
    /// Interrupt signalling strategy.
    pub interrupt_mode: InterruptMode,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: 120_000,
            execution_timeout_ms: 30_000,
            watchdog_ms: 1_000,
            fallback_grace_ms: 250,
            interrupt_mode: InterruptMode::Auto,
        }
    }
}

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "CELLRUN_";

impl HostConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn fallback_grace(&self) -> Duration {
        Duration::from_millis(self.fallback_grace_ms)
    }

    /// Default location of the config file (`<config dir>/cellrun/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cellrun").join("config.json"))
    }

    /// Load configuration.
    ///
    /// Reads `path` if given (it must exist), otherwise the default location if a
    /// file is present there, then applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Apply `CELLRUN_*` overrides from an iterator of environment pairs.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "INIT_TIMEOUT_MS" => self.init_timeout_ms = parse_millis(&key, &value)?,
                "EXECUTION_TIMEOUT_MS" => self.execution_timeout_ms = parse_millis(&key, &value)?,
                "WATCHDOG_MS" => self.watchdog_ms = parse_millis(&key, &value)?,
                "FALLBACK_GRACE_MS" => self.fallback_grace_ms = parse_millis(&key, &value)?,
                "INTERRUPT_MODE" => self.interrupt_mode = value.parse()?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Check that the timers are usable together.
    pub fn validate(&self) -> Result<()> {
        let timers = [
            ("init_timeout_ms", self.init_timeout_ms),
            ("execution_timeout_ms", self.execution_timeout_ms),
            ("watchdog_ms", self.watchdog_ms),
            ("fallback_grace_ms", self.fallback_grace_ms),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }
        if self.fallback_grace_ms >= self.watchdog_ms {
            return Err(Error::Config(format!(
                "fallback_grace_ms ({}) must be shorter than watchdog_ms ({})",
                self.fallback_grace_ms, self.watchdog_ms
            )));
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number of milliseconds, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.init_timeout(), Duration::from_secs(120));
        assert_eq!(config.execution_timeout(), Duration::from_secs(30));
        assert_eq!(config.watchdog(), Duration::from_secs(1));
        assert_eq!(config.interrupt_mode, InterruptMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{"watchdog_ms": 2000, "interrupt_mode": "message"}"#).unwrap();

        let config = HostConfig::from_file(&path).unwrap();
        assert_eq!(config.watchdog_ms, 2000);
        assert_eq!(config.interrupt_mode, InterruptMode::Message);
        assert_eq!(config.execution_timeout_ms, 30_000);
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = HostConfig::load(Some(&temp.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HostConfig::default();
        config
            .apply_env(env(&[
                ("CELLRUN_EXECUTION_TIMEOUT_MS", "5000"),
                ("CELLRUN_INTERRUPT_MODE", "shared-memory"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();
        assert_eq!(config.execution_timeout_ms, 5000);
        assert_eq!(config.interrupt_mode, InterruptMode::SharedMemory);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = HostConfig::default();
        let err = config
            .apply_env(env(&[("CELLRUN_WATCHDOG_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("CELLRUN_WATCHDOG_MS"));
    }

    #[test]
    fn test_validate() {
        let config = HostConfig {
            watchdog_ms: 0,
            ..HostConfig::default()
        };
        assert!(config.validate().is_err());

        let config = HostConfig {
            fallback_grace_ms: 1_000,
            watchdog_ms: 1_000,
            ..HostConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
