//! Configuration schema for cairn
//!
//! Configuration is stored at `~/.config/cairn/config.toml`. A project may
//! add a `.cairn.toml` that overrides it key by key.

use crate::cache::{GcPolicy, KeepBytes};
use crate::error::{CairnError, CairnResult};
use crate::lockfile::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Resolver lockfile settings
    pub lockfile: LockfileConfig,

    /// Cache storage settings
    pub cache: CacheConfig,

    /// Garbage collection settings
    pub gc: GcConfig,

    /// Session liveness settings
    pub session: SessionConfig,
}

impl Config {
    /// Check values serde cannot check on its own
    pub fn validate(&self) -> CairnResult<()> {
        if self.gc.interval_secs == 0 {
            return Err(CairnError::InvalidGcConfig(
                "gc.interval_secs must be greater than zero".to_string(),
            ));
        }
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(CairnError::User(format!(
                "general.log_format must be \"text\" or \"json\", got \"{}\"",
                self.general.log_format
            )));
        }
        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Resolver lockfile settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockfileConfig {
    /// File name, resolved against the workspace directory
    pub name: String,

    /// What to do when a locked key resolves to a new output
    pub conflict: ConflictPolicy,
}

impl Default for LockfileConfig {
    fn default() -> Self {
        Self {
            name: "cairn.lock".to_string(),
            conflict: ConflictPolicy::default(),
        }
    }
}

/// Cache storage settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Storage directory; defaults to `<state dir>/cache`
    pub dir: Option<PathBuf>,
}

/// Garbage collection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Run the background collector
    pub enabled: bool,

    /// Byte count, size ("10GB"), or percentage of the cache filesystem ("5%")
    pub keep_bytes: KeepBytes,

    /// Minimum seconds between automatic passes
    pub interval_secs: u64,

    /// Milliseconds a released entry is protected from collection
    pub settle_delay_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_bytes: KeepBytes::default(),
            interval_secs: 60,
            settle_delay_ms: 500,
        }
    }
}

impl GcConfig {
    pub fn policy(&self) -> GcPolicy {
        GcPolicy {
            keep_bytes: self.keep_bytes,
            interval: Duration::from_secs(self.interval_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }
}

/// Session liveness settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds without a heartbeat before a session is reaped
    pub timeout_secs: u64,

    /// Seconds between reaper sweeps
    pub reap_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            reap_interval_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[gc]"));
        assert!(toml.contains("keep_bytes = \"10%\""));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let toml = r#"
            [lockfile]
            conflict = "reject"

            [gc]
            keep_bytes = "512MB"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.lockfile.conflict, ConflictPolicy::Reject);
        assert_eq!(config.lockfile.name, "cairn.lock");
        assert_eq!(config.gc.keep_bytes, KeepBytes::Absolute(512 * 1024 * 1024));
        assert_eq!(config.gc.interval_secs, 60);
        assert!(config.general.audit_log);
        config.validate().unwrap();
    }

    #[test]
    fn malformed_keep_bytes_rejected() {
        let err = toml::from_str::<Config>("[gc]\nkeep_bytes = \"half\"").unwrap_err();
        assert!(err.to_string().contains("keep_bytes"));
    }

    #[test]
    fn validate_catches_bad_values() {
        let mut config = Config::default();
        config.gc.interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(CairnError::InvalidGcConfig(_))
        ));

        let mut config = Config::default();
        config.general.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn gc_policy_conversion() {
        let gc = GcConfig {
            settle_delay_ms: 250,
            ..GcConfig::default()
        };
        let policy = gc.policy();
        assert_eq!(policy.interval, Duration::from_secs(60));
        assert_eq!(policy.settle_delay, Duration::from_millis(250));
    }
}
