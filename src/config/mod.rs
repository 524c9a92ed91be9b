//! Configuration management for cairn

pub mod schema;

pub use schema::Config;

use crate::error::{CairnError, CairnResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Project-local override file name
pub const LOCAL_CONFIG_NAME: &str = ".cairn.toml";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cairn")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cairn")
    }

    /// Get the default cache storage directory
    pub fn default_cache_dir() -> PathBuf {
        Self::state_dir().join("cache")
    }

    /// Cache storage directory for a loaded config
    pub fn cache_dir(config: &Config) -> PathBuf {
        config
            .cache
            .dir
            .clone()
            .unwrap_or_else(Self::default_cache_dir)
    }

    /// Get the audit log path
    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Walk up from `start` looking for a project-local config
    pub fn find_local_config(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(LOCAL_CONFIG_NAME))
            .find(|candidate| candidate.is_file())
    }

    /// Load configuration, creating default if not exists
    pub async fn load(&self) -> CairnResult<Config> {
        self.load_merged(None).await
    }

    /// Load the global config with an optional local override merged on
    /// top. Tables merge recursively; any other local value replaces the
    /// global one.
    pub async fn load_merged(&self, local: Option<&Path>) -> CairnResult<Config> {
        let mut merged = if self.config_path.exists() {
            read_table(&self.config_path).await?
        } else {
            debug!("Config file not found, using defaults");
            toml::Table::new()
        };

        if let Some(local) = local {
            let overrides = read_table(local).await?;
            merge_tables(&mut merged, overrides);
            debug!("Merged local config {}", local.display());
        }

        let origin = local.unwrap_or(&self.config_path);
        let config = toml::Value::Table(merged)
            .try_into::<Config>()
            .map_err(|e| CairnError::ConfigInvalid {
                path: origin.to_path_buf(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Ensure the state and cache directories exist
    pub async fn ensure_state_dirs(config: &Config) -> CairnResult<()> {
        let dirs = [Self::state_dir(), Self::cache_dir(config)];

        for dir in &dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                CairnError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_table(path: &Path) -> CairnResult<toml::Table> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| CairnError::io(format!("reading config from {}", path.display()), e))?;

    content
        .parse::<toml::Table>()
        .map_err(|e| CairnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeepBytes;
    use crate::lockfile::ConflictPolicy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.lockfile.name, "cairn.lock");
    }

    #[tokio::test]
    async fn written_config_loads_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.lockfile.name = "deps.lock".to_string();
        config.gc.keep_bytes = KeepBytes::Absolute(4096);

        std::fs::write(manager.path(), toml::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn local_overrides_merge_key_by_key() {
        let temp = TempDir::new().unwrap();
        let global = temp.path().join("config.toml");
        std::fs::write(
            &global,
            "[gc]\nkeep_bytes = \"20GB\"\ninterval_secs = 120\n[general]\naudit_log = false\n",
        )
        .unwrap();

        let project = temp.path().join("project");
        std::fs::create_dir_all(project.join("nested/deeper")).unwrap();
        std::fs::write(
            project.join(LOCAL_CONFIG_NAME),
            "[gc]\nkeep_bytes = \"5%\"\n[lockfile]\nconflict = \"reject\"\n",
        )
        .unwrap();

        let local = ConfigManager::find_local_config(&project.join("nested/deeper")).unwrap();
        assert_eq!(local, project.join(LOCAL_CONFIG_NAME));

        let config = ConfigManager::with_path(global)
            .load_merged(Some(&local))
            .await
            .unwrap();
        assert_eq!(config.gc.keep_bytes, KeepBytes::Percent(5.0));
        assert_eq!(config.gc.interval_secs, 120);
        assert!(!config.general.audit_log);
        assert_eq!(config.lockfile.conflict, ConflictPolicy::Reject);
    }

    #[tokio::test]
    async fn invalid_config_names_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[gc]\nkeep_bytes = \"plenty\"\n").unwrap();

        let err = ConfigManager::with_path(path.clone())
            .load()
            .await
            .unwrap_err();
        match err {
            CairnError::ConfigInvalid { path: p, reason } => {
                assert_eq!(p, path);
                assert!(reason.contains("keep_bytes"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cache_dir_prefers_configured() {
        let mut config = Config::default();
        assert_eq!(
            ConfigManager::cache_dir(&config),
            ConfigManager::default_cache_dir()
        );
        config.cache.dir = Some(PathBuf::from("/tmp/cairn-cache"));
        assert_eq!(
            ConfigManager::cache_dir(&config),
            PathBuf::from("/tmp/cairn-cache")
        );
    }

    #[test]
    fn merge_replaces_scalars_and_recurses() {
        let mut base: toml::Table = "a = 1\n[t]\nx = 1\ny = 2\n".parse().unwrap();
        let over: toml::Table = "a = 2\n[t]\ny = 3\n".parse().unwrap();
        merge_tables(&mut base, over);
        assert_eq!(base["a"].as_integer(), Some(2));
        assert_eq!(base["t"]["x"].as_integer(), Some(1));
        assert_eq!(base["t"]["y"].as_integer(), Some(3));
    }
}
