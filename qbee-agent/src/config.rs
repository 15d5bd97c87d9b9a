use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_base_url() -> String {
    "https://device.app.qbee.io".to_string()
}

fn default_app_dir() -> PathBuf {
    PathBuf::from("/var/lib/qbee")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/qbee/cache")
}

/// Local agent configuration, persisted as JSON by the embedding daemon.
/// Device credentials (mTLS identity) are managed outside the engine; the
/// pre-configured HTTP client carries them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Mirror every report to stdout, for attended runs.
    #[serde(default)]
    pub console_reporting: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            app_dir: default_app_dir(),
            cache_dir: default_cache_dir(),
            console_reporting: false,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AgentConfig = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let contents = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.base_url, "https://device.app.qbee.io");
        assert_eq!(config.app_dir, PathBuf::from("/var/lib/qbee"));
        assert!(!config.console_reporting);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");

        let mut config = AgentConfig::default();
        config.base_url = "https://device.example.com".to_string();
        config.console_reporting = true;
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.base_url, "https://device.example.com");
        assert!(loaded.console_reporting);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"base_url": "https://x.example.com"}"#).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.base_url, "https://x.example.com");
        assert_eq!(loaded.cache_dir, PathBuf::from("/var/lib/qbee/cache"));
    }
}
