use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::http::HttpOptions;
use crate::limiter::LimiterSettings;

/// Main configuration structure
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CrawlerConfig {
    pub engine: EngineSettings,
    pub http: HttpSettings,
    pub limiter: LimiterSettings,
    /// Shared queue for distributed crawls
    pub redis: Option<QueueSettings>,
}

/// Run loop settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub auto_stop: bool,
    pub idle_timeout_ms: u64,
    pub depth_first: bool,
    /// Defaults to twice the number of cores
    pub task_pool_size: Option<usize>,
    /// Defaults to the number of cores
    pub item_pool_size: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            auto_stop: true,
            idle_timeout_ms: 5000,
            depth_first: false,
            task_pool_size: None,
            item_pool_size: None,
        }
    }
}

/// Settings of the default HTTP downloader
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_ms: u64,
    pub user_agent: Option<String>,
    pub max_redirects: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        let options = HttpOptions::default();
        Self {
            timeout_ms: options.timeout.as_millis() as u64,
            user_agent: options.user_agent,
            max_redirects: options.max_redirects,
        }
    }
}

impl HttpSettings {
    pub fn options(&self) -> HttpOptions {
        HttpOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            user_agent: self.user_agent.clone(),
            max_redirects: self.max_redirects,
        }
    }
}

/// Queue settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub redis_url: String,
    /// Prefix of the `<name>_tasks`, `<name>_items` and `<name>_deduplicate` keys
    pub name: String,
    /// Requests pulled per round trip when the local buffer is empty
    pub batch_size: usize,
    pub deduplicate: bool,
    /// Time to live for the task list in seconds
    pub task_ttl: Option<u64>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            name: "crawlhook".to_string(),
            batch_size: 10,
            deduplicate: true,
            task_ttl: None,
        }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    pub fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "crawlhook", "crawlhook") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration, writing it out on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        self.save_to_file(&Self::default_path())
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{LimitRule, Policy};

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
engine:
  depth_first: true
  task_pool_size: 4
http:
  timeout_ms: 1500
limiter:
  whitelist: true
  rules:
    - glob: "*.example.com"
      delay_ms: 250
    - regex: "^ads\\."
      policy: deny
"#;
        let config: CrawlerConfig = serde_yaml::from_str(yaml).unwrap();

        assert!(config.engine.depth_first);
        assert!(config.engine.auto_stop);
        assert_eq!(config.engine.task_pool_size, Some(4));
        assert_eq!(config.engine.item_pool_size, None);
        assert_eq!(config.http.options().timeout, Duration::from_millis(1500));
        assert_eq!(config.http.max_redirects, 10);
        assert!(config.redis.is_none());

        assert!(config.limiter.whitelist);
        assert_eq!(
            config.limiter.rules[0],
            LimitRule::glob("*.example.com").delay(Duration::from_millis(250))
        );
        assert_eq!(config.limiter.rules[1].policy, Policy::Deny);
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir()
            .join(format!("crawlhook-{}", uuid::Uuid::new_v4()))
            .join("config.yaml");

        let mut config = CrawlerConfig::default();
        config.redis = Some(QueueSettings {
            name: "books".to_string(),
            ..QueueSettings::default()
        });
        config.save_to_file(&path).unwrap();

        let loaded = CrawlerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);

        fs::remove_dir_all(path.parent().unwrap()).ok();
        assert!(CrawlerConfig::load_from_file(&path).is_err());
    }
}
