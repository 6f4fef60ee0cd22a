//! Configuration management with YAML support

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

/// Database file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_history_path")]
    pub history_path: String,

    #[serde(default = "default_favicons_path")]
    pub favicons_path: String,
}

/// Engine tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// How long writes are batched before the long-running transaction is
    /// committed and reopened.
    #[serde(default = "default_commit_interval_secs")]
    pub commit_interval_secs: u64,

    /// Capacity of the recent-redirects LRU cache.
    #[serde(default = "default_redirect_cache_capacity")]
    pub redirect_cache_capacity: usize,

    /// Visits older than this are expired by the background sweep.
    #[serde(default = "default_expire_days_threshold")]
    pub expire_days_threshold: i64,

    /// Disables the old-history expiration sweep entirely.
    #[serde(default)]
    pub keep_all_history: bool,

    /// How many days back get_domain_diversity will compute metrics for.
    #[serde(default = "default_domain_diversity_max_days")]
    pub domain_diversity_max_backtracked_days: i64,
}

/// Foreign-visit (synced history) handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether foreign visits may contribute to most-visited segments. The
    /// exact eligibility predicate is injected on the engine; this is the
    /// master switch.
    #[serde(default)]
    pub foreign_visits_in_segments: bool,

    /// Batch size for the incremental foreign-visit deletion sweep.
    #[serde(default = "default_foreign_visits_per_batch")]
    pub foreign_visits_to_delete_per_batch: usize,
}

// Default value functions
fn default_history_path() -> String {
    "~/.local/share/hindsight/history.db".to_string()
}

fn default_favicons_path() -> String {
    "~/.local/share/hindsight/favicons.db".to_string()
}

fn default_commit_interval_secs() -> u64 {
    10
}

fn default_redirect_cache_capacity() -> usize {
    32
}

fn default_expire_days_threshold() -> i64 {
    120
}

fn default_domain_diversity_max_days() -> i64 {
    7
}

fn default_foreign_visits_per_batch() -> usize {
    100
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            history_path: default_history_path(),
            favicons_path: default_favicons_path(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            commit_interval_secs: default_commit_interval_secs(),
            redirect_cache_capacity: default_redirect_cache_capacity(),
            expire_days_threshold: default_expire_days_threshold(),
            keep_all_history: false,
            domain_diversity_max_backtracked_days: default_domain_diversity_max_days(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            foreign_visits_in_segments: false,
            foreign_visits_to_delete_per_batch: default_foreign_visits_per_batch(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig::default(),
            backend: BackendConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./hindsight.yaml (current directory)
    /// 3. ~/.config/hindsight/hindsight.yaml
    pub fn load(path: &str) -> Result<Self> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "hindsight.yaml".to_string(),
            shellexpand::tilde("~/.config/hindsight/hindsight.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)?;
                let config: Config = serde_yaml::from_str(&content)?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Get the history database path, expanding ~ to home directory
    pub fn history_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.history_path).to_string())
    }

    /// Get the favicon database path, expanding ~ to home directory
    pub fn favicons_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.favicons_path).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend.commit_interval_secs, 10);
        assert_eq!(config.backend.redirect_cache_capacity, 32);
        assert_eq!(config.sync.foreign_visits_to_delete_per_batch, 100);
        assert!(!config.sync.foreign_visits_in_segments);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
database:
  history_path: ~/.local/share/hindsight/test.db

backend:
  commit_interval_secs: 3
  keep_all_history: true

sync:
  foreign_visits_in_segments: true
  foreign_visits_to_delete_per_batch: 25
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.database.history_path, "~/.local/share/hindsight/test.db");
        assert_eq!(config.backend.commit_interval_secs, 3);
        assert!(config.backend.keep_all_history);
        assert!(config.sync.foreign_visits_in_segments);
        assert_eq!(config.sync.foreign_visits_to_delete_per_batch, 25);
        // Unspecified fields keep their defaults.
        assert_eq!(config.backend.expire_days_threshold, 120);
    }
}
