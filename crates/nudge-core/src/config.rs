//! Nudge configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NudgeError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

fn default_database_path() -> String { "~/.nudge/nudge.db".into() }

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            telegram: None,
            webhook: WebhookConfig::default(),
        }
    }
}

impl NudgeConfig {
    /// Load config from the default path (~/.nudge/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NudgeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| NudgeError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NudgeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nudge home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudge")
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// Telegram bot token, if the channel is enabled.
    pub fn telegram_token(&self) -> Option<&str> {
        self.telegram
            .as_ref()
            .filter(|tg| tg.enabled && !tg.bot_token.is_empty())
            .map(|tg| tg.bot_token.as_str())
    }
}

/// Engine timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Fallback wake cadence when nothing is due sooner.
    #[serde(default = "default_check_period")]
    pub check_period_secs: u64,
    /// How long an undelivered item is held back before it is tried again.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_check_period() -> u64 { 300 }
fn default_retry_delay() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_period_secs: default_check_period(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl SchedulerConfig {
    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_secs.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub bot_token: String,
}

fn bool_true() -> bool { true }

/// Extra headers sent with every webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NudgeConfig::default();
        assert_eq!(config.scheduler.check_period(), Duration::from_secs(300));
        assert_eq!(config.scheduler.retry_delay(), Duration::from_secs(30));
        assert!(config.telegram_token().is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            database_path = "/var/lib/nudge/nudge.db"

            [scheduler]
            check_period_secs = 60

            [telegram]
            bot_token = "123:abc"
        "#;

        let config: NudgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/nudge/nudge.db"));
        assert_eq!(config.scheduler.check_period_secs, 60);
        assert_eq!(config.scheduler.retry_delay_secs, 30);
        assert_eq!(config.telegram_token(), Some("123:abc"));
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: NudgeConfig = toml::from_str("").unwrap();
        assert_eq!(config.database_path, "~/.nudge/nudge.db");
        assert!(!config.database_path().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_disabled_telegram_has_no_token() {
        let toml_str = r#"
            [telegram]
            enabled = false
            bot_token = "123:abc"
        "#;
        let config: NudgeConfig = toml::from_str(toml_str).unwrap();
        assert!(config.telegram_token().is_none());
    }

    #[test]
    fn test_zero_periods_are_clamped() {
        let config = SchedulerConfig {
            check_period_secs: 0,
            retry_delay_secs: 0,
        };
        assert_eq!(config.check_period(), Duration::from_secs(1));
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("nudge-test-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = NudgeConfig::default();
        config.scheduler.check_period_secs = 42;
        config.save_to(&path).unwrap();

        let loaded = NudgeConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.check_period_secs, 42);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_home_dir() {
        let home = NudgeConfig::home_dir();
        assert!(home.to_string_lossy().contains("nudge"));
    }
}
