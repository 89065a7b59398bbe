//! Application configuration: a TOML file plus environment overrides.
//!
//! ```toml
//! [master]
//! name = "master"
//! connection = { kind = "http", base_url = "http://127.0.0.1:8080" }
//!
//! [[slaves]]
//! name = "slave-1"
//! lot_mode = "multiplier"
//! lot_value = 0.5
//! connection = { kind = "paper", balance = 5000 }
//!
//! [settings]
//! poll_interval_ms = 500
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{MasterConfig, SlaveConfig};
use crate::trading::EngineSettings;

pub const ENV_DATABASE_URL: &str = "COPIER_DATABASE_URL";
pub const ENV_LOG_LEVEL: &str = "COPIER_LOG_LEVEL";
pub const ENV_POLL_INTERVAL_MS: &str = "COPIER_POLL_INTERVAL_MS";

/// Where state is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx SQLite URL
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:./copytrader.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level or `EnvFilter` directive
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Everything the binary needs to start an engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub master: MasterConfig,
    pub slaves: Vec<SlaveConfig>,
    pub settings: EngineSettings,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load `path`, falling back to defaults when it does not exist, then
    /// apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_toml(&raw)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse TOML")
    }

    /// Override fields from the environment, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database.url = url;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Some(poll) = lookup(ENV_POLL_INTERVAL_MS) {
            self.settings.poll_interval_ms = poll
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of milliseconds", ENV_POLL_INTERVAL_MS))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.settings.validate() {
            bail!("settings: {}", e);
        }

        let mut names = HashSet::new();
        names.insert(self.master.name.as_str());
        for slave in &self.slaves {
            if let Err(e) = slave.validate() {
                bail!("slave: {}", e);
            }
            if !names.insert(slave.name.as_str()) {
                bail!("duplicate account name {}", slave.name);
            }
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionDescriptor, LotMode};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[master]
name = "main"
connection = { kind = "http", base_url = "http://127.0.0.1:8080", login = 5001 }

[[slaves]]
name = "small"
lot_mode = "proportional"
connection = { kind = "paper", balance = 2000 }

[[slaves]]
name = "hedge"
lot_mode = "multiplier"
lot_value = 0.5
invert_trades = true
symbols_filter = ["EURUSD", "XAUUSD"]

[settings]
poll_interval_ms = 250
max_attempts = 5

[logging]
format = "json"
"#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.master.name, "main");
        assert!(matches!(
            config.master.connection,
            ConnectionDescriptor::Http { login: Some(5001), .. }
        ));
        assert_eq!(config.slaves.len(), 2);
        assert_eq!(config.slaves[0].lot_mode, LotMode::Proportional);
        assert_eq!(
            config.slaves[0].connection,
            ConnectionDescriptor::Paper {
                balance: dec!(2000),
                equity: None
            }
        );
        assert_eq!(config.slaves[1].lot_value, dec!(0.5));
        assert!(config.slaves[1].symbols_filter.admits("XAUUSD"));
        assert!(!config.slaves[1].symbols_filter.admits("GBPUSD"));
        assert_eq!(config.settings.poll_interval_ms, 250);
        assert_eq!(config.settings.max_attempts, 5);
        assert_eq!(config.settings.drain_interval_ms, 100);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        let env: HashMap<&str, &str> = [
            (ENV_DATABASE_URL, "sqlite::memory:"),
            (ENV_POLL_INTERVAL_MS, "1000"),
        ]
        .into_iter()
        .collect();

        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.settings.poll_interval_ms, 1000);
        assert_eq!(config.logging.level, "info");

        let result = config.apply_env(|key| (key == ENV_POLL_INTERVAL_MS).then(|| "soon".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_duplicates_and_bad_bounds() {
        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.slaves[1].name = "small".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.slaves[0].name = "main".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.slaves[0].min_lot = dec!(20);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/copier.toml")).unwrap();
        assert!(config.slaves.is_empty());
        assert_eq!(config.master.name, "master");
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let rendered = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.slaves.len(), 2);
        assert_eq!(parsed.slaves[1].lot_value, dec!(0.5));
    }
}
