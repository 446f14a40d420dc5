//! Runtime configuration
//!
//! Read from `remotelab.toml` (every key optional), then overridden by
//! environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `SQLITE_DB_PATH` | `database.path` |
//! | `PORT` | `server.port` |
//! | `AI_KEY_SECRET`, then `FLASK_SECRET_KEY` | `secrets.ai_key_secret` |
//! | `OPENAI_API_KEY` | `secrets.openai_api_key` |

use crate::correction::{CorrectionOptions, DEFAULT_REQUIRED_OCCURRENCES, DEFAULT_TOLERANCE};
use crate::db::DEFAULT_DB_PATH;
use crate::recorder::DEFAULT_IDLE_TIMEOUT;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "remotelab.toml";
pub const DEFAULT_SECRET: &str = "remote-lab-dev";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} is not a valid port: `{value}`")]
    InvalidPort { var: &'static str, value: String },
    #[error("correction.tolerance must be a non-negative number, got {0}")]
    InvalidTolerance(f64),
    #[error("correction.required_occurrences must be at least 1")]
    NoOccurrencesRequired,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    database: DatabaseConfig,
    server: ServerConfig,
    correction: CorrectionConfig,
    recorder: RecorderConfig,
    secrets: SecretsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DatabaseConfig {
    path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: DEFAULT_DB_PATH.to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 5000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct CorrectionConfig {
    tolerance: f64,
    required_occurrences: usize,
    drop_last: bool,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            required_occurrences: DEFAULT_REQUIRED_OCCURRENCES,
            drop_last: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RecorderConfig {
    idle_timeout: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { idle_timeout: DEFAULT_IDLE_TIMEOUT }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SecretsConfig {
    ai_key_secret: Option<String>,
    openai_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub correction: CorrectionOptions,
    pub idle_timeout: f64,
    pub ai_key_secret: String,
    pub openai_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_file_contents(ConfigFile::default())
    }
}

impl Config {
    fn from_file_contents(file: ConfigFile) -> Self {
        Self {
            db_path: file.database.path.into(),
            host: file.server.host,
            port: file.server.port,
            correction: CorrectionOptions {
                tolerance: file.correction.tolerance,
                required_occurrences: file.correction.required_occurrences,
                drop_last: file.correction.drop_last,
            },
            idle_timeout: file.recorder.idle_timeout,
            ai_key_secret: file
                .secrets
                .ai_key_secret
                .unwrap_or_else(|| DEFAULT_SECRET.to_string()),
            openai_api_key: file.secrets.openai_api_key,
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).context("Failed to parse config file")?;
        Ok(Self::from_file_contents(file))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load from `path`, or from `remotelab.toml` when present, then apply
    /// the environment. An explicit path that cannot be read is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, get: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| get(var).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("SQLITE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(port) = get("PORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort { var: "PORT", value: port.clone() })?;
        }
        if let Some(secret) = get("AI_KEY_SECRET").or_else(|| get("FLASK_SECRET_KEY")) {
            self.ai_key_secret = secret;
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let tolerance = self.correction.tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(ConfigError::InvalidTolerance(tolerance));
        }
        if self.correction.required_occurrences == 0 {
            return Err(ConfigError::NoOccurrencesRequired);
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.port, 5000);
        assert_eq!(config.correction, CorrectionOptions::default());
        assert_eq!(config.ai_key_secret, DEFAULT_SECRET);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 8080

            [correction]
            tolerance = 0.2
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.correction.tolerance, 0.2);
        assert_eq!(config.correction.required_occurrences, 2);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(Config::from_toml("[server]\nport = \"many\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("SQLITE_DB_PATH", "/tmp/lab.db"),
                ("PORT", "9000"),
                ("FLASK_SECRET_KEY", "flask"),
                ("OPENAI_API_KEY", "sk-env"),
            ]))
            .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/lab.db"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.ai_key_secret, "flask");
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-env"));
    }

    #[test]
    fn test_ai_key_secret_wins_over_flask_secret() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("AI_KEY_SECRET", "dedicated"), ("FLASK_SECRET_KEY", "flask")]))
            .unwrap();
        assert_eq!(config.ai_key_secret, "dedicated");
    }

    #[test]
    fn test_bad_port_env() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("PORT", "http")])).unwrap_err();
        assert_eq!(err, ConfigError::InvalidPort { var: "PORT", value: "http".into() });
    }

    #[test]
    fn test_validate_rejects_zero_occurrences() {
        let mut config = Config::default();
        config.correction.required_occurrences = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoOccurrencesRequired));
    }
}
