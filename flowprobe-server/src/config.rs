//! Server configuration file handling

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration (JSON)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Database location
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Logging setup
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// console | json
    pub encoding: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            encoding: "console".into(),
        }
    }
}

/// HTTP API listener
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8145,
        }
    }
}

/// Load and validate a configuration file
pub fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    if config.db.path.as_os_str().is_empty() {
        anyhow::bail!("db.path must not be empty");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            br#"{
                "db": { "path": "/var/lib/flowprobe/db" },
                "logging": { "level": "debug", "encoding": "json" },
                "api": { "host": "0.0.0.0", "port": 9000 }
            }"#,
        )
        .unwrap();

        let config = parse_file(&path).unwrap();
        assert_eq!(config.db.path, PathBuf::from("/var/lib/flowprobe/db"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.api.port, 9000);
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, br#"{ "db": { "path": "db" } }"#).unwrap();

        let config = parse_file(&path).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.api.host, "127.0.0.1");
    }
}
