/// Application configuration management
/// Stores user defaults in ~/.config/cnvrgctl/config.toml (or .yaml)

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::workflows::{EngineSettings, PostgresSettings};
use crate::utils::constants::*;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSection {
    pub user: Option<String>,
    pub database: Option<String>,
    pub admin_database: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub namespace: Option<String>,
    pub workloads: Option<Vec<String>>,
    /// humantime strings, e.g. "120s" or "2m"
    pub scale_timeout: Option<String>,
    pub poll_interval: Option<String>,
    pub tunnel_ready_timeout: Option<String>,
    pub postgres: PostgresSection,
    pub redis: RedisSection,
}

fn parse_duration(field: &str, value: &Option<String>, default: Duration) -> Result<Duration> {
    match value {
        Some(raw) => humantime::parse_duration(raw)
            .with_context(|| format!("Invalid duration for {}: '{}'", field, raw)),
        None => Ok(default),
    }
}

impl AppConfig {
    /// Get default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine the user config directory"))?
            .join("cnvrgctl");
        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from `path`, or the default location
    ///
    /// A missing default file yields the built-in defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::config_path()?, false),
        };

        if !path.exists() {
            if explicit {
                return Err(anyhow!("Config file not found: {}", path.display()));
            }
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::parse(&path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            serde_yaml::from_str(contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            toml::from_str(contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        }
    }

    /// Save configuration to `path`, or the default location
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, contents).context("Failed to write config file")?;

        Ok(path)
    }

    /// Config populated with every built-in default, for `config init`
    pub fn with_defaults() -> Self {
        Self {
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            workloads: Some(default_workloads()),
            scale_timeout: Some(humantime::format_duration(DEFAULT_SCALE_TIMEOUT).to_string()),
            poll_interval: Some(humantime::format_duration(DEFAULT_POLL_INTERVAL).to_string()),
            tunnel_ready_timeout: Some(humantime::format_duration(DEFAULT_TUNNEL_READY_TIMEOUT).to_string()),
            postgres: PostgresSection {
                user: Some(POSTGRES_USER.to_string()),
                database: Some(POSTGRES_DATABASE.to_string()),
                admin_database: Some(POSTGRES_ADMIN_DATABASE.to_string()),
                port: Some(POSTGRES_PORT),
            },
            redis: RedisSection { port: Some(REDIS_PORT) },
        }
    }

    /// Flag value if given, then the config file, then the default namespace
    pub fn namespace(&self, flag: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| self.namespace.clone())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
    }

    /// Resolve engine settings; `pg_password` normally comes from PGPASSWORD
    pub fn settings(&self, pg_password: Option<String>) -> Result<EngineSettings> {
        let workloads = match &self.workloads {
            Some(list) if list.is_empty() => return Err(anyhow!("Config 'workloads' must not be empty")),
            Some(list) => list.clone(),
            None => default_workloads(),
        };

        Ok(EngineSettings {
            workloads,
            scale_timeout: parse_duration("scale_timeout", &self.scale_timeout, DEFAULT_SCALE_TIMEOUT)?,
            poll_interval: parse_duration("poll_interval", &self.poll_interval, DEFAULT_POLL_INTERVAL)?,
            tunnel_ready_timeout: parse_duration(
                "tunnel_ready_timeout",
                &self.tunnel_ready_timeout,
                DEFAULT_TUNNEL_READY_TIMEOUT,
            )?,
            postgres: PostgresSettings {
                user: self.postgres.user.clone().unwrap_or_else(|| POSTGRES_USER.to_string()),
                database: self
                    .postgres
                    .database
                    .clone()
                    .unwrap_or_else(|| POSTGRES_DATABASE.to_string()),
                admin_database: self
                    .postgres
                    .admin_database
                    .clone()
                    .unwrap_or_else(|| POSTGRES_ADMIN_DATABASE.to_string()),
                port: self.postgres.port.unwrap_or(POSTGRES_PORT),
                password: pg_password.filter(|p| !p.is_empty()),
            },
            redis_port: self.redis.port.unwrap_or(REDIS_PORT),
        })
    }
}
