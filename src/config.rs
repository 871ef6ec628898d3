use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::model::mapping::{self, FieldMappingRule, RawRule};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub source: InstanceConfig,
    pub target: InstanceConfig,
    /// Issue types pulled from the source project. Empty means all.
    #[serde(default)]
    pub sync_issue_types: Vec<String>,
    /// Field mapping rules, relative to the config file unless absolute.
    pub mapping_file: Option<PathBuf>,
    #[serde(default)]
    pub run: RunSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    #[serde(flatten)]
    pub auth: AuthConfig,
    pub project_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "auth_type", rename_all = "lowercase")]
pub enum AuthConfig {
    Basic {
        domain: String,
        email: String,
        api_token: String,
    },
    Bearer {
        cloud_id: String,
        api_token: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Issue pairs processed at once.
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    /// Concurrent HTTP requests allowed per tracker instance.
    pub max_in_flight_requests: usize,
    pub max_retries: u32,
    pub attachment_cache_dir: Option<PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            request_timeout_secs: 30,
            max_in_flight_requests: 4,
            max_retries: 3,
            attachment_cache_dir: None,
        }
    }
}

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".jira-sync")
}

pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        bail!(
            "No config found at {}. Create it with [source] and [target] sections.",
            path.display()
        );
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, instance) in [("source", &self.source), ("target", &self.target)] {
            if instance.project_key.trim().is_empty() {
                return Err(invalid(name, "project_key must not be empty"));
            }
            let token = match &instance.auth {
                AuthConfig::Basic {
                    domain,
                    email,
                    api_token,
                } => {
                    if domain.trim().is_empty() || email.trim().is_empty() {
                        return Err(invalid(name, "basic auth needs domain and email"));
                    }
                    api_token
                }
                AuthConfig::Bearer { cloud_id, api_token } => {
                    if cloud_id.trim().is_empty() {
                        return Err(invalid(name, "bearer auth needs cloud_id"));
                    }
                    api_token
                }
            };
            if token.trim().is_empty() {
                return Err(invalid(name, "api_token must not be empty"));
            }
        }
        if self.run.concurrency == 0 || self.run.max_in_flight_requests == 0 {
            return Err(invalid("run", "concurrency and max_in_flight_requests must be at least 1"));
        }
        Ok(())
    }

    /// Where the mapping rules live for a config loaded from `config_path`.
    pub fn mapping_path(&self, config_path: &Path) -> PathBuf {
        let file = self
            .mapping_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("field_mapping.json"));
        if file.is_absolute() {
            return file;
        }
        config_path
            .parent()
            .map(|dir| dir.join(&file))
            .unwrap_or(file)
    }
}

fn invalid(instance: &str, message: &str) -> ConfigError {
    ConfigError::InvalidInstance {
        instance: instance.to_string(),
        message: message.to_string(),
    }
}

pub fn load_mapping_rules(path: &Path) -> Result<Vec<FieldMappingRule>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read field mapping from {}", path.display()))?;
    let raw: Vec<RawRule> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let rules = mapping::load(raw)?;
    Ok(rules)
}
