use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::analytics::AnalyticsOptions;
use crate::store::load::LoaderOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementSection {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ManagementSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            token: None,
            timeout_secs: 10,
        }
    }
}

impl ManagementSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub url: String,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Audience every bearer token must carry unless configured otherwise.
pub const DEFAULT_AUDIENCE: &str = "iam.authz.marmotedu.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtSection {
    /// `null` disables the audience check.
    pub audience: Option<String>,
}

impl Default for JwtSection {
    fn default() -> Self {
        Self {
            audience: Some(DEFAULT_AUDIENCE.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub management: ManagementSection,
    pub redis: RedisSection,
    pub analytics: AnalyticsOptions,
    pub jwt: JwtSection,
    pub loader: LoaderOptions,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let mut cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// Environment wins over the file for connection settings.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("AUTHZ_REDIS_URL").filter(|v| !v.is_empty()) {
            self.redis.url = url;
        }
        if let Some(url) = var("AUTHZ_MANAGEMENT_URL").filter(|v| !v.is_empty()) {
            self.management.base_url = url;
        }
        if let Some(token) = var("AUTHZ_MANAGEMENT_TOKEN").filter(|v| !v.is_empty()) {
            self.management.token = Some(token);
        }
    }
}
