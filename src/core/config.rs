use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const API_URL_ENV: &str = "OPTIAGENT_API_URL";
pub const EXECUTIONS_URL_ENV: &str = "OPTIAGENT_EXECUTIONS_URL";
pub const ANALYSIS_URL_ENV: &str = "OPTIAGENT_ANALYSIS_URL";

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base of the primary REST API, including the `/api` prefix.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Host of the execution store (Mongo-backed service).
    #[serde(default = "default_executions_url")]
    pub executions_url: String,

    /// Full URL of the fraud-detection endpoint.
    #[serde(default = "default_analysis_url")]
    pub analysis_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_storage_quota_bytes")]
    pub storage_quota_bytes: u64,

    #[serde(skip)]
    pub data_dir: PathBuf,
}

fn default_api_url() -> String {
    "http://localhost:8081/api".to_string()
}
fn default_executions_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_analysis_url() -> String {
    "http://localhost:8000/detecter_fraude/".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_storage_quota_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            executions_url: default_executions_url(),
            analysis_url: default_analysis_url(),
            request_timeout_secs: default_request_timeout_secs(),
            storage_quota_bytes: default_storage_quota_bytes(),
            data_dir: PathBuf::new(),
        }
    }
}

impl Config {
    /// Read `config.toml` from the data directory, then apply environment
    /// overrides. A missing file yields the defaults.
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let config_path = data_dir.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            toml::from_str::<Config>(&content)
                .map_err(|e| anyhow!("Invalid {}: {}", config_path.display(), e))?
        } else {
            debug!("No config.toml found, using defaults.");
            Config::default()
        };
        config.data_dir = data_dir;
        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Loaded config: api={}, executions={}, analysis={}",
            config.api_url, config.executions_url, config.analysis_url
        );
        Ok(config)
    }

    pub(crate) fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let pick = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = pick(API_URL_ENV) {
            self.api_url = v.trim().to_string();
        }
        if let Some(v) = pick(EXECUTIONS_URL_ENV) {
            self.executions_url = v.trim().to_string();
        }
        if let Some(v) = pick(ANALYSIS_URL_ENV) {
            self.analysis_url = v.trim().to_string();
        }
    }

    /// Command-line flags win over file and environment.
    pub fn apply_overrides(&mut self, api_url: Option<&str>) -> Result<()> {
        if let Some(url) = api_url {
            self.api_url = url.trim().to_string();
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("api_url", &self.api_url),
            ("executions_url", &self.executions_url),
            ("analysis_url", &self.analysis_url),
        ] {
            let parsed = url::Url::parse(value)
                .map_err(|e| anyhow!("{} '{}' is not a valid URL: {}", name, value, e))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(anyhow!("{} must use http or https, got '{}'", name, value));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub async fn save(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::write(self.data_dir.join(CONFIG_FILE), self.to_toml()?).await?;
        Ok(())
    }

    /// Set one field by its config-file name.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api_url" => self.api_url = value.to_string(),
            "executions_url" => self.executions_url = value.to_string(),
            "analysis_url" => self.analysis_url = value.to_string(),
            "request_timeout_secs" => {
                self.request_timeout_secs = value
                    .parse()
                    .map_err(|_| anyhow!("request_timeout_secs expects a number"))?
            }
            "storage_quota_bytes" => {
                self.storage_quota_bytes = value
                    .parse()
                    .map_err(|_| anyhow!("storage_quota_bytes expects a number"))?
            }
            other => return Err(anyhow!("Unknown config key: {}", other)),
        }
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_services() {
        let config = Config::default();
        assert_eq!(config.api_url, "http://localhost:8081/api");
        assert_eq!(config.executions_url, "http://localhost:8000");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.storage_quota_bytes, 5 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let config: Config = toml::from_str("api_url = \"http://10.0.0.5:9000/api\"").unwrap();
        assert_eq!(config.api_url, "http://10.0.0.5:9000/api");
        assert_eq!(config.analysis_url, "http://localhost:8000/detecter_fraude/");
    }

    #[test]
    fn env_overrides_file_and_flag_overrides_env() {
        let mut config = Config::default();
        config.apply_env_with(|key| match key {
            API_URL_ENV => Some("http://env-host:1/api".to_string()),
            EXECUTIONS_URL_ENV => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.api_url, "http://env-host:1/api");
        assert_eq!(config.executions_url, "http://localhost:8000");

        config.apply_overrides(Some("http://flag-host:2/api")).unwrap();
        assert_eq!(config.api_url, "http://flag-host:2/api");
    }

    #[test]
    fn rejects_invalid_urls() {
        let mut config = Config::default();
        assert!(config.apply_overrides(Some("not a url")).is_err());
        config.api_url = "ftp://host/api".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn set_field_validates_numbers_and_keys() {
        let mut config = Config::default();
        config.set_field("request_timeout_secs", "5").unwrap();
        assert_eq!(config.request_timeout_secs, 5);
        assert!(config.set_field("request_timeout_secs", "abc").is_err());
        assert!(config.set_field("nope", "1").is_err());
    }

    #[tokio::test]
    async fn load_reads_file_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join(CONFIG_FILE),
            "request_timeout_secs = 7\nstorage_quota_bytes = 1024\n",
        )
        .await
        .unwrap();
        let config = Config::load(dir.path()).await.unwrap();
        assert_eq!(config.request_timeout_secs, 7);
        assert_eq!(config.storage_quota_bytes, 1024);
        assert_eq!(config.data_dir, dir.path());
    }
}
