use crate::escalation::Thresholds;
use crate::probe::ProbeMethod;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {0} not found (set HOSTWATCH_CONFIG or create it)")]
    NotFound(PathBuf),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Invalid {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostwatchConfig {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub store: StoreConf,
    pub thresholds: Thresholds,
    #[serde(default)]
    pub probe: ProbeConf,
    pub notification: NotificationConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConf {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProbeConf {
    #[serde(default)]
    pub method: ProbeMethod,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u32,
    #[serde(default = "default_probe_count")]
    pub count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationConf {
    pub call_url: String,
    pub sms_url: String,
    pub sms_username: String,
    pub sms_password: String,
    /// Recipients of both calls and SMS.
    #[serde(default)]
    pub msisdn: Vec<String>,
    /// host -> site code passed to the call gateway
    #[serde(default)]
    pub locations: HashMap<String, u32>,
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_probe_timeout() -> u32 {
    1
}

fn default_probe_count() -> u32 {
    1
}

fn default_dispatch_timeout() -> u64 {
    10
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Default for ProbeConf {
    fn default() -> Self {
        Self {
            method: ProbeMethod::default(),
            timeout_secs: default_probe_timeout(),
            count: default_probe_count(),
        }
    }
}

impl HostwatchConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(txt)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Validation("host list is empty".into()));
        }
        if let Some(blank) = self.hosts.iter().find(|h| h.trim().is_empty()) {
            return Err(ConfigError::Validation(format!("blank host entry {blank:?}")));
        }
        let delay = self.thresholds.notification_delay_minutes;
        if !delay.is_finite() || delay < 0.0 {
            return Err(ConfigError::Validation(format!(
                "notification_delay_minutes must be a non-negative number, got {delay}"
            )));
        }
        if self.probe.count == 0 {
            return Err(ConfigError::Validation("probe count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Location of the config file: `HOSTWATCH_CONFIG` or `./hostwatch.yaml`.
pub fn config_path() -> PathBuf {
    std::env::var("HOSTWATCH_CONFIG")
        .unwrap_or_else(|_| "hostwatch.yaml".into())
        .into()
}

pub async fn load_config() -> Result<HostwatchConfig, ConfigError> {
    load_config_from(&config_path()).await
}

pub async fn load_config_from(path: &Path) -> Result<HostwatchConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = HostwatchConfig::from_yaml(&txt).map_err(|source| ConfigError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
hosts: ["89.31.240.234", "185.61.131.190"]
thresholds:
  max_call_attempts: 2
  notification_delay_minutes: 5
notification:
  call_url: "https://voice.example/call?key=abc"
  sms_url: "https://sms.example/send"
  sms_username: "ops"
  sms_password: "secret"
  msisdn: ["+15550100"]
  locations:
    "89.31.240.234": 1
"#;

    #[test]
    fn test_sample_config_with_defaults() {
        let cfg = HostwatchConfig::from_yaml(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.hosts.len(), 2);
        assert_eq!(cfg.thresholds.max_call_attempts, 2);
        assert_eq!(cfg.thresholds.notification_delay_minutes, 5.0);
        assert_eq!(cfg.store.path, PathBuf::from("state.json"));
        assert_eq!(cfg.probe.method, ProbeMethod::Ping);
        assert_eq!(cfg.probe.timeout_secs, 1);
        assert_eq!(cfg.notification.timeout_secs, 10);
        assert_eq!(cfg.notification.locations.get("89.31.240.234"), Some(&1));
    }

    #[test]
    fn test_fping_method_parses() {
        let txt = SAMPLE.replace("thresholds:", "probe:\n  method: fping\n  count: 10\nthresholds:");
        let cfg = HostwatchConfig::from_yaml(&txt).unwrap();
        assert_eq!(cfg.probe.method, ProbeMethod::Fping);
        assert_eq!(cfg.probe.count, 10);
    }

    #[test]
    fn test_empty_host_list_is_rejected() {
        let txt = SAMPLE.replace(r#"hosts: ["89.31.240.234", "185.61.131.190"]"#, "hosts: []");
        let cfg = HostwatchConfig::from_yaml(&txt).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_negative_delay_is_rejected() {
        let txt = SAMPLE.replace("notification_delay_minutes: 5", "notification_delay_minutes: -1");
        let cfg = HostwatchConfig::from_yaml(&txt).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let err = load_config_from(Path::new("/nonexistent/hostwatch.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_yaml_names_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hostwatch.yaml");
        std::fs::write(&path, "hosts: [unclosed").unwrap();
        let err = load_config_from(&path).await.unwrap_err();
        assert!(err.to_string().contains("hostwatch.yaml"));
    }
}
