//! Configuration: a YAML document with environment-variable overrides.
//!
//! Generalizes the two-dotfile lookup this project started from into a
//! structured document, since the filter rule lists and tiered thresholds
//! don't fit a flat key=value pair.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AgentError, Result};
use crate::filter::FilterConfig;
use crate::model::FilterRule;

fn default_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/cost-metrics-agent")
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_row_limit() -> usize {
    crate::segment::DEFAULT_ROW_LIMIT
}

fn default_cost_interval_secs() -> u64 {
    crate::segment::DEFAULT_COST_INTERVAL.as_secs()
}

fn default_observability_interval_secs() -> u64 {
    crate::segment::DEFAULT_OBSERVABILITY_INTERVAL.as_secs()
}

fn default_compression_level() -> u32 {
    9
}

fn default_send_interval_secs() -> u64 {
    300
}

fn default_send_timeout_secs() -> u64 {
    60
}

fn default_purge_older_than_days() -> i64 {
    7
}

fn default_component_label() -> String {
    "app.kubernetes.io/component=aggregator".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterRulesConfig {
    #[serde(default)]
    pub cost_names: Vec<FilterRule>,
    #[serde(default)]
    pub observability_names: Vec<FilterRule>,
    #[serde(default)]
    pub cost_labels: Vec<FilterRule>,
    #[serde(default)]
    pub observability_labels: Vec<FilterRule>,
}

impl From<FilterRulesConfig> for FilterConfig {
    fn from(c: FilterRulesConfig) -> Self {
        FilterConfig {
            cost_names: c.cost_names,
            observability_names: c.observability_names,
            cost_labels: c.cost_labels,
            observability_labels: c.observability_labels,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_component_label")]
    pub component_label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub cloud_account_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub filter: FilterRulesConfig,
    #[serde(default = "default_row_limit")]
    pub row_limit: usize,
    #[serde(default = "default_cost_interval_secs")]
    pub cost_max_interval_secs: u64,
    #[serde(default = "default_observability_interval_secs")]
    pub observability_max_interval_secs: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    pub remote: RemoteConfig,
    #[serde(default = "default_send_interval_secs")]
    pub send_interval_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_purge_older_than_days")]
    pub purge_older_than_days: i64,
    /// 0 means uncapped; see model::StoreUsage::capped.
    #[serde(default)]
    pub available_size_bytes: u64,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&text).map_err(|e| AgentError::InvalidInput(e.to_string()))?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NODE_NAME") {
            self.node_name = v;
        }
        if let Ok(v) = std::env::var("COST_METRICS_AGENT_STORE_DIR") {
            self.store_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COST_METRICS_AGENT_CLUSTER_NAME") {
            self.cluster_name = v;
        }
        if let Ok(v) = std::env::var("COST_METRICS_AGENT_CLOUD_ACCOUNT_ID") {
            self.cloud_account_id = v;
        }
        if let Ok(v) = std::env::var("COST_METRICS_AGENT_NODE_NAME") {
            self.node_name = v;
        }
        if let Ok(v) = std::env::var("COST_METRICS_AGENT_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("COST_METRICS_AGENT_REMOTE_URL") {
            self.remote.url = v;
        }
        if let Ok(v) = std::env::var("COST_METRICS_AGENT_REMOTE_API_KEY") {
            self.remote.api_key = v;
        }
    }

    pub fn cost_max_interval(&self) -> Duration {
        Duration::from_secs(self.cost_max_interval_secs)
    }

    pub fn observability_max_interval(&self) -> Duration {
        Duration::from_secs(self.observability_max_interval_secs)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn cost_dir(&self) -> PathBuf {
        self.store_dir.join("cost")
    }

    pub fn observability_dir(&self) -> PathBuf {
        self.store_dir.join("observability")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_yaml(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            dir.path(),
            r#"
remote:
  url: "https://example.com"
  api_key: "secret"
"#,
        );
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.row_limit, crate::segment::DEFAULT_ROW_LIMIT);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.purge_older_than_days, 7);
        assert!(cfg.filter.cost_names.is_empty());
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            dir.path(),
            r#"
cluster_name: "from-file"
remote:
  url: "https://example.com"
  api_key: "secret"
"#,
        );
        std::env::set_var("COST_METRICS_AGENT_CLUSTER_NAME", "from-env");
        let cfg = Config::load(&path).unwrap();
        std::env::remove_var("COST_METRICS_AGENT_CLUSTER_NAME");
        assert_eq!(cfg.cluster_name, "from-env");
    }

    #[test]
    fn missing_file_is_storage_error() {
        let err = Config::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(matches!(err, AgentError::Storage(_)));
    }
}
