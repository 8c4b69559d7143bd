use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub spool_dir: Option<String>,
    pub source_url: Option<String>,
    pub source_timeout_secs: Option<u64>,

    // Feature configs
    pub orchestrator: Option<OrchestratorConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub retry_base_delay_secs: Option<u64>,
    pub retry_max_delay_secs: Option<u64>,
    pub lease_ttl_secs: Option<i64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub visibility_timeout_secs: Option<u64>,
    pub bus_max_deliveries: Option<u32>,
    pub breaker_failure_threshold: Option<usize>,
    pub breaker_window_secs: Option<u64>,
    pub breaker_cooldown_secs: Option<u64>,
    pub worker_count: Option<usize>,
    pub checkpoint_interval_bytes: Option<u64>,
    pub audit_retention_days: Option<u64>,
    pub maintenance_interval_secs: Option<u64>,
}

impl FileConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: FileConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.db_dir.is_none());
        assert!(config.orchestrator.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            db_dir = "/var/lib/staffetta"
            spool_dir = "/var/spool/staffetta"
            source_url = "http://localhost:9999"
            source_timeout_secs = 45

            [orchestrator]
            max_attempts = 3
            retry_base_delay_secs = 2
            retry_max_delay_secs = 120
            lease_ttl_secs = 90
            heartbeat_interval_secs = 30
            worker_count = 8
        "#;

        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.db_dir.as_deref(), Some("/var/lib/staffetta"));
        assert_eq!(config.source_timeout_secs, Some(45));

        let orch = config.orchestrator.unwrap();
        assert_eq!(orch.max_attempts, Some(3));
        assert_eq!(orch.retry_base_delay_secs, Some(2));
        assert_eq!(orch.worker_count, Some(8));
        assert!(orch.visibility_timeout_secs.is_none());
    }

    #[test]
    fn test_unknown_section_is_ignored() {
        let toml_str = r#"
            db_dir = "/tmp"
            [future_feature]
            key = "value"
        "#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.db_dir.as_deref(), Some("/tmp"));
    }
}
