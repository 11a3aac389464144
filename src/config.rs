//! Configuration for API and worker nodes
//!
//! Loaded from TOML, every field has a default, selected fields can be
//! overridden from the environment.

use crate::error::{Error, Result};
use crate::model::Conditions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_NODE_ID: &str = "BUFFER_NODE_ID";
pub const ENV_STATS_SYNC_INTERVAL_MS: &str = "BUFFER_STATS_SYNC_INTERVAL_MS";
pub const ENV_CHECK_INTERVAL_MS: &str = "BUFFER_CHECK_INTERVAL_MS";
pub const ENV_STATS_CACHE_TTL_MS: &str = "BUFFER_STATS_CACHE_TTL_MS";

/// Main configuration of a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Ingest side, statistics collector
    pub api: ApiConfig,
    /// Worker side, conditions checker
    pub worker: WorkerConfig,
    /// Backing store limits
    pub store: StoreConfig,
}

impl ServiceConfig {
    /// Configuration for tests (short intervals)
    pub fn test() -> Self {
        ServiceConfig {
            api: ApiConfig::test(),
            worker: WorkerConfig::test(),
            store: StoreConfig::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut config: ServiceConfig =
            toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    /// Override values from `BUFFER_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(node_id) = var(ENV_NODE_ID) {
            self.api.node_id = node_id.clone();
            self.worker.node_id = node_id;
        }
        if let Some(v) = var(ENV_STATS_SYNC_INTERVAL_MS) {
            self.api.statistics_sync_interval = parse_millis(ENV_STATS_SYNC_INTERVAL_MS, &v)?;
        }
        if let Some(v) = var(ENV_CHECK_INTERVAL_MS) {
            self.worker.check_conditions_interval = parse_millis(ENV_CHECK_INTERVAL_MS, &v)?;
        }
        if let Some(v) = var(ENV_STATS_CACHE_TTL_MS) {
            self.worker.stats_cache_ttl = parse_millis(ENV_STATS_CACHE_TTL_MS, &v)?;
        }
        self.normalize();
        self.validate()
    }

    fn normalize(&mut self) {
        if self.worker.node_id.is_empty() {
            self.worker.node_id = self.api.node_id.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.node_id.is_empty() {
            return Err(Error::Config("node id must not be empty".to_string()));
        }
        if self.api.statistics_sync_interval.is_zero() {
            return Err(Error::Config(
                "statistics sync interval must be positive".to_string(),
            ));
        }
        if self.worker.check_conditions_interval.is_zero() {
            return Err(Error::Config(
                "check conditions interval must be positive".to_string(),
            ));
        }
        if self.worker.stats_cache_ttl.is_zero() {
            return Err(Error::Config("stats cache ttl must be positive".to_string()));
        }
        if self.worker.close_resync_interval.is_zero() {
            return Err(Error::Config("close resync interval must be positive".to_string()));
        }
        // One compare and one put per slice
        let max_stats = self.store.max_ops_per_txn / 2;
        if self.api.max_stats_per_txn == 0 || self.api.max_stats_per_txn > max_stats {
            return Err(Error::Config(format!(
                "max stats per transaction must be in 1..={}",
                max_stats
            )));
        }
        Ok(())
    }
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| Error::Config(format!("invalid {}=\"{}\": {}", name, value, e)))
}

/// API node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Node identity, suffix of the per-node stats keys
    pub node_id: String,
    /// Collector flush interval (default: 1s)
    #[serde(with = "duration_millis")]
    pub statistics_sync_interval: Duration,
    /// Slice stats written per store transaction (default: 50)
    pub max_stats_per_txn: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            node_id: "api-node".to_string(),
            statistics_sync_interval: Duration::from_secs(1),
            max_stats_per_txn: 50,
        }
    }
}

impl ApiConfig {
    pub fn test() -> Self {
        ApiConfig {
            node_id: "test-node".to_string(),
            statistics_sync_interval: Duration::from_millis(100),
            max_stats_per_txn: 50,
        }
    }
}

/// Statistics read path used by the checker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderKind {
    /// Direct store reads
    Realtime,
    /// Watched in-memory mirror
    L1,
    /// TTL cache on top of the mirror
    L2,
}

/// Worker node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Node identity, member of the distribution ring
    pub node_id: String,
    /// Interval of the conditions sweep (default: 30s)
    #[serde(with = "duration_millis")]
    pub check_conditions_interval: Duration,
    /// Slice upload thresholds, fixed per deployment
    pub upload_conditions: Conditions,
    /// Files are closed when credentials expire within this window (default: 1h)
    #[serde(with = "duration_millis")]
    pub min_credentials_expiration: Duration,
    /// L2 cache clear interval (default: 1s)
    #[serde(with = "duration_millis")]
    pub stats_cache_ttl: Duration,
    pub provider: ProviderKind,
    /// Move closing slices to uploading (default: true)
    pub close_slices: bool,
    /// Move closing files to importing once their slices are uploaded (default: true)
    pub close_files: bool,
    /// Closing slices and files are retried at least this often (default: 1min)
    #[serde(with = "duration_millis")]
    pub close_resync_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            node_id: String::new(),
            check_conditions_interval: Duration::from_secs(30),
            upload_conditions: Conditions::default_upload(),
            min_credentials_expiration: Duration::from_secs(3600),
            stats_cache_ttl: Duration::from_secs(1),
            provider: ProviderKind::L2,
            close_slices: true,
            close_files: true,
            close_resync_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn test() -> Self {
        WorkerConfig {
            node_id: "test-node".to_string(),
            check_conditions_interval: Duration::from_millis(200),
            upload_conditions: Conditions::default_upload(),
            min_credentials_expiration: Duration::from_secs(3600),
            stats_cache_ttl: Duration::from_millis(50),
            provider: ProviderKind::Realtime,
            close_slices: true,
            close_files: true,
            close_resync_interval: Duration::from_millis(200),
        }
    }
}

/// Backing store limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum operations in one transaction (default: 128)
    pub max_ops_per_txn: usize,
    /// Maximum exports in one receiver (default: 20)
    pub max_exports_per_receiver: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_ops_per_txn: 128,
            max_exports_per_receiver: 20,
        }
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ByteSize;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.api.statistics_sync_interval, Duration::from_secs(1));
        assert_eq!(config.api.max_stats_per_txn, 50);
        assert_eq!(
            config.worker.check_conditions_interval,
            Duration::from_secs(30)
        );
        assert_eq!(config.worker.upload_conditions.count, 1000);
        assert_eq!(config.worker.upload_conditions.size, ByteSize::mb(1));
        assert_eq!(config.worker.provider, ProviderKind::L2);
        assert!(config.worker.close_slices && config.worker.close_files);
        assert_eq!(config.worker.close_resync_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = ServiceConfig::from_toml_str(
            r#"
            [api]
            node_id = "api-1"
            statistics_sync_interval = 500

            [worker]
            check_conditions_interval = 1000
            provider = "l1"
            close_files = false

            [worker.upload_conditions]
            count = 10
            size = "200KB"
            time = 60000
            "#,
        )
        .unwrap();

        assert_eq!(config.api.node_id, "api-1");
        assert_eq!(config.worker.node_id, "api-1");
        assert_eq!(
            config.api.statistics_sync_interval,
            Duration::from_millis(500)
        );
        assert_eq!(config.api.max_stats_per_txn, 50);
        assert_eq!(config.worker.provider, ProviderKind::L1);
        assert_eq!(config.worker.upload_conditions.size, ByteSize::kb(200));
        assert!(config.worker.close_slices);
        assert!(!config.worker.close_files);
        assert_eq!(
            config.worker.min_credentials_expiration,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_invalid_toml() {
        let err = ServiceConfig::from_toml_str("[api]\nmax_stats_per_txn = \"x\"").unwrap_err();
        assert!(err.to_string().starts_with("config error:"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_NODE_ID, "worker-7"),
            (ENV_CHECK_INTERVAL_MS, "250"),
            (ENV_STATS_CACHE_TTL_MS, "20"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.api.node_id, "worker-7");
        assert_eq!(config.worker.node_id, "worker-7");
        assert_eq!(
            config.worker.check_conditions_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.worker.stats_cache_ttl, Duration::from_millis(20));

        let mut config = ServiceConfig::default();
        let err = config
            .apply_vars(|name| (name == ENV_STATS_SYNC_INTERVAL_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_STATS_SYNC_INTERVAL_MS));
    }

    #[test]
    fn test_validate_txn_limit() {
        let mut config = ServiceConfig::default();
        config.api.max_stats_per_txn = 64;
        assert!(config.validate().is_ok());
        config.api.max_stats_per_txn = 65;
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "config error: max stats per transaction must be in 1..=64"
        );
    }
}
