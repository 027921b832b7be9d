//! Configuration management for the rollup daemon
//!
//! TOML file with one section per subsystem, environment variable overrides
//! and sensible defaults. Every section may be omitted.
//!
//! ```toml
//! [aggregators]
//! cluster_app_ids = ["hbase", "kafka_broker"]
//!
//! [aggregators.host_minute]
//! interval_secs = 300
//! cutoff = 3
//!
//! [query]
//! result_limit = 10000
//!
//! [storage]
//! checkpoint_dir = "/var/lib/kuba-rollup/checkpoints"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::aggregation::ClusterAggregatorConfig;
use crate::aggregation::DEFAULT_PARALLEL_THRESHOLD;
use crate::metadata::{wildcard_regex, MetadataConfig};
use crate::query::QueryPlannerConfig;
use crate::services::rollup::{LevelKind, RollupLevel};
use crate::storage::{ClusterInventory, StorageParams};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Rollup levels and the cluster aggregator
    #[serde(default)]
    pub aggregators: AggregatorsConfig,

    /// Query planning
    #[serde(default)]
    pub query: QueryPlannerConfig,

    /// Series identity cache
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Cluster inventory for split point sizing
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Local state
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Overrides for one rollup level; unset fields keep the level's defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LevelConfig {
    /// Sleep interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,

    /// Lag multiplier before skipping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<u32>,

    /// Turn the level off
    #[serde(default)]
    pub disabled: bool,
}

/// Rollup level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregatorsConfig {
    /// Raw → host minute
    #[serde(default)]
    pub host_minute: LevelConfig,
    /// Host minute → hourly
    #[serde(default)]
    pub host_hourly: LevelConfig,
    /// Host hourly → daily
    #[serde(default)]
    pub host_daily: LevelConfig,
    /// Raw → cluster second slices
    #[serde(default)]
    pub cluster_second: LevelConfig,
    /// Cluster second → minute
    #[serde(default)]
    pub cluster_minute: LevelConfig,
    /// Cluster minute → hourly
    #[serde(default)]
    pub cluster_hourly: LevelConfig,
    /// Cluster hourly → daily
    #[serde(default)]
    pub cluster_daily: LevelConfig,

    /// Apps that receive the host metrics of their hosts
    #[serde(default)]
    pub cluster_app_ids: Vec<String>,

    /// Cluster slice width in seconds
    #[serde(default = "default_timeslice_secs")]
    pub timeslice_secs: u64,

    /// How late raw points may arrive and still count, in seconds
    #[serde(default = "default_out_of_band_allowance_secs")]
    pub out_of_band_allowance_secs: u64,

    /// Group count above which merging runs on the rayon pool
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

/// Cluster inventory used to size table partitions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisioningConfig {
    /// Comma separated master components
    #[serde(default = "default_master_components")]
    pub master_components: String,

    /// Comma separated components on every slave
    #[serde(default = "default_slave_components")]
    pub slave_components: String,

    /// Number of slave hosts
    #[serde(default = "default_slave_count")]
    pub slave_count: u32,

    /// Store heap in MB
    #[serde(default = "default_heap_mb")]
    pub heap_mb: u64,

    /// Write buffer flush size in MB
    #[serde(default = "default_flush_mb")]
    pub flush_mb: u64,

    /// Upper bound on raw table partitions
    #[serde(default = "default_max_regions")]
    pub max_regions: u32,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Text exposition file rewritten on every export, for a textfile
    /// collector; without it the exposition is logged at debug level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_file: Option<PathBuf>,

    /// Seconds between metric exports
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Local state configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding one file per level checkpoint
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

// Default value functions
fn default_timeslice_secs() -> u64 { 30 }
fn default_out_of_band_allowance_secs() -> u64 { 300 }
fn default_parallel_threshold() -> usize { DEFAULT_PARALLEL_THRESHOLD }
fn default_master_components() -> String { "NAMENODE,RESOURCEMANAGER,METRICS_COLLECTOR".to_string() }
fn default_slave_components() -> String { "DATANODE,NODEMANAGER,METRICS_MONITOR".to_string() }
fn default_slave_count() -> u32 { 1 }
fn default_heap_mb() -> u64 { 1_024 }
fn default_flush_mb() -> u64 { 128 }
fn default_max_regions() -> u32 { 64 }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_interval_secs() -> u64 { 60 }
fn default_checkpoint_dir() -> PathBuf { PathBuf::from("/var/lib/kuba-rollup/checkpoints") }
fn default_true() -> bool { true }

impl Default for AggregatorsConfig {
    fn default() -> Self {
        Self {
            host_minute: LevelConfig::default(),
            host_hourly: LevelConfig::default(),
            host_daily: LevelConfig::default(),
            cluster_second: LevelConfig::default(),
            cluster_minute: LevelConfig::default(),
            cluster_hourly: LevelConfig::default(),
            cluster_daily: LevelConfig::default(),
            cluster_app_ids: Vec::new(),
            timeslice_secs: default_timeslice_secs(),
            out_of_band_allowance_secs: default_out_of_band_allowance_secs(),
            parallel_threshold: default_parallel_threshold(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            master_components: default_master_components(),
            slave_components: default_slave_components(),
            slave_count: default_slave_count(),
            heap_mb: default_heap_mb(),
            flush_mb: default_flush_mb(),
            max_regions: default_max_regions(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_file: None,
            metrics_interval_secs: default_metrics_interval_secs(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

impl AggregatorsConfig {
    /// Overrides for `kind`
    pub fn overrides(&self, kind: LevelKind) -> &LevelConfig {
        match kind {
            LevelKind::HostMinute => &self.host_minute,
            LevelKind::HostHourly => &self.host_hourly,
            LevelKind::HostDaily => &self.host_daily,
            LevelKind::ClusterSecond => &self.cluster_second,
            LevelKind::ClusterMinute => &self.cluster_minute,
            LevelKind::ClusterHourly => &self.cluster_hourly,
            LevelKind::ClusterDaily => &self.cluster_daily,
        }
    }

    fn overrides_mut(&mut self, kind: LevelKind) -> &mut LevelConfig {
        match kind {
            LevelKind::HostMinute => &mut self.host_minute,
            LevelKind::HostHourly => &mut self.host_hourly,
            LevelKind::HostDaily => &mut self.host_daily,
            LevelKind::ClusterSecond => &mut self.cluster_second,
            LevelKind::ClusterMinute => &mut self.cluster_minute,
            LevelKind::ClusterHourly => &mut self.cluster_hourly,
            LevelKind::ClusterDaily => &mut self.cluster_daily,
        }
    }

    /// Effective schedule of `kind`
    pub fn level(&self, kind: LevelKind) -> RollupLevel {
        let mut level = kind.level();
        let overrides = self.overrides(kind);
        if let Some(secs) = overrides.interval_secs {
            level.interval = Duration::from_secs(secs);
        }
        if let Some(cutoff) = overrides.cutoff {
            level.cutoff = cutoff;
        }
        level.disabled = overrides.disabled;
        level
    }

    /// Settings of the second-level cluster aggregator
    pub fn cluster(&self) -> ClusterAggregatorConfig {
        ClusterAggregatorConfig {
            timeslice_ms: (self.timeslice_secs * 1000) as i64,
            out_of_band_allowance_ms: (self.out_of_band_allowance_secs * 1000) as i64,
            cluster_app_ids: self.cluster_app_ids.clone(),
            parallel_threshold: self.parallel_threshold,
        }
    }
}

impl ProvisioningConfig {
    /// Parsed component inventory
    pub fn inventory(&self) -> ClusterInventory {
        ClusterInventory::parse(&self.master_components, &self.slave_components, self.slave_count)
    }

    /// Store memory parameters
    pub fn storage_params(&self) -> StorageParams {
        StorageParams {
            heap_mb: self.heap_mb,
            flush_mb: self.flush_mb,
            max_regions: self.max_regions,
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Aggregators
        if let Ok(apps) = std::env::var("ROLLUP_CLUSTER_APP_IDS") {
            self.aggregators.cluster_app_ids = parse_list(&apps);
        }
        if let Ok(levels) = std::env::var("ROLLUP_DISABLED_LEVELS") {
            for name in parse_list(&levels) {
                match LevelKind::ALL.iter().find(|k| k.name() == name) {
                    Some(kind) => self.aggregators.overrides_mut(*kind).disabled = true,
                    None => tracing::warn!(level = %name, "Unknown level in ROLLUP_DISABLED_LEVELS"),
                }
            }
        }

        // Query
        if let Ok(limit) = std::env::var("ROLLUP_RESULT_LIMIT") {
            if let Ok(l) = limit.parse() {
                self.query.result_limit = l;
            }
        }

        // Provisioning
        if let Ok(count) = std::env::var("ROLLUP_SLAVE_COUNT") {
            if let Ok(c) = count.parse() {
                self.provisioning.slave_count = c;
            }
        }

        // Storage
        if let Ok(dir) = std::env::var("ROLLUP_CHECKPOINT_DIR") {
            self.storage.checkpoint_dir = PathBuf::from(dir);
        }

        // Monitoring
        if let Ok(enabled) = std::env::var("ROLLUP_METRICS_ENABLED") {
            if let Ok(e) = enabled.parse() {
                self.monitoring.metrics_enabled = e;
            }
        }
        if let Ok(path) = std::env::var("ROLLUP_METRICS_FILE") {
            self.monitoring.metrics_file = Some(PathBuf::from(path));
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        for kind in LevelKind::ALL {
            let level = self.aggregators.level(kind);
            if level.interval.is_zero() {
                return Err(format!("Interval of level {} must be > 0", level.name));
            }
            if level.cutoff == 0 {
                return Err(format!("Cutoff of level {} must be >= 1", level.name));
            }
        }
        if self.aggregators.timeslice_secs == 0 {
            return Err("Cluster time slice must be > 0".to_string());
        }

        self.query.validate()?;

        for pattern in &self.metadata.transient_patterns {
            wildcard_regex(pattern).map_err(|e| e.to_string())?;
        }

        if self.provisioning.heap_mb == 0 || self.provisioning.flush_mb == 0 {
            return Err("Heap and flush sizes must be > 0".to_string());
        }
        if self.provisioning.max_regions == 0 {
            return Err("Max regions must be > 0".to_string());
        }

        if self.monitoring.metrics_enabled && self.monitoring.metrics_interval_secs == 0 {
            return Err("Metrics export interval must be > 0".to_string());
        }

        if self.storage.checkpoint_dir.as_os_str().is_empty() {
            return Err("Checkpoint directory cannot be empty".to_string());
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.monitoring.metrics_enabled);
        assert_eq!(config.query.result_limit, 10_000);
        assert_eq!(config.aggregators.cluster().timeslice_ms, 30_000);
        assert_eq!(config.aggregators.cluster().out_of_band_allowance_ms, 300_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_level_overrides() {
        let config: Config = toml::from_str(
            r#"
            [aggregators.host_minute]
            interval_secs = 60

            [aggregators.cluster_daily]
            disabled = true
            "#,
        )
        .unwrap();

        let minute = config.aggregators.level(LevelKind::HostMinute);
        assert_eq!(minute.interval, Duration::from_secs(60));
        assert_eq!(minute.cutoff, LevelKind::HostMinute.default_cutoff());
        assert!(config.aggregators.level(LevelKind::ClusterDaily).disabled);
        assert!(!config.aggregators.level(LevelKind::HostDaily).disabled);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::default();
        config.aggregators.cluster_second.cutoff = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.query.result_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.checkpoint_dir = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.monitoring.metrics_interval_secs = 0;
        assert!(config.validate().is_err());
        config.monitoring.metrics_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_metrics_export_section() {
        let config: Config = toml::from_str(
            r#"
            [monitoring]
            metrics_file = "/var/lib/node_exporter/rollup.prom"
            metrics_interval_secs = 15
            "#,
        )
        .unwrap();
        assert_eq!(
            config.monitoring.metrics_file,
            Some(PathBuf::from("/var/lib/node_exporter/rollup.prom"))
        );
        assert_eq!(config.monitoring.metrics_interval_secs, 15);
        assert!(Config::default().monitoring.metrics_file.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rollup.toml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.aggregators.cluster_app_ids = vec!["hbase".to_string()];
        config.aggregators.host_hourly.cutoff = Some(4);
        config.save_to_file(path).unwrap();

        let reloaded = Config::from_file(path).unwrap();
        assert_eq!(reloaded.aggregators.cluster_app_ids, vec!["hbase"]);
        assert_eq!(reloaded.aggregators.level(LevelKind::HostHourly).cutoff, 4);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("ROLLUP_RESULT_LIMIT", "5000");
        std::env::set_var("ROLLUP_DISABLED_LEVELS", "cluster-second, host-daily");
        let config = Config::from_env();
        assert_eq!(config.query.result_limit, 5000);
        assert!(config.aggregators.cluster_second.disabled);
        assert!(config.aggregators.host_daily.disabled);
        std::env::remove_var("ROLLUP_RESULT_LIMIT");
        std::env::remove_var("ROLLUP_DISABLED_LEVELS");
    }
}
