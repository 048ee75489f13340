use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for a diffoor run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Source cluster connection and capture layout.
    #[serde(default = "default_source_cluster")]
    pub source: ClusterConfig,

    /// Target cluster connection and capture layout.
    #[serde(default = "default_target_cluster")]
    pub target: ClusterConfig,

    /// Capture pipeline shape shared by both clusters.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Checkpoint persistence configuration.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Retry policy for cluster stats queries.
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Per-cluster connection endpoints and fan-out.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Cluster endpoint URL (e.g. "mem://local").
    #[serde(default)]
    pub url: String,

    /// Bucket to stream.
    #[serde(default)]
    pub bucket: String,

    /// Cluster username.
    #[serde(default)]
    pub username: String,

    /// Cluster password.
    #[serde(default)]
    pub password: String,

    /// Directory receiving this cluster's fingerprint files.
    #[serde(default)]
    pub file_dir: PathBuf,

    /// Number of DCP clients for this cluster. Default: 4.
    #[serde(default = "default_clients")]
    pub clients: usize,

    /// Number of handler workers per client. Default: 256.
    #[serde(default = "default_workers_per_client")]
    pub workers_per_client: usize,

    /// Per-handler event queue capacity. Default: 1000.
    #[serde(default = "default_handler_chan_size")]
    pub handler_chan_size: usize,
}

/// Capture pipeline shape shared by both clusters.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Bins per vbucket; must match between source and target. Default: 10.
    #[serde(default = "default_bins")]
    pub n_bins: u32,

    /// File-descriptor pool capacity shared by both drivers. Default: 500.
    #[serde(default = "default_fd")]
    pub n_fd: usize,

    /// End each stream once it reaches the high-seqno observed at start.
    /// Default: true.
    #[serde(default = "default_true")]
    pub complete_by_seqno: bool,

    /// Wall-clock upper bound for the run. Zero means unbounded. Default: 0.
    #[serde(default, with = "humantime_serde")]
    pub complete_by_duration: Duration,

    /// Stagger between source driver start and target driver start.
    /// Default: 2s.
    #[serde(default = "default_cluster_delay", with = "humantime_serde")]
    pub delay_between_source_and_target: Duration,
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding checkpoint files.
    #[serde(default = "default_checkpoint_dir")]
    pub file_dir: PathBuf,

    /// Source checkpoint file to resume from. Empty starts from scratch.
    #[serde(default)]
    pub old_source_filename: String,

    /// Target checkpoint file to resume from. Empty starts from scratch.
    #[serde(default)]
    pub old_target_filename: String,

    /// Checkpoint file written during and at the end of the run, prefixed
    /// per driver. Empty disables persistence.
    #[serde(default)]
    pub new_filename: String,

    /// Periodic persistence interval. Zero disables periodic persistence.
    /// Default: 600s.
    #[serde(default = "default_checkpoint_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Retry policy for cluster stats queries (failover logs, high seqnos).
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Per-call timeout for bucket stats operations. Default: 20s.
    #[serde(default = "default_bucket_op_timeout", with = "humantime_serde")]
    pub bucket_op_timeout: Duration,

    /// Maximum number of retries for a stats query. Default: 10.
    #[serde(default = "default_stats_retries")]
    pub max_get_stats_retry: u32,

    /// Initial retry interval, doubled each attempt. Default: 2s.
    #[serde(default = "default_stats_retry_interval", with = "humantime_serde")]
    pub get_stats_retry_interval: Duration,

    /// Upper bound on the retry interval. Default: 10s.
    #[serde(default = "default_stats_max_backoff", with = "humantime_serde")]
    pub get_stats_max_backoff: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_cluster() -> ClusterConfig {
    ClusterConfig::named("source")
}

fn default_target_cluster() -> ClusterConfig {
    ClusterConfig::named("target")
}

fn default_clients() -> usize {
    4
}

fn default_workers_per_client() -> usize {
    256
}

fn default_handler_chan_size() -> usize {
    1000
}

fn default_bins() -> u32 {
    10
}

fn default_fd() -> usize {
    500
}

fn default_true() -> bool {
    true
}

fn default_cluster_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoint")
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_bucket_op_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_stats_retries() -> u32 {
    10
}

fn default_stats_retry_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_stats_max_backoff() -> Duration {
    Duration::from_secs(10)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: default_source_cluster(),
            target: default_target_cluster(),
            capture: CaptureConfig::default(),
            checkpoint: CheckpointConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Cluster config defaults with the conventional per-role output dir.
    fn named(role: &str) -> Self {
        Self {
            url: String::new(),
            bucket: String::new(),
            username: String::new(),
            password: String::new(),
            file_dir: PathBuf::from(role),
            clients: default_clients(),
            workers_per_client: default_workers_per_client(),
            handler_chan_size: default_handler_chan_size(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            n_bins: default_bins(),
            n_fd: default_fd(),
            complete_by_seqno: true,
            complete_by_duration: Duration::ZERO,
            delay_between_source_and_target: default_cluster_delay(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            file_dir: default_checkpoint_dir(),
            old_source_filename: String::new(),
            old_target_filename: String::new(),
            new_filename: String::new(),
            interval: default_checkpoint_interval(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            bucket_op_timeout: default_bucket_op_timeout(),
            max_get_stats_retry: default_stats_retries(),
            get_stats_retry_interval: default_stats_retry_interval(),
            get_stats_max_backoff: default_stats_max_backoff(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.source.validate("source")?;
        self.target.validate("target")?;

        if self.capture.n_bins == 0 {
            bail!("capture.n_bins must be positive");
        }

        if self.capture.n_fd == 0 {
            bail!("capture.n_fd must be positive");
        }

        let has_old = !self.checkpoint.old_source_filename.is_empty()
            || !self.checkpoint.old_target_filename.is_empty();
        if (has_old || !self.checkpoint.new_filename.is_empty())
            && self.checkpoint.file_dir.as_os_str().is_empty()
        {
            bail!("checkpoint.file_dir is required when checkpoint files are configured");
        }

        if self.stats.get_stats_retry_interval.is_zero() {
            bail!("stats.get_stats_retry_interval must be positive");
        }

        Ok(())
    }
}

impl ClusterConfig {
    fn validate(&self, role: &str) -> Result<()> {
        if self.url.is_empty() {
            bail!("{role}.url is required");
        }

        if self.bucket.is_empty() {
            bail!("{role}.bucket is required");
        }

        if self.file_dir.as_os_str().is_empty() {
            bail!("{role}.file_dir is required");
        }

        if self.clients == 0 {
            bail!("{role}.clients must be positive");
        }

        if self.workers_per_client == 0 {
            bail!("{role}.workers_per_client must be positive");
        }

        if self.handler_chan_size == 0 {
            bail!("{role}.handler_chan_size must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        let mut cfg = Config::default();
        cfg.source.url = "mem://src".to_string();
        cfg.source.bucket = "beer-sample".to_string();
        cfg.target.url = "mem://tgt".to_string();
        cfg.target.bucket = "beer-sample".to_string();
        cfg
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.source.clients, 4);
        assert_eq!(cfg.source.workers_per_client, 256);
        assert_eq!(cfg.source.handler_chan_size, 1000);
        assert_eq!(cfg.capture.n_bins, 10);
        assert_eq!(cfg.capture.n_fd, 500);
        assert!(cfg.capture.complete_by_seqno);
        assert_eq!(cfg.checkpoint.interval, Duration::from_secs(600));
        assert_eq!(cfg.stats.bucket_op_timeout, Duration::from_secs(20));
        assert_eq!(cfg.source.file_dir, PathBuf::from("source"));
        assert_eq!(cfg.target.file_dir, PathBuf::from("target"));
    }

    #[test]
    fn test_minimal_config_validates() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_validation_missing_source_url() {
        let mut cfg = minimal();
        cfg.source.url.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("source.url"));
    }

    #[test]
    fn test_validation_missing_target_bucket() {
        let mut cfg = minimal();
        cfg.target.bucket.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("target.bucket"));
    }

    #[test]
    fn test_validation_zero_bins() {
        let mut cfg = minimal();
        cfg.capture.n_bins = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("n_bins"));
    }

    #[test]
    fn test_validation_zero_workers() {
        let mut cfg = minimal();
        cfg.source.workers_per_client = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("workers_per_client"));
    }

    #[test]
    fn test_yaml_round_trip_with_durations() {
        let yaml = r#"
source:
  url: mem://src
  bucket: b
target:
  url: mem://tgt
  bucket: b
capture:
  n_bins: 4
  complete_by_duration: 5m
checkpoint:
  interval: 30s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.capture.n_bins, 4);
        assert_eq!(cfg.capture.complete_by_duration, Duration::from_secs(300));
        assert_eq!(cfg.checkpoint.interval, Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }
}
