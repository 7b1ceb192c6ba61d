//! Configuration management for the restore agent.
//!
//! Loads configuration from a TOML file with `IOTDB_RESTORE_*` environment
//! variable overrides (`__` separates nested keys, e.g.
//! `IOTDB_RESTORE_IMPORT__BATCH_SIZE=10`). Command-line overrides are applied
//! on top by `main`.

use crate::utils::{RestoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "IOTDB_RESTORE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kubernetes: KubeConfig,
    pub iotdb: IotdbConfig,
    pub backup: BackupConfig,
    pub download: DownloadConfig,
    pub import: ImportConfig,
    pub notification: NotificationConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    /// API server URL. When empty, `kubeconfig`, in-cluster settings and
    /// `~/.kube/config` are tried in that order.
    pub api_server: String,

    /// Kubeconfig file (`~` is expanded)
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context; the file's current context when unset
    pub context: Option<String>,

    /// Namespace of the IoTDB pod
    pub namespace: String,

    /// Pod to exec into. Also the identifier embedded in backup file names.
    pub pod_name: String,

    /// Container to exec into. When unset, the pod's first container is used.
    pub container: Option<String>,

    /// Bearer token (takes precedence over `token_file`)
    pub token: Option<String>,

    /// File holding the bearer token
    pub token_file: Option<PathBuf>,

    /// PEM bundle used to verify the API server
    pub ca_cert: Option<PathBuf>,

    pub insecure_skip_tls_verify: bool,

    /// Deadline for a single remote command, in seconds
    pub exec_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IotdbConfig {
    /// Directory the backup archive is extracted into
    pub data_dir: String,

    /// Path of the IoTDB CLI inside the pod
    pub cli_path: String,

    /// Host passed to the CLI with `-h`
    pub host: String,

    /// Databases dropped before import unless `--skip-delete` is given
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Base URL of the artifact store
    pub base_url: String,

    /// Local staging directory for downloaded archives
    pub download_dir: PathBuf,

    /// Staging directory for the archive inside the pod
    pub remote_dir: String,

    /// Probe the store for this hour's backup when no timestamp is given
    pub auto_detect_timestamp: bool,

    /// Custom detection pattern, e.g. `{hour}35*`
    pub timestamp_pattern: Option<String>,

    /// Minute the backup producer writes at
    pub detect_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
}

/// How a load command's outcome is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCheck {
    /// Output must mention "success" (case-insensitive)
    OutputMarker,
    /// A zero exit status is enough
    ExitStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Maximum concurrent load commands
    pub concurrency: usize,

    /// Files per batch
    pub batch_size: usize,

    /// Pause between batches, in seconds
    pub batch_delay_secs: u64,

    /// Whether to pause between batches at all
    pub batch_pause: bool,

    pub success_check: SuccessCheck,

    /// Log the pod's available memory before each batch (debug level)
    pub log_memory: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,

    /// Environment label shown in notifications
    pub environment: String,

    pub wechat: WechatConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WechatConfig {
    pub webhook_url: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

// Default values
fn default_exec_timeout_secs() -> u64 {
    30 * 60
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_data_dir() -> String {
    "/iotdb/data".to_string()
}

fn default_cli_path() -> String {
    "/iotdb/sbin/start-cli.sh".to_string()
}

fn default_iotdb_host() -> String {
    "iotdb-datanode".to_string()
}

fn default_databases() -> Vec<String> {
    vec!["root.emsplus".to_string(), "root.energy".to_string()]
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_remote_dir() -> String {
    "/tmp".to_string()
}

fn default_detect_minute() -> u32 {
    35
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_download_timeout_secs() -> u64 {
    30 * 60
}

fn default_concurrency() -> usize {
    1
}

fn default_batch_size() -> usize {
    3
}

fn default_batch_delay_secs() -> u64 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_server: String::new(),
            kubeconfig: None,
            context: None,
            namespace: default_namespace(),
            pod_name: String::new(),
            container: None,
            token: None,
            token_file: None,
            ca_cert: None,
            insecure_skip_tls_verify: false,
            exec_timeout_secs: default_exec_timeout_secs(),
        }
    }
}

impl Default for IotdbConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cli_path: default_cli_path(),
            host: default_iotdb_host(),
            databases: default_databases(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            download_dir: default_download_dir(),
            remote_dir: default_remote_dir(),
            auto_detect_timestamp: true,
            timestamp_pattern: None,
            detect_minute: default_detect_minute(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            batch_delay_secs: default_batch_delay_secs(),
            batch_pause: true,
            success_check: SuccessCheck::OutputMarker,
            log_memory: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl KubeConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }
}

impl DownloadConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ImportConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.batch_delay_secs)
    }
}

impl Config {
    /// Load configuration from a file (or the default search locations when
    /// `path` is `None`) layered under environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder
                .add_source(config::File::with_name("/etc/iotdb-restore/config").required(false))
                .add_source(config::File::with_name("configs/config").required(false))
                .add_source(config::File::with_name("config").required(false)),
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RestoreError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| RestoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment layering)
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RestoreError::Config(e.to_string()))
    }

    /// Render the resolved configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RestoreError::Config(e.to_string()))
    }

    /// Reject values the restore pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.kubernetes.pod_name.trim().is_empty() {
            return Err(RestoreError::Config("kubernetes.pod_name must be set".into()));
        }
        if self.backup.base_url.trim().is_empty() {
            return Err(RestoreError::Config("backup.base_url must be set".into()));
        }
        if self.import.concurrency == 0 {
            return Err(RestoreError::Config("import.concurrency must be at least 1".into()));
        }
        if self.import.batch_size == 0 {
            return Err(RestoreError::Config("import.batch_size must be at least 1".into()));
        }
        if self.download.max_retries == 0 {
            return Err(RestoreError::Config("download.max_retries must be at least 1".into()));
        }
        if self.backup.detect_minute > 59 {
            return Err(RestoreError::Config("backup.detect_minute must be within 0-59".into()));
        }
        if self.notification.enabled
            && self.notification.wechat.enabled
            && self.notification.wechat.webhook_url.trim().is_empty()
        {
            return Err(RestoreError::Config(
                "notification.wechat.webhook_url must be set when WeChat notification is enabled".into(),
            ));
        }
        Ok(())
    }
}
