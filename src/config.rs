use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Offset, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

use crate::sample::FieldMapping;
use crate::sink::chunk::ChunkPolicy;
use crate::sink::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

/// Configuration of one collection agent (one YAML file).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Ingestion endpoint and batching configuration.
    pub delivery: DeliveryConfig,

    /// Upstream source configuration.
    pub source: SourceConfig,

    /// Label-to-instance mapping rules.
    #[serde(default)]
    pub fields: FieldsConfig,

    /// Instance alias cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Historical range to replay instead of polling the current time.
    #[serde(default)]
    pub history: Option<HistoryRange>,
}

/// Ingestion endpoint and batching configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub user_name: String,
    pub license_key: String,
    pub project_name: String,

    /// Project type, e.g. "metric" or "metricreplay". Default: metric.
    #[serde(default)]
    pub project_type: ProjectType,

    /// Metric resolution. Required for metric projects.
    #[serde(default, with = "humantime_serde")]
    pub sampling_interval: Option<Duration>,

    /// Maximum serialized chunk size in KiB. Default: 2048.
    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: usize,

    /// Maximum rows per chunk. Default depends on the source.
    #[serde(default)]
    pub chunk_rows: Option<usize>,

    /// Base URL of the ingestion service.
    #[serde(default = "default_delivery_url")]
    pub url: String,

    /// Reported instance name. Default: the short hostname.
    #[serde(default)]
    pub instance_name: Option<String>,

    #[serde(default)]
    pub http_proxy: Option<String>,

    #[serde(default)]
    pub https_proxy: Option<String>,

    /// Per-attempt request timeout. Default: 30s.
    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Attempts per chunk before giving up. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Request body encoding. Default: form.
    #[serde(default)]
    pub encoding: PayloadEncoding,

    /// Request body compression. Default: none.
    #[serde(default)]
    pub compression: Compression,
}

/// Request body encoding for delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Form,
    Json,
}

/// Request body compression for delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// Label-to-instance mapping rules.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldsConfig {
    /// Candidate instance labels. Default depends on the source.
    #[serde(default)]
    pub instance_field: Vec<String>,

    /// Candidate device labels. Default depends on the source.
    #[serde(default)]
    pub device_field: Vec<String>,

    /// Labels joined with `_` to build metric names.
    #[serde(default)]
    pub metrics_name_field: Vec<String>,

    #[serde(default)]
    pub component_field: Option<String>,

    /// Regex the raw instance must match from its first character.
    #[serde(default)]
    pub instance_whitelist: Option<String>,

    /// Timezone whose current UTC offset is added to every timestamp.
    #[serde(default = "default_timezone")]
    pub target_timestamp_timezone: String,
}

impl Default for FieldsConfig {
    fn default() -> Self {
        Self {
            instance_field: Vec::new(),
            device_field: Vec::new(),
            metrics_name_field: Vec::new(),
            component_field: None,
            instance_whitelist: None,
            target_timestamp_timezone: default_timezone(),
        }
    }
}

/// Instance alias cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SQLite file. Relative paths resolve against the config file's
    /// directory. Default: cache.db.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_cache_path(),
        }
    }
}

/// Half-open `[start, end)` replay range.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HistoryRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// --- Project type ---

/// Kind of data the target project ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Metric,
    Log,
    Incident,
    Alert,
    Deployment,
}

/// Project kind plus whether data is replayed history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ProjectType {
    pub kind: ProjectKind,
    pub replay: bool,
}

impl Default for ProjectType {
    fn default() -> Self {
        Self {
            kind: ProjectKind::Metric,
            replay: false,
        }
    }
}

impl ProjectType {
    pub fn is_metric(&self) -> bool {
        self.kind == ProjectKind::Metric
    }

    /// Agent type reported in every envelope.
    pub fn agent_type(&self) -> &'static str {
        match (self.kind, self.replay) {
            (ProjectKind::Metric, true) => "MetricFileReplay",
            (ProjectKind::Metric, false) => "CUSTOM",
            (_, true) => "LogFileReplay",
            (_, false) => "LogStreaming",
        }
    }

    /// Endpoint path, relative to the delivery base URL.
    pub fn api_path(&self) -> &'static str {
        match self.kind {
            ProjectKind::Incident => "incidentdatareceive",
            ProjectKind::Deployment => "deploymentEventReceive",
            _ => "customprojectrawdata",
        }
    }
}

impl FromStr for ProjectType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let (base, replay) = match upper.strip_suffix("REPLAY") {
            Some(base) => (base, true),
            None => (upper.as_str(), false),
        };

        let kind = match base {
            "METRIC" => ProjectKind::Metric,
            "LOG" => ProjectKind::Log,
            "INCIDENT" => ProjectKind::Incident,
            "ALERT" => ProjectKind::Alert,
            "DEPLOYMENT" => ProjectKind::Deployment,
            _ => bail!("unknown project type: {s}"),
        };

        Ok(Self { kind, replay })
    }
}

impl TryFrom<String> for ProjectType {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.kind {
            ProjectKind::Metric => "METRIC",
            ProjectKind::Log => "LOG",
            ProjectKind::Incident => "INCIDENT",
            ProjectKind::Alert => "ALERT",
            ProjectKind::Deployment => "DEPLOYMENT",
        };
        if self.replay {
            write!(f, "{base}REPLAY")
        } else {
            f.write_str(base)
        }
    }
}

// --- Sources ---

/// Upstream source, selected by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Prometheus(PrometheusConfig),
    Sysdig(SysdigConfig),
    Zabbix(ZabbixConfig),
    Nfdump(NfdumpConfig),
}

impl SourceConfig {
    fn default_instance_fields(&self) -> Vec<String> {
        let field = match self {
            Self::Prometheus(_) => "instance",
            Self::Sysdig(_) => "container.name",
            Self::Zabbix(_) => "host",
            Self::Nfdump(_) => "flow",
        };
        vec![field.to_string()]
    }

    fn default_device_fields(&self) -> Vec<String> {
        match self {
            Self::Sysdig(_) => vec!["host.hostName".to_string()],
            _ => Vec::new(),
        }
    }

    /// Zabbix item lists are large and cheap per row, so it batches more.
    fn default_chunk_rows(&self) -> usize {
        match self {
            Self::Zabbix(_) => 1000,
            _ => crate::sink::chunk::DEFAULT_MAX_ROWS,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Prometheus(c) => {
                if c.uri.is_empty() {
                    bail!("source.uri is required");
                }
                if c.thread_pool == 0 {
                    bail!("source.thread_pool must be positive");
                }
                for (name, pattern) in [
                    ("metrics_whitelist", &c.metrics_whitelist),
                    ("metrics_whitelist_with_function", &c.metrics_whitelist_with_function),
                ] {
                    if let Some(p) = pattern {
                        anchored(p).with_context(|| format!("source.{name} is not a valid regex"))?;
                    }
                }
            }
            Self::Sysdig(c) => {
                if c.api_key.is_empty() {
                    bail!("source.api_key is required");
                }
                if c.metrics.is_empty() {
                    bail!("source.metrics must not be empty");
                }
            }
            Self::Zabbix(c) => {
                if c.url.is_empty() {
                    bail!("source.url is required");
                }
                if c.password.is_empty() {
                    bail!("source.password is required");
                }
            }
            Self::Nfdump(c) => {
                if c.profile_path.as_os_str().is_empty() {
                    bail!("source.profile_path is required");
                }
                if c.channels.is_empty() {
                    bail!("source.channels must not be empty");
                }
                if c.file_interval.is_zero() {
                    bail!("source.file_interval must be positive");
                }
                c.timezone
                    .parse::<Tz>()
                    .map_err(|e| anyhow::anyhow!("source.timezone: {e}"))?;
            }
        }
        Ok(())
    }
}

/// Prometheus query API source.
#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    /// Server base URI, e.g. "http://localhost:9090".
    pub uri: String,

    /// Metrics to query. Empty means discover every metric name.
    #[serde(default)]
    pub metrics: Vec<String>,

    #[serde(default)]
    pub metrics_whitelist: Option<String>,

    #[serde(default)]
    pub metrics_to_ignore: Vec<String>,

    /// Appended to each metric name, e.g. `{job="node"}`.
    #[serde(default)]
    pub query_label_selector: String,

    #[serde(default)]
    pub query_with_function: Option<QueryFunction>,

    /// Metrics the function applies to. Default: all.
    #[serde(default)]
    pub metrics_whitelist_with_function: Option<String>,

    /// Concurrent queries. Default: 20.
    #[serde(default = "default_thread_pool")]
    pub thread_pool: usize,

    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub http_proxy: Option<String>,

    #[serde(default)]
    pub https_proxy: Option<String>,
}

/// Range function wrapped around each query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFunction {
    Increase,
}

/// Sysdig data API source.
#[derive(Debug, Clone, Deserialize)]
pub struct SysdigConfig {
    #[serde(default = "default_sysdig_url")]
    pub url: String,

    pub api_key: String,

    /// Restricts data to one host name.
    #[serde(default)]
    pub host_filter: Option<String>,

    #[serde(default = "default_sysdig_metrics")]
    pub metrics: Vec<String>,

    /// Look-back window for live fetches. Default: 10m.
    #[serde(default = "default_sysdig_window", with = "humantime_serde")]
    pub window: Duration,

    /// Aggregation resolution. Default: 1m.
    #[serde(default = "default_sysdig_sampling", with = "humantime_serde")]
    pub sampling: Duration,

    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub http_proxy: Option<String>,

    #[serde(default)]
    pub https_proxy: Option<String>,
}

/// Zabbix JSON-RPC source.
#[derive(Debug, Clone, Deserialize)]
pub struct ZabbixConfig {
    /// API endpoint, e.g. "http://zabbix/api_jsonrpc.php".
    pub url: String,

    #[serde(default = "default_zabbix_user")]
    pub user: String,

    pub password: String,

    #[serde(default)]
    pub host_groups: Vec<String>,

    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub applications: Vec<String>,

    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub http_proxy: Option<String>,

    #[serde(default)]
    pub https_proxy: Option<String>,
}

/// nfdump flow capture source.
#[derive(Debug, Clone, Deserialize)]
pub struct NfdumpConfig {
    #[serde(default = "default_nfdump_command")]
    pub command: String,

    /// Profile directory passed to `-M`.
    pub profile_path: PathBuf,

    /// Channel subdirectories joined with `:` after the profile path.
    pub channels: Vec<String>,

    /// Capture file rotation interval. Default: 5m.
    #[serde(default = "default_file_interval", with = "humantime_serde")]
    pub file_interval: Duration,

    /// Timezone of capture file names and CSV timestamps. Default: UTC.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// CSV column holding the flow timestamp. Default: "te".
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
}

// --- Defaults ---

fn default_chunk_size_kb() -> usize {
    2048
}

fn default_delivery_url() -> String {
    "https://app.insightfinder.com".to_string()
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("cache.db")
}

fn default_thread_pool() -> usize {
    20
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sysdig_url() -> String {
    "https://app.sysdigcloud.com".to_string()
}

fn default_sysdig_metrics() -> Vec<String> {
    vec![
        "cpu.used.percent".to_string(),
        "memory.used.percent".to_string(),
    ]
}

fn default_sysdig_window() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_sysdig_sampling() -> Duration {
    Duration::from_secs(60)
}

fn default_zabbix_user() -> String {
    "Admin".to_string()
}

fn default_nfdump_command() -> String {
    "nfdump".to_string()
}

fn default_file_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_timestamp_column() -> String {
    "te".to_string()
}

/// Compiles `pattern` so it only matches from the start of the input.
pub fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})")).with_context(|| format!("invalid regex {pattern:?}"))
}

/// Current UTC offset of the named timezone, in milliseconds.
pub fn timezone_offset_ms(name: &str) -> Result<i64> {
    let tz: Tz = name
        .parse()
        .map_err(|e| anyhow::anyhow!("unknown timezone {name:?}: {e}"))?;
    let offset = Utc::now().with_timezone(&tz).offset().fix();
    Ok(i64::from(offset.local_minus_utc()) * 1000)
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Relative cache paths are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        if cfg.cache.path.is_relative() {
            if let Some(dir) = path.parent() {
                cfg.cache.path = dir.join(&cfg.cache.path);
            }
        }

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let d = &self.delivery;

        if d.user_name.is_empty() {
            bail!("delivery.user_name is required");
        }

        if d.license_key.is_empty() {
            bail!("delivery.license_key is required");
        }

        if d.project_name.is_empty() {
            bail!("delivery.project_name is required");
        }

        if d.project_type.is_metric() && d.sampling_interval.map_or(true, |s| s.is_zero()) {
            bail!("delivery.sampling_interval is required for metric projects");
        }

        if d.chunk_size_kb == 0 {
            bail!("delivery.chunk_size_kb must be positive");
        }

        if d.chunk_rows == Some(0) {
            bail!("delivery.chunk_rows must be positive");
        }

        if d.max_attempts == 0 {
            bail!("delivery.max_attempts must be positive");
        }

        url::Url::parse(&d.url).with_context(|| format!("delivery.url is invalid: {}", d.url))?;

        self.source.validate()?;

        if let Some(ref pattern) = self.fields.instance_whitelist {
            anchored(pattern).context("fields.instance_whitelist is not a valid regex")?;
        }

        timezone_offset_ms(&self.fields.target_timestamp_timezone)
            .context("fields.target_timestamp_timezone")?;

        if let Some(range) = self.history {
            if range.start >= range.end {
                bail!("history.start must be before history.end");
            }
        }

        Ok(())
    }

    /// Sampling interval, falling back to 10s for non-metric projects.
    pub fn sampling_interval(&self) -> Duration {
        self.delivery
            .sampling_interval
            .filter(|s| !s.is_zero())
            .unwrap_or(Duration::from_secs(10))
    }

    pub fn chunk_policy(&self) -> ChunkPolicy {
        ChunkPolicy {
            max_rows: self
                .delivery
                .chunk_rows
                .unwrap_or_else(|| self.source.default_chunk_rows()),
            max_bytes: self.delivery.chunk_size_kb * 1024,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.delivery.max_attempts,
        }
    }

    /// Builds the normalizer field mapping, filling in source defaults.
    pub fn field_mapping(&self) -> Result<FieldMapping> {
        let f = &self.fields;

        let instance_fields = if f.instance_field.is_empty() {
            self.source.default_instance_fields()
        } else {
            f.instance_field.clone()
        };

        let device_fields = if f.device_field.is_empty() {
            self.source.default_device_fields()
        } else {
            f.device_field.clone()
        };

        let instance_whitelist = f.instance_whitelist.as_deref().map(anchored).transpose()?;

        Ok(FieldMapping {
            instance_fields,
            device_fields,
            metric_name_fields: f.metrics_name_field.clone(),
            component_field: f.component_field.clone(),
            instance_whitelist,
            offset_ms: timezone_offset_ms(&f.target_timestamp_timezone)?,
        })
    }
}
