use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Raw configuration file, as written by the operator.
///
/// This is deserialized from YAML and validated once; the pipeline only ever
/// sees the derived [`Settings`](super::Settings).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub clickhouse: Option<ClickHouseConfig>,
    #[serde(default)]
    pub duckdb: Option<DuckDbConfig>,
    pub topic: Vec<String>,
    /// Comma-separated target column list.
    pub fields: String,
    /// Target table name.
    pub sink: String,
    #[serde(default = "default_log_field")]
    pub log_field: String,
    pub pattern: String,
    #[serde(default)]
    pub pattern_index: Vec<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub errors: ErrorConfig,
}

fn default_log_field() -> String {
    "log".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KafkaConfig {
    pub host: String,
    #[serde(default = "default_kafka_port")]
    pub port: u16,
    pub consumer: ConsumerConfig,
    /// Extra librdkafka properties (SASL, TLS, tuning), applied last.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_kafka_port() -> u16 {
    9092
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConsumerConfig {
    pub group_id: String,
    #[serde(default)]
    pub offset_reset: OffsetReset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClickHouseConfig {
    pub host: String,
    #[serde(default = "default_clickhouse_port")]
    pub port: u16,
    #[serde(default = "default_clickhouse_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_clickhouse_database")]
    pub database: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_clickhouse_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl ClickHouseConfig {
    /// Display form of the endpoint, without credentials.
    pub fn target(&self) -> String {
        format!("clickhouse://{}:{}/{}", self.host, self.port, self.database)
    }
}

fn default_clickhouse_port() -> u16 {
    8123
}

fn default_clickhouse_user() -> String {
    "default".to_string()
}

fn default_clickhouse_database() -> String {
    "default".to_string()
}

fn default_clickhouse_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuckDbConfig {
    pub path: PathBuf,
}

impl DuckDbConfig {
    pub fn target(&self) -> String {
        duckdb_target(&self.path)
    }
}

/// Display form of a DuckDB database, shared by config output and sink logs.
pub fn duckdb_target(path: &Path) -> String {
    format!("duckdb://{}", path.display())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Echo template; `${name}` is replaced by the field of that name.
    #[serde(default = "default_output_format")]
    pub format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
        }
    }
}

fn default_output_format() -> String {
    "${log}".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub size: usize,
    #[serde(default = "default_batch_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            timeout: default_batch_timeout(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ErrorConfig {
    #[serde(default)]
    pub on_pattern_mismatch: MismatchStrategy,
}

/// What to do when the pattern does not match a present log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchStrategy {
    /// Stop the whole pipeline; the pattern and the data disagree.
    #[default]
    Fail,
    Drop,
}
