use super::parse::{split_columns, validate_config, ConfigError};
use super::types::{
    BatchConfig, ClickHouseConfig, Config, DuckDbConfig, MismatchStrategy, OffsetReset,
};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which store the pipeline writes into.
#[derive(Debug, Clone)]
pub enum SinkTarget {
    ClickHouse(ClickHouseConfig),
    DuckDb(DuckDbConfig),
}

impl SinkTarget {
    /// Short human description of the sink; matches [`Sink::target`].
    ///
    /// [`Sink::target`]: crate::sink::Sink::target
    pub fn describe(&self) -> String {
        match self {
            SinkTarget::ClickHouse(ch) => ch.target(),
            SinkTarget::DuckDb(db) => db.target(),
        }
    }
}

/// Immutable runtime configuration.
///
/// Built once at startup from a validated [`Config`]. Everything derived from
/// the raw file (compiled pattern, column list) is computed here, so nothing
/// downstream re-parses or caches lazily.
#[derive(Debug, Clone)]
pub struct Settings {
    pub brokers: String,
    pub group_id: String,
    pub offset_reset: OffsetReset,
    pub kafka_properties: BTreeMap<String, String>,
    pub topics: Vec<String>,
    pub sink: SinkTarget,
    pub table: String,
    pub columns: Arc<[String]>,
    pub log_field: String,
    pub pattern: Regex,
    pub pattern_index: Vec<String>,
    pub on_pattern_mismatch: MismatchStrategy,
    /// Per-record echo template, present only when `debug` is on.
    pub echo_template: Option<String>,
    pub batch: BatchConfig,
}

impl Settings {
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        validate_config(&config)?;

        let sink = match (config.clickhouse, config.duckdb) {
            (Some(clickhouse), None) => SinkTarget::ClickHouse(clickhouse),
            (None, Some(duckdb)) => SinkTarget::DuckDb(duckdb),
            _ => {
                return Err(ConfigError::Validation(
                    "exactly one of 'clickhouse' or 'duckdb' must be configured".to_string(),
                ))
            }
        };

        let pattern = Regex::new(&config.pattern)?;
        let columns: Arc<[String]> = split_columns(&config.fields).into();

        Ok(Self {
            brokers: format!("{}:{}", config.kafka.host, config.kafka.port),
            group_id: config.kafka.consumer.group_id,
            offset_reset: config.kafka.consumer.offset_reset,
            kafka_properties: config.kafka.properties,
            topics: config.topic,
            sink,
            table: config.sink,
            columns,
            log_field: config.log_field,
            pattern,
            pattern_index: config.pattern_index,
            on_pattern_mismatch: config.errors.on_pattern_mismatch,
            echo_template: config.debug.then_some(config.output.format),
            batch: config.batch,
        })
    }

    /// Short human description of the sink, used in log lines.
    pub fn sink_description(&self) -> String {
        self.sink.describe()
    }
}
