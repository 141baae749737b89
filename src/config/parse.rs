use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, ENV_VAR_PATTERN};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut config = parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })?;

    if let Some(duckdb) = config.duckdb.as_mut() {
        duckdb.path = expand_tilde(&duckdb.path);
    }

    Ok(config)
}

/// Parse and validate a config from a YAML string.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let config: Config = serde_yaml::from_str(&yaml)?;
    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    // Placeholders in comment lines are documentation, not values
    let mut unexpanded_vars: Vec<String> = yaml_string
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| ENV_VAR_PATTERN.captures_iter(line))
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}\n\
         \n\
         Export them before starting, or replace the $env{{...}} placeholders in the config file",
        unexpanded_vars.join(", ")
    )))
}

/// Splits the comma-separated `fields` value into trimmed column names.
pub fn split_columns(fields: &str) -> Vec<String> {
    fields.split(',').map(|it| it.trim().to_string()).collect()
}

pub(crate) fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_kafka(&config.kafka, &mut errors);
    validate_sink_target(config, &mut errors);

    if config.topic.is_empty() {
        errors.push("topic must list at least one topic".to_string());
    }
    for (i, topic) in config.topic.iter().enumerate() {
        if topic.trim().is_empty() {
            errors.push(format!("topic[{}]: topic name cannot be empty", i));
        }
    }

    if !is_table_name(&config.sink) {
        errors.push(format!(
            "sink: '{}' is not a valid table name (expected `table` or `database.table`)",
            config.sink
        ));
    }

    validate_columns(&config.fields, &mut errors);

    if config.log_field.is_empty() {
        errors.push("log-field cannot be empty".to_string());
    }

    validate_pattern(&config.pattern, &config.pattern_index, &mut errors);

    if config.batch.size == 0 {
        errors.push("batch.size must be greater than zero".to_string());
    }
    if config.batch.timeout.is_zero() {
        errors.push("batch.timeout must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_kafka(kafka: &KafkaConfig, errors: &mut Vec<String>) {
    if kafka.host.trim().is_empty() {
        errors.push("kafka.host cannot be empty".to_string());
    }
    if kafka.consumer.group_id.trim().is_empty() {
        errors.push("kafka.consumer.group-id cannot be empty".to_string());
    }
}

fn validate_sink_target(config: &Config, errors: &mut Vec<String>) {
    match (&config.clickhouse, &config.duckdb) {
        (None, None) => errors.push(
            "config must configure a sink: add a 'clickhouse' or a 'duckdb' section".to_string(),
        ),
        (Some(_), Some(_)) => errors.push(
            "only one sink may be configured: remove either 'clickhouse' or 'duckdb'".to_string(),
        ),
        (Some(clickhouse), None) => {
            if clickhouse.host.trim().is_empty() {
                errors.push("clickhouse.host cannot be empty".to_string());
            }
            if clickhouse.database.trim().is_empty() {
                errors.push("clickhouse.database cannot be empty".to_string());
            }
        }
        (None, Some(duckdb)) => {
            if duckdb.path.as_os_str().is_empty() {
                errors.push("duckdb.path cannot be empty".to_string());
            }
        }
    }
}

fn validate_columns(fields: &str, errors: &mut Vec<String>) {
    let columns = split_columns(fields);
    let mut seen = HashSet::new();

    for (i, column) in columns.iter().enumerate() {
        if column.is_empty() {
            errors.push(format!("fields: column {} is empty", i));
        } else if !is_identifier(column) {
            errors.push(format!("fields: '{}' is not a valid column name", column));
        } else if !seen.insert(column.as_str()) {
            errors.push(format!("fields: duplicate column '{}'", column));
        }
    }
}

fn validate_pattern(pattern: &str, pattern_index: &[String], errors: &mut Vec<String>) {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            errors.push(format!("pattern: invalid regex '{}': {}", pattern, e));
            return;
        }
    };

    // captures_len counts the implicit whole-match group
    let groups = re.captures_len() - 1;
    if groups < pattern_index.len() {
        errors.push(format!(
            "pattern has {} capture groups but pattern-index names {} fields",
            groups,
            pattern_index.len()
        ));
    }

    let mut seen = HashSet::new();
    for name in pattern_index {
        if name.trim().is_empty() {
            errors.push("pattern-index: field names cannot be empty".to_string());
        } else if !seen.insert(name.as_str()) {
            errors.push(format!("pattern-index: duplicate field '{}'", name));
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_table_name(name: &str) -> bool {
    match name.split_once('.') {
        Some((database, table)) => is_identifier(database) && is_identifier(table),
        None => is_identifier(name),
    }
}
