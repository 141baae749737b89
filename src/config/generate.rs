pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# CLICKSINK CONFIGURATION
# =============================================================================
# Consumes JSON log envelopes from Kafka, extracts fields from the log line
# with a regular expression and writes them in batches into ClickHouse (or an
# embedded DuckDB file).
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ./config.yaml
#   3. ~/.config/clicksink/config.yml
#   4. /etc/clicksink/config.yml
#
# Any value may reference an environment variable with $env{NAME}.

# =============================================================================
# KAFKA
# =============================================================================
kafka:
  host: localhost
  port: 9092
  consumer:
    group-id: clicksink
    # Where to start when the group has no committed offset: earliest | latest
    offset-reset: earliest
  # Extra librdkafka properties, applied verbatim
  properties: {}
    # security.protocol: SASL_PLAINTEXT
    # sasl.mechanisms: PLAIN
    # sasl.username: $env{KAFKA_USER}
    # sasl.password: $env{KAFKA_PASSWORD}

topic:
  - nginx-access

# =============================================================================
# SINK (configure exactly one of clickhouse / duckdb)
# =============================================================================
clickhouse:
  host: localhost
  # HTTP interface port
  port: 8123
  username: default
  password: ""
  database: default
  tls: false
  timeout: 30s

# duckdb:
#   path: ~/clicksink.duckdb

# Target table and its columns, in insert order
sink: access_log
fields: ip, time, request, status, bytes

# =============================================================================
# EXTRACTION
# =============================================================================
# JSON field of the Kafka message holding the raw log line. Messages without
# it are skipped.
log-field: log

# Capture groups are assigned, in order, to the names in pattern-index. Other
# top-level JSON fields of the message are available as columns too.
pattern: '^(\S+) - - \[([^]]+)] "([^"]*)" (\d+) (\d+)'
pattern-index: [ip, time, request, status, bytes]

errors:
  # A log line the pattern does not match: fail (stop the process) | drop
  on-pattern-mismatch: fail

# =============================================================================
# BATCHING
# =============================================================================
batch:
  # Flush as soon as this many records are buffered
  size: 1000
  # ... or when this much time passed since the last flush attempt
  timeout: 2s

# =============================================================================
# DEBUG ECHO
# =============================================================================
# When enabled every extracted record is printed, colored by its 'level' field.
debug: false
output:
  format: '${time} ${ip} "${request}" ${status}'
"#
    .to_string()
}
