//! Kafka log lines in, regex-extracted rows out, written to ClickHouse or
//! DuckDB in transactional batches with at-least-once delivery.

pub mod batch;
pub mod broker;
pub mod cli;
pub mod config;
pub mod echo;
pub mod extract;
pub mod pipeline;
pub mod sink;
