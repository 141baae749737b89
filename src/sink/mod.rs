pub mod clickhouse;
pub mod duckdb;
#[cfg(test)]
pub(crate) mod testing;
pub mod traits;
pub mod writer;

pub use self::clickhouse::ClickHouseSink;
pub use self::duckdb::DuckDbSink;
pub use traits::{Sink, SinkError, SinkStatement, SinkTransaction};
pub use writer::{insert_statement, SinkWriter};

use crate::config::SinkTarget;
use std::sync::Arc;

/// Build the configured sink. Does not check connectivity; see [`Sink::ping`].
pub fn open_sink(target: &SinkTarget) -> Result<Arc<dyn Sink>, SinkError> {
    Ok(match target {
        SinkTarget::ClickHouse(config) => Arc::new(ClickHouseSink::new(config)?),
        SinkTarget::DuckDb(config) => Arc::new(DuckDbSink::open(&config.path)?),
    })
}
