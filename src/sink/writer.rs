use super::traits::{Sink, SinkError};
use crate::batch::Batch;
use std::sync::Arc;
use tracing::debug;

/// Writes whole batches to the sink, one transaction per batch.
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn Sink>,
    statement: String,
    width: usize,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn Sink>, table: &str, columns: &[String]) -> Self {
        Self {
            sink,
            statement: insert_statement(table, columns),
            width: columns.len(),
        }
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn target(&self) -> String {
        self.sink.target()
    }

    /// Write every row of `batch` atomically. Returns the row count.
    ///
    /// On error nothing from the batch is visible in the sink.
    pub async fn write(&self, batch: &Batch<'_>) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        if let Some(row) = batch.rows.iter().find(|row| row.len() != self.width) {
            return Err(SinkError::Arity {
                expected: self.width,
                found: row.len(),
            });
        }

        let mut tx = self.sink.begin().await?;
        {
            let mut statement = tx.prepare(&self.statement).await?;
            for row in &batch.rows {
                statement.execute(row).await?;
            }
        }
        tx.commit().await?;

        debug!(batch_id = %batch.id, rows = batch.len(), "Transaction committed");
        Ok(batch.len())
    }
}

/// `INSERT INTO <table> (<c1>, ...) VALUES (?, ...)` with one placeholder per column.
pub fn insert_statement(table: &str, columns: &[String]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders
    )
}
