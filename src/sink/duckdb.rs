use super::traits::{Sink, SinkError, SinkStatement, SinkTransaction};
use crate::config::types::duckdb_target;
use async_trait::async_trait;
use duckdb::{params_from_iter, Connection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Embedded DuckDB sink.
///
/// DuckDB allows one open transaction per connection, so transactions from
/// different claim loops are serialized on the connection lock.
pub struct DuckDbSink {
    conn: Arc<Mutex<Connection>>,
    target: String,
}

impl DuckDbSink {
    /// Open (or create) a database file.
    ///
    /// A write-ahead log left by a crash is replayed by DuckDB on open; it
    /// holds committed batches whose offsets may already be published.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to open DuckDB database");
            e
        })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            target: duckdb_target(path),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            target: "duckdb://:memory:".to_string(),
        })
    }

    /// Run one or more statements outside any sink transaction.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), SinkError> {
        let guard = self.conn.clone().lock_owned().await;
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || guard.execute_batch(&sql)).await??;
        Ok(())
    }

    /// Every row of a query, with each column read as text.
    pub async fn query_strings(&self, sql: &str) -> Result<Vec<Vec<String>>, SinkError> {
        let guard = self.conn.clone().lock_owned().await;
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stmt = guard.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let width = rows.as_ref().map(|s| s.column_count()).unwrap_or(0);

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let values = (0..width)
                    .map(|i| row.get::<_, Option<String>>(i).map(Option::unwrap_or_default))
                    .collect::<Result<Vec<_>, _>>()?;
                out.push(values);
            }
            Ok::<_, duckdb::Error>(out)
        })
        .await?
        .map_err(SinkError::from)
    }
}

#[async_trait]
impl Sink for DuckDbSink {
    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError> {
        let mut tx = DuckDbTransaction {
            conn: Some(self.conn.clone().lock_owned().await),
            open: false,
        };
        tx.run(|conn| conn.execute_batch("BEGIN TRANSACTION")).await?;
        tx.open = true;
        Ok(Box::new(tx))
    }

    async fn ping(&self) -> Result<(), SinkError> {
        self.execute_batch("SELECT 1").await
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

/// Holds the connection lock until committed or dropped.
struct DuckDbTransaction {
    /// `None` only while a blocking call owns the guard.
    conn: Option<OwnedMutexGuard<Connection>>,
    open: bool,
}

impl DuckDbTransaction {
    async fn run<T, F>(&mut self, f: F) -> Result<T, SinkError>
    where
        F: FnOnce(&Connection) -> duckdb::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.conn.take().ok_or(SinkError::Aborted)?;
        let (guard, result) = tokio::task::spawn_blocking(move || {
            let result = f(&guard);
            (guard, result)
        })
        .await?;
        self.conn = Some(guard);
        Ok(result?)
    }
}

#[async_trait]
impl SinkTransaction for DuckDbTransaction {
    async fn prepare<'a>(
        &'a mut self,
        sql: &str,
    ) -> Result<Box<dyn SinkStatement + 'a>, SinkError> {
        let sql = sql.to_string();
        let cached = sql.clone();
        self.run(move |conn| conn.prepare_cached(&cached).map(|_| ()))
            .await?;
        Ok(Box::new(DuckDbStatement { tx: self, sql }))
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        let mut tx = self;
        tx.run(|conn| conn.execute_batch("COMMIT")).await?;
        tx.open = false;
        Ok(())
    }
}

impl Drop for DuckDbTransaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        // Drop cannot await; rollback is local to the connection
        if let Some(conn) = self.conn.as_ref() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Rollback failed");
            }
        }
    }
}

struct DuckDbStatement<'a> {
    tx: &'a mut DuckDbTransaction,
    sql: String,
}

#[async_trait]
impl SinkStatement for DuckDbStatement<'_> {
    async fn execute(&mut self, values: &[String]) -> Result<(), SinkError> {
        let sql = self.sql.clone();
        let values = values.to_vec();
        self.tx
            .run(move |conn| {
                conn.prepare_cached(&sql)?
                    .execute(params_from_iter(values.iter()))
                    .map(|_| ())
            })
            .await
    }
}
