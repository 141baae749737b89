use async_trait::async_trait;

/// Transactional columnar store shared by every claim loop.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError>;

    /// Verify the store is reachable.
    async fn ping(&self) -> Result<(), SinkError>;

    /// Human-readable location, for logs.
    fn target(&self) -> String;
}

/// An open transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait SinkTransaction: Send {
    async fn prepare<'a>(
        &'a mut self,
        sql: &str,
    ) -> Result<Box<dyn SinkStatement + 'a>, SinkError>;

    async fn commit(self: Box<Self>) -> Result<(), SinkError>;
}

#[async_trait]
pub trait SinkStatement: Send {
    async fn execute(&mut self, values: &[String]) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("clickhouse returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("row has {found} values, expected {expected}")]
    Arity { expected: usize, found: usize },

    #[error("unsupported statement: {0}")]
    Statement(String),

    #[error("transaction was aborted")]
    Aborted,

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
