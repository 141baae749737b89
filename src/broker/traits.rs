use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One message received from the broker.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: Arc<str>,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
}

/// Exclusive read responsibility for one partition.
///
/// Records come out in partition order. Acknowledging a record tells the
/// broker it may commit past it.
#[async_trait]
pub trait Claim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Next record, or `None` once the claim is revoked or the broker closes.
    async fn next_record(&mut self) -> Option<Record>;

    fn mark_acknowledged(&self, record: &Record) -> Result<(), BrokerError>;
}

/// Subscription that hands out one [`Claim`] per assigned partition.
#[async_trait]
pub trait ClaimStream: Send {
    type Claim: Claim + 'static;

    /// Next newly assigned claim; `None` when the subscription has ended.
    async fn next_claim(&mut self) -> Result<Option<Self::Claim>, BrokerError>;

    /// Flush pending acknowledgments before the process exits.
    async fn shutdown(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("offset {offset} on {topic}/{partition} acknowledged twice")]
    AlreadyAcknowledged {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("{topic}/{partition} was revoked from this claim")]
    Revoked { topic: String, partition: i32 },

    #[error("broker closed")]
    Closed,

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
