//! In-process broker with the same claim/acknowledge contract as Kafka.
//!
//! Used by the test suite and for running a pipeline without a cluster.
//! Every acknowledgment is recorded so callers can check exactly which
//! offsets would have been committed.

use super::traits::{BrokerError, Claim, ClaimStream, Record};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type AckLog = Arc<Mutex<Vec<i64>>>;

pub struct MemoryBroker {
    claims: mpsc::UnboundedReceiver<MemoryClaim>,
}

/// Assigns partitions to a [`MemoryBroker`]. Dropping every handle ends the
/// claim stream.
#[derive(Clone)]
pub struct MemoryBrokerHandle {
    claims: mpsc::UnboundedSender<MemoryClaim>,
}

impl MemoryBroker {
    pub fn new() -> (Self, MemoryBrokerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { claims: rx }, MemoryBrokerHandle { claims: tx })
    }
}

impl MemoryBrokerHandle {
    /// Hand a new partition claim to the broker and return its producer side.
    pub fn assign(&self, topic: &str, partition: i32) -> Result<MemoryPartition, BrokerError> {
        let (producer, claim) = MemoryPartition::new(topic, partition);
        self.claims.send(claim).map_err(|_| BrokerError::Closed)?;
        Ok(producer)
    }
}

#[async_trait]
impl ClaimStream for MemoryBroker {
    type Claim = MemoryClaim;

    async fn next_claim(&mut self) -> Result<Option<MemoryClaim>, BrokerError> {
        Ok(self.claims.recv().await)
    }
}

/// Producer side of one in-memory partition.
pub struct MemoryPartition {
    topic: Arc<str>,
    partition: i32,
    next_offset: i64,
    records: mpsc::UnboundedSender<Record>,
    acknowledged: AckLog,
}

impl MemoryPartition {
    /// Create a standalone partition and the claim that reads it.
    pub fn new(topic: &str, partition: i32) -> (MemoryPartition, MemoryClaim) {
        let topic: Arc<str> = Arc::from(topic);
        let (tx, rx) = mpsc::unbounded_channel();
        let acknowledged = AckLog::default();

        let producer = MemoryPartition {
            topic: topic.clone(),
            partition,
            next_offset: 0,
            records: tx,
            acknowledged: acknowledged.clone(),
        };
        let claim = MemoryClaim {
            topic,
            partition,
            records: rx,
            acknowledged,
        };
        (producer, claim)
    }

    /// Append a payload and return the offset it was assigned.
    pub fn send(&mut self, payload: impl Into<Vec<u8>>) -> Result<i64, BrokerError> {
        let offset = self.next_offset;
        let record = Record {
            topic: self.topic.clone(),
            partition: self.partition,
            offset,
            timestamp: Some(Utc::now()),
            payload: payload.into(),
        };
        self.records.send(record).map_err(|_| BrokerError::Closed)?;
        self.next_offset += 1;
        Ok(offset)
    }

    /// Offsets acknowledged so far, in acknowledgment order.
    pub fn acknowledged(&self) -> Vec<i64> {
        self.acknowledged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct MemoryClaim {
    topic: Arc<str>,
    partition: i32,
    records: mpsc::UnboundedReceiver<Record>,
    acknowledged: AckLog,
}

#[async_trait]
impl Claim for MemoryClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_record(&mut self) -> Option<Record> {
        self.records.recv().await
    }

    fn mark_acknowledged(&self, record: &Record) -> Result<(), BrokerError> {
        let mut acknowledged = self
            .acknowledged
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if acknowledged.contains(&record.offset) {
            return Err(BrokerError::AlreadyAcknowledged {
                topic: record.topic.to_string(),
                partition: record.partition,
                offset: record.offset,
            });
        }
        acknowledged.push(record.offset);
        Ok(())
    }
}
