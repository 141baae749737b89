use super::traits::{BrokerError, Claim, ClaimStream, Record};
use crate::config::Settings;
use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientContext, TopicPartitionList};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

type PartitionKey = (String, i32);

/// Tracks the revocation token of every open claim and cancels it when a
/// rebalance takes the partition away.
///
/// Rebalance callbacks run inside the consumer poll, before any message from
/// the new assignment is returned.
#[derive(Default)]
pub struct ClaimRegistry {
    claims: Mutex<HashMap<PartitionKey, CancellationToken>>,
}

impl ClaimRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<PartitionKey, CancellationToken>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token for a newly opened claim. A claim still open on the same
    /// partition is revoked first.
    fn register(&self, topic: &str, partition: i32) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.lock().insert((topic.to_string(), partition), token.clone()) {
            previous.cancel();
        }
        token
    }

    fn revoke<'a>(&self, partitions: impl IntoIterator<Item = (&'a str, i32)>) -> usize {
        let mut claims = self.lock();
        let mut revoked = 0;
        for (topic, partition) in partitions {
            if let Some(token) = claims.remove(&(topic.to_string(), partition)) {
                token.cancel();
                revoked += 1;
            }
        }
        revoked
    }
}

impl ClientContext for ClaimRegistry {}

impl ConsumerContext for ClaimRegistry {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "Kafka partitions assigned")
            }
            Rebalance::Revoke(partitions) => {
                let elements = partitions.elements();
                let closed = self.revoke(elements.iter().map(|e| (e.topic(), e.partition())));
                info!(
                    partitions = partitions.count(),
                    claims_closed = closed,
                    "Kafka partitions revoked"
                );
            }
            Rebalance::Error(e) => warn!(error = %e, "Kafka rebalance error"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "Offsets committed"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(error = %e, "Offset commit failed"),
        }
    }
}

type RegistryConsumer = StreamConsumer<ClaimRegistry>;

/// Kafka consumer-group subscription.
///
/// A dispatcher task reads the shared consumer and routes each message to a
/// bounded channel for its (topic, partition). The first message seen for a
/// partition opens a new [`KafkaClaim`], which ends as soon as a rebalance
/// revokes its partition. Offsets are only stored when a claim acknowledges
/// a record, and auto-commit publishes stored offsets.
pub struct KafkaClaimStream {
    consumer: Arc<RegistryConsumer>,
    claims: mpsc::Receiver<KafkaClaim>,
    dispatcher: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

impl KafkaClaimStream {
    pub async fn connect(
        settings: &Settings,
        shutdown: &CancellationToken,
    ) -> Result<Self, BrokerError> {
        let client_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "clicksink".to_string());

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &settings.brokers)
            .set("group.id", &settings.group_id)
            .set("client.id", &client_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", settings.offset_reset.as_str());
        for (key, value) in &settings.kafka_properties {
            client_config.set(key, value);
        }

        let consumer: RegistryConsumer = client_config.create_with_context(ClaimRegistry::default())?;
        let topics: Vec<&str> = settings.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        let consumer = Arc::new(consumer);

        // Fail fast when the cluster is unreachable
        let probe = consumer.clone();
        let metadata_brokers = tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|metadata| metadata.brokers().len())
        })
        .await??;

        info!(
            brokers = %settings.brokers,
            known_brokers = metadata_brokers,
            group_id = %settings.group_id,
            topics = %settings.topics.join(","),
            "Subscribed to Kafka"
        );

        let stop = shutdown.child_token();
        let (claims_tx, claims_rx) = mpsc::channel(64);
        let dispatcher = tokio::spawn(dispatch(
            consumer.clone(),
            claims_tx,
            stop.clone(),
            settings.batch.size,
        ));

        Ok(Self {
            consumer,
            claims: claims_rx,
            dispatcher: Some(dispatcher),
            stop,
        })
    }
}

#[async_trait]
impl ClaimStream for KafkaClaimStream {
    type Claim = KafkaClaim;

    async fn next_claim(&mut self) -> Result<Option<KafkaClaim>, BrokerError> {
        Ok(self.claims.recv().await)
    }

    async fn shutdown(&mut self) -> Result<(), BrokerError> {
        self.stop.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.await?;
        }

        let consumer = self.consumer.clone();
        let result =
            tokio::task::spawn_blocking(move || consumer.commit_consumer_state(CommitMode::Sync))
                .await?;
        match result {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                info!("Committed stored offsets");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct Route {
    records: mpsc::Sender<Record>,
    revoked: CancellationToken,
}

impl Route {
    fn is_live(&self) -> bool {
        !self.records.is_closed() && !self.revoked.is_cancelled()
    }
}

async fn dispatch(
    consumer: Arc<RegistryConsumer>,
    claims: mpsc::Sender<KafkaClaim>,
    stop: CancellationToken,
    channel_capacity: usize,
) {
    let mut routes: HashMap<String, HashMap<i32, Route>> = HashMap::new();

    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            message = consumer.recv() => message,
        };

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Kafka receive error");
                continue;
            }
        };

        let partition = message.partition();
        let route = routes
            .get(message.topic())
            .and_then(|partitions| partitions.get(&partition))
            .filter(|route| route.is_live())
            .map(|route| route.records.clone());
        let topic: Arc<str> = Arc::from(message.topic());
        let record = record_from_message(topic.clone(), &message);
        drop(message);

        let sender = match route {
            Some(sender) => sender,
            None => {
                let (tx, rx) = mpsc::channel(channel_capacity.max(1));
                let revoked = consumer.context().register(&topic, partition);
                let claim = KafkaClaim {
                    topic: topic.clone(),
                    partition,
                    feed: PartitionFeed {
                        records: rx,
                        revoked: revoked.clone(),
                    },
                    consumer: consumer.clone(),
                };
                if claims.send(claim).await.is_err() {
                    // Nobody is taking claims any more
                    break;
                }
                info!(topic = %topic, partition, "Opened claim for partition");
                routes.entry(topic.to_string()).or_default().insert(
                    partition,
                    Route {
                        records: tx.clone(),
                        revoked,
                    },
                );
                tx
            }
        };

        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Received record"
        );

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            sent = sender.send(record) => {
                if sent.is_err() {
                    error!(
                        topic = %topic,
                        partition,
                        "Claim loop for partition has stopped; record left uncommitted"
                    );
                }
            }
        }
    }

    info!("Kafka dispatcher stopped");
}

fn record_from_message(topic: Arc<str>, message: &BorrowedMessage<'_>) -> Record {
    Record {
        topic,
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// Records routed to one claim, cut off once its partition is revoked.
struct PartitionFeed {
    records: mpsc::Receiver<Record>,
    revoked: CancellationToken,
}

impl PartitionFeed {
    /// Queued records of a revoked partition are abandoned; the next owner
    /// reads them again from the committed offset.
    async fn next(&mut self) -> Option<Record> {
        tokio::select! {
            biased;
            _ = self.revoked.cancelled() => None,
            record = self.records.recv() => record,
        }
    }
}

pub struct KafkaClaim {
    topic: Arc<str>,
    partition: i32,
    feed: PartitionFeed,
    consumer: Arc<RegistryConsumer>,
}

#[async_trait]
impl Claim for KafkaClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_record(&mut self) -> Option<Record> {
        self.feed.next().await
    }

    fn mark_acknowledged(&self, record: &Record) -> Result<(), BrokerError> {
        // A reassigned partition belongs to a newer claim
        if self.feed.revoked.is_cancelled() {
            return Err(BrokerError::Revoked {
                topic: record.topic.to_string(),
                partition: record.partition,
            });
        }
        // The committed offset is the next one to read
        self.consumer
            .store_offset(&record.topic, record.partition, record.offset + 1)?;
        Ok(())
    }
}
