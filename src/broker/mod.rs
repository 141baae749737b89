pub mod kafka;
pub mod memory;
pub mod traits;

pub use kafka::{KafkaClaim, KafkaClaimStream};
pub use memory::{MemoryBroker, MemoryBrokerHandle, MemoryClaim, MemoryPartition};
pub use traits::{BrokerError, Claim, ClaimStream, Record};
