//! Message bus abstraction.
//!
//! [`BusGateway`] models an ordered, partitioned, at-least-once message log
//! with consumer groups (Kafka-class systems). Producers get a durability
//! acknowledgement per message; consumers receive messages in partition
//! order and commit offsets only after downstream processing, so an
//! uncommitted message is re-delivered after a consumer restart.
//!
//! The real broker driver lives outside this crate; [`memory::InMemoryBus`]
//! provides the in-process implementation used by tests and standalone mode.

pub mod memory;

pub use memory::InMemoryBus;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// A single message consumed from (or produced to) the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Partition key; typically the sender address so a sender's
    /// transactions stay in submission order.
    pub key: Option<String>,
    pub value: Vec<u8>,
}

impl BusMessage {
    /// Render the message coordinates as `topic:partition:offset`, the
    /// format recorded in receipt `reqOffset` headers.
    pub fn req_offset(&self) -> String {
        format!("{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

/// Consumer-group rebalance notification. Observable, never fatal.
#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    Assigned { topic: String, partitions: Vec<i32> },
    Revoked { topic: String, partitions: Vec<i32> },
}

/// Bus failures, split by whether the caller may retry.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Network-class failure; safe to retry
    #[error("bus transient error: {0}")]
    Transient(String),

    /// Broker/configuration failure; retrying will not help
    #[error("bus configuration error: {0}")]
    Config(String),

    /// The gateway has been closed
    #[error("bus closed")]
    Closed,
}

impl BusError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Capability set for the bus collaborator.
///
/// `produce` resolves only once the bus has acknowledged durability.
/// `next_message` yields messages in partition order and returns `None`
/// once the gateway is closed; `commit` advances the consumer group offset
/// and must be called only after the message has been fully processed.
#[async_trait]
pub trait BusGateway: Send + Sync {
    async fn produce(
        &self,
        topic: &str,
        key: Option<String>,
        value: Vec<u8>,
    ) -> Result<(i32, i64), BusError>;

    async fn next_message(&self) -> Option<BusMessage>;

    async fn commit(&self, msg: &BusMessage) -> Result<(), BusError>;

    /// Subscribe to consumer-group rebalance notifications.
    fn rebalance_events(&self) -> broadcast::Receiver<RebalanceEvent>;

    /// Close the producer asynchronously and stop the consumer, waking any
    /// task blocked in `next_message`.
    async fn close(&self);
}
