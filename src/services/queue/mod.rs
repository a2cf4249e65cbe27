//! Message broker topology, publishing and consumption.
//!
//! Every job type gets a durable queue bound to a shared direct exchange, and
//! a `<queue>-dead-letter` queue on the dead-letter exchange that receives
//! messages rejected without requeue.

mod amqp;
mod memory;

use std::sync::Arc;

pub use self::amqp::AmqpBroker;
pub use self::memory::MemoryBroker;

use crate::config::AppConfig;
use crate::models::job::JobType;
use crate::models::message::{Message, MessageError};

pub const DEAD_LETTER_SUFFIX: &str = "-dead-letter";

/// A primary queue and the routing key binding it to the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn dead_letter_queue(&self) -> String {
        format!("{}{DEAD_LETTER_SUFFIX}", self.queue)
    }
}

/// Exchanges and queues a deployment needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn new(exchange: impl Into<String>, dead_letter_exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            dead_letter_exchange: dead_letter_exchange.into(),
            bindings: Vec::new(),
        }
    }

    pub fn bind(mut self, queue: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.bindings.push(QueueBinding {
            queue: queue.into(),
            routing_key: routing_key.into(),
        });
        self
    }

    /// One binding per job type, named from the configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        JobType::ALL.iter().fold(
            Topology::new(&config.exchange, &config.exchange_dead_letter),
            |topology, job_type| topology.bind(config.queue_for(*job_type), job_type.routing_key()),
        )
    }

    pub fn binding_for(&self, routing_key: &str) -> Option<&QueueBinding> {
        self.bindings.iter().find(|b| b.routing_key == routing_key)
    }
}

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Connection to a message broker.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Declare exchanges and queues. Safe to call repeatedly.
    async fn declare_topology(&self, topology: &Topology) -> Result<(), QueueError>;

    /// Publish a persistent message. Does not wait for a publisher confirm.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Start consuming `queue` with at most one unacknowledged delivery.
    async fn consume(&self, queue: &str) -> Result<Box<dyn MessageSource>, QueueError>;

    fn is_connected(&self) -> bool;
}

/// Stream of deliveries from one queue.
#[async_trait::async_trait]
pub trait MessageSource: Send {
    /// Next delivery, or `None` once the source is closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError>;

    /// Reject without requeue, handing the message to the dead-letter exchange.
    async fn reject(&mut self, delivery_tag: u64) -> Result<(), QueueError>;
}

/// Serialize `message` and publish it persistently.
pub async fn send_message(
    broker: &dyn Broker,
    exchange: &str,
    routing_key: &str,
    message: &Message,
) -> Result<(), QueueError> {
    let payload = message.to_bytes()?;
    broker.publish(exchange, routing_key, &payload).await?;
    tracing::debug!(
        task_id = %message.task_id,
        exchange = %exchange,
        routing_key = %routing_key,
        "Published message"
    );
    Ok(())
}

/// Publishes messages for one job type.
#[derive(Clone)]
pub struct MessagePublisher {
    broker: Arc<dyn Broker>,
    exchange: String,
    routing_key: String,
}

impl MessagePublisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub async fn publish_message(&self, message: &Message) -> Result<(), QueueError> {
        send_message(self.broker.as_ref(), &self.exchange, &self.routing_key, message).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error("Queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("Delivery {0} is not awaiting acknowledgement")]
    UnknownDelivery(u64),

    #[error("Prefetch limit reached: delivery {0} is still unacknowledged")]
    PrefetchExceeded(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_queue_name_has_suffix() {
        let binding = QueueBinding {
            queue: "fns-queue".to_string(),
            routing_key: "fns".to_string(),
        };
        assert_eq!(binding.dead_letter_queue(), "fns-queue-dead-letter");
    }

    #[test]
    fn topology_lookup_by_routing_key() {
        let topology = Topology::new("exchange", "exchange-dead-letter")
            .bind("fns-queue", "fns")
            .bind("alco-queue", "alco");

        assert_eq!(topology.binding_for("alco").unwrap().queue, "alco-queue");
        assert!(topology.binding_for("other").is_none());
    }
}
