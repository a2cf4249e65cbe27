use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Broker, Delivery, MessageSource, QueueError, Topology};

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Vec<u8>>,
    /// `(exchange, routing_key)` receiving rejected messages.
    dead_letter: Option<(String, String)>,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashSet<String>,
    /// exchange -> `(routing_key, queue)` bindings
    bindings: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
}

impl State {
    fn declare_queue(&mut self, queue: &str) -> &mut QueueState {
        self.queues.entry(queue.to_string()).or_default()
    }

    fn bind(&mut self, exchange: &str, routing_key: &str, queue: &str) {
        let bindings = self.bindings.entry(exchange.to_string()).or_default();
        let binding = (routing_key.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
    }

    /// Direct routing: deliver to every queue bound with exactly `routing_key`.
    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), QueueError> {
        if !self.exchanges.contains(exchange) {
            return Err(QueueError::UnknownExchange(exchange.to_string()));
        }

        let targets: Vec<String> = self
            .bindings
            .get(exchange)
            .into_iter()
            .flatten()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, queue)| queue.clone())
            .collect();

        if targets.is_empty() {
            tracing::warn!(exchange = %exchange, routing_key = %routing_key, "Dropping unroutable message");
        }
        for queue in targets {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.messages.push_back(body.to_vec());
            }
        }
        Ok(())
    }
}

/// In-process broker with direct exchanges and dead-lettering.
///
/// Used by tests and single-process runs. A delivery left unacknowledged
/// when its source is dropped is lost rather than requeued.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ready messages in `queue`.
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Snapshot of the ready message bodies in `queue`, oldest first.
    pub async fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.exchanges.insert(topology.exchange.clone());
        state.exchanges.insert(topology.dead_letter_exchange.clone());

        for binding in &topology.bindings {
            state.declare_queue(&binding.queue).dead_letter = Some((
                topology.dead_letter_exchange.clone(),
                binding.queue.clone(),
            ));
            state.bind(&topology.exchange, &binding.routing_key, &binding.queue);

            let dead_letter_queue = binding.dead_letter_queue();
            state.declare_queue(&dead_letter_queue);
            state.bind(&topology.dead_letter_exchange, &binding.queue, &dead_letter_queue);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.state.lock().await.route(exchange, routing_key, payload)
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn MessageSource>, QueueError> {
        if !self.state.lock().await.queues.contains_key(queue) {
            return Err(QueueError::UnknownQueue(queue.to_string()));
        }
        Ok(Box::new(MemorySource {
            state: Arc::clone(&self.state),
            queue: queue.to_string(),
            unacked: None,
        }))
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Consumer over one in-memory queue. Yields `None` once the queue is empty.
struct MemorySource {
    state: Arc<Mutex<State>>,
    queue: String,
    unacked: Option<(u64, Vec<u8>)>,
}

impl MemorySource {
    fn settle(&mut self, delivery_tag: u64) -> Result<Vec<u8>, QueueError> {
        match self.unacked.take() {
            Some((tag, body)) if tag == delivery_tag => Ok(body),
            other => {
                self.unacked = other;
                Err(QueueError::UnknownDelivery(delivery_tag))
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageSource for MemorySource {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>> {
        if let Some((tag, _)) = &self.unacked {
            return Some(Err(QueueError::PrefetchExceeded(*tag)));
        }

        let mut state = self.state.lock().await;
        let body = state.queues.get_mut(&self.queue)?.messages.pop_front()?;
        state.next_tag += 1;
        let delivery_tag = state.next_tag;

        self.unacked = Some((delivery_tag, body.clone()));
        Some(Ok(Delivery {
            delivery_tag,
            body,
            redelivered: false,
        }))
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        self.settle(delivery_tag)?;
        Ok(())
    }

    async fn reject(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        let body = self.settle(delivery_tag)?;
        let mut state = self.state.lock().await;
        let dead_letter = state
            .queues
            .get(&self.queue)
            .and_then(|q| q.dead_letter.clone());

        match dead_letter {
            Some((exchange, routing_key)) => state.route(&exchange, &routing_key, &body),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> Topology {
        Topology::new("exchange", "exchange-dead-letter")
            .bind("fns-queue", "fns")
            .bind("alco-queue", "alco")
    }

    async fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_topology(&topology()).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn routes_by_key_to_bound_queue() {
        let broker = broker().await;
        broker.publish("exchange", "fns", b"one").await.unwrap();
        broker.publish("exchange", "alco", b"two").await.unwrap();

        assert_eq!(broker.messages("fns-queue").await, vec![b"one".to_vec()]);
        assert_eq!(broker.messages("alco-queue").await, vec![b"two".to_vec()]);
    }

    #[tokio::test]
    async fn declaring_twice_does_not_duplicate_bindings() {
        let broker = broker().await;
        broker.declare_topology(&topology()).await.unwrap();
        broker.publish("exchange", "fns", b"once").await.unwrap();
        assert_eq!(broker.queue_len("fns-queue").await, 1);
    }

    #[tokio::test]
    async fn unknown_exchange_is_an_error() {
        let broker = broker().await;
        assert!(matches!(
            broker.publish("nope", "fns", b"x").await,
            Err(QueueError::UnknownExchange(_))
        ));
    }

    #[tokio::test]
    async fn reject_moves_message_to_dead_letter_queue() {
        let broker = broker().await;
        broker.publish("exchange", "fns", b"poison").await.unwrap();

        let mut source = broker.consume("fns-queue").await.unwrap();
        let delivery = source.next_delivery().await.unwrap().unwrap();
        source.reject(delivery.delivery_tag).await.unwrap();

        assert_eq!(broker.queue_len("fns-queue").await, 0);
        assert_eq!(broker.messages("fns-queue-dead-letter").await, vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn prefetch_of_one_holds_next_delivery() {
        let broker = broker().await;
        broker.publish("exchange", "fns", b"a").await.unwrap();
        broker.publish("exchange", "fns", b"b").await.unwrap();

        let mut source = broker.consume("fns-queue").await.unwrap();
        let first = source.next_delivery().await.unwrap().unwrap();
        assert!(matches!(
            source.next_delivery().await,
            Some(Err(QueueError::PrefetchExceeded(_)))
        ));

        source.ack(first.delivery_tag).await.unwrap();
        let second = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.body, b"b".to_vec());
        source.ack(second.delivery_tag).await.unwrap();
        assert!(source.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn acking_unknown_tag_fails() {
        let broker = broker().await;
        let mut source = broker.consume("fns-queue").await.unwrap();
        assert!(matches!(source.ack(42).await, Err(QueueError::UnknownDelivery(42))));
    }
}
