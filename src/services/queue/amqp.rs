use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use uuid::Uuid;

use super::{Broker, Delivery, MessageSource, QueueError, Topology};

const PERSISTENT: u8 = 2;

/// RabbitMQ broker over a single AMQP connection.
///
/// Publishing shares one channel; each consumer gets its own channel so its
/// prefetch limit applies to it alone.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(amqp_url: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        Ok(Self { connection, channel })
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection.close(200, "Shutting down").await?;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), QueueError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), QueueError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), QueueError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), QueueError> {
        self.declare_exchange(&topology.exchange).await?;
        self.declare_exchange(&topology.dead_letter_exchange).await?;

        for binding in &topology.bindings {
            let mut arguments = FieldTable::default();
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(topology.dead_letter_exchange.as_str().into()),
            );
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(binding.queue.as_str().into()),
            );

            self.declare_queue(&binding.queue, arguments).await?;
            self.bind_queue(&binding.queue, &topology.exchange, &binding.routing_key)
                .await?;

            let dead_letter_queue = binding.dead_letter_queue();
            self.declare_queue(&dead_letter_queue, FieldTable::default())
                .await?;
            self.bind_queue(&dead_letter_queue, &topology.dead_letter_exchange, &binding.queue)
                .await?;

            tracing::info!(
                queue = %binding.queue,
                routing_key = %binding.routing_key,
                dead_letter_queue = %dead_letter_queue,
                "Declared queue"
            );
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), QueueError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        // The returned confirm is not awaited: durability is the broker's job.
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn MessageSource>, QueueError> {
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let consumer_tag = format!("capts-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = %queue, consumer_tag = %consumer_tag, "Consuming");
        Ok(Box::new(AmqpSource { channel, consumer }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

struct AmqpSource {
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait::async_trait]
impl MessageSource for AmqpSource {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|d| Delivery {
                    delivery_tag: d.delivery_tag,
                    body: d.data,
                    redelivered: d.redelivered,
                })
                .map_err(QueueError::from),
        )
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }
}
