//! AMQP (RabbitMQ) queue implementation.
//!
//! Messages are published to the default exchange with the queue name as
//! routing key. The queue is a quorum queue so the broker tracks delivery
//! counts. The broker dead-letters a message once it has been returned more
//! than `x-delivery-limit` times, so the limit is set one below
//! `max_delivery_count` to dead-letter after exactly that many deliveries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::{Delivery, MessageHandler, Queue, QueueConfig, QueueError, QueueMessage, Result};

/// Consumer tag for the reserver.
const CONSUMER_TAG: &str = "order-reserver";

/// Publish attempts before giving up.
const MAX_PUBLISH_RETRIES: usize = 3;

/// AMQP queue using RabbitMQ.
pub struct AmqpQueue {
    pool: Pool,
    queue: String,
    dead_letter_queue: String,
    max_delivery_count: u32,
    shutdown: CancellationToken,
}

impl AmqpQueue {
    /// Connect and declare the queue and its dead-letter queue.
    pub async fn new(url: &str, config: &QueueConfig) -> Result<Self> {
        let manager = Manager::new(url.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| QueueError::Connection(format!("Failed to create pool: {}", e)))?;

        let queue = Self {
            pool,
            queue: config.name.clone(),
            dead_letter_queue: config.dead_letter_queue(),
            max_delivery_count: config.max_delivery_count(),
            shutdown: CancellationToken::new(),
        };

        let channel = queue.get_channel().await?;
        Self::declare(
            &channel,
            &queue.queue,
            &queue.dead_letter_queue,
            queue.max_delivery_count,
        )
        .await?;

        info!(
            queue = %queue.queue,
            dlq = %queue.dead_letter_queue,
            max_delivery_count = queue.max_delivery_count,
            "Connected to AMQP"
        );

        Ok(queue)
    }

    /// Stop consuming when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Get a channel from the pool.
    async fn get_channel(&self) -> Result<Channel> {
        Self::channel_from(&self.pool).await
    }

    async fn channel_from(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            QueueError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Arguments for the main queue: quorum type, delivery limit and
    /// dead-letter routing through the default exchange.
    fn queue_arguments(dead_letter_queue: &str, max_delivery_count: u32) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-queue-type"),
            AMQPValue::LongString("quorum".into()),
        );
        args.insert(
            ShortString::from("x-delivery-limit"),
            AMQPValue::LongInt(Self::delivery_limit(max_delivery_count)),
        );
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(dead_letter_queue.into()),
        );
        args
    }

    /// Broker returns allowed before dead-lettering.
    fn delivery_limit(max_delivery_count: u32) -> i32 {
        i32::try_from(max_delivery_count.saturating_sub(1)).unwrap_or(i32::MAX)
    }

    async fn declare(
        channel: &Channel,
        queue: &str,
        dead_letter_queue: &str,
        max_delivery_count: u32,
    ) -> Result<()> {
        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        channel
            .queue_declare(dead_letter_queue, durable, FieldTable::default())
            .await
            .map_err(|e| {
                QueueError::Connection(format!("Failed to declare dead-letter queue: {}", e))
            })?;

        channel
            .queue_declare(
                queue,
                durable,
                Self::queue_arguments(dead_letter_queue, max_delivery_count),
            )
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to declare queue: {}", e)))?;

        Ok(())
    }

    /// Broker-side delivery count. Quorum queues report prior deliveries in
    /// `x-delivery-count`; the first delivery carries no header.
    fn delivery_count(properties: &BasicProperties, redelivered: bool) -> u32 {
        let prior = properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get("x-delivery-count"))
            .and_then(|value| match value {
                AMQPValue::LongLongInt(n) => Some(*n as u32),
                AMQPValue::LongInt(n) => Some(*n as u32),
                AMQPValue::ShortInt(n) => Some(*n as u32),
                AMQPValue::LongUInt(n) => Some(*n),
                _ => None,
            });

        match prior {
            Some(n) => n + 1,
            None if redelivered => 2,
            None => 1,
        }
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn consume_with_reconnect(
        pool: Pool,
        queue: String,
        dead_letter_queue: String,
        max_delivery_count: u32,
        handler: Arc<dyn MessageHandler>,
    ) {
        use futures::StreamExt;

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            match Self::setup_consumer(&pool, &queue, &dead_letter_queue, max_delivery_count)
                .await
            {
                Ok(mut consumer) => {
                    info!(queue = %queue, "Consumer connected, processing messages");
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => {
                                let handler = handler.clone();
                                tokio::spawn(Self::process_delivery(delivery, handler));
                            }
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    info!(queue = %queue, "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    async fn setup_consumer(
        pool: &Pool,
        queue: &str,
        dead_letter_queue: &str,
        max_delivery_count: u32,
    ) -> Result<lapin::Consumer> {
        let channel = Self::channel_from(pool).await?;
        Self::declare(&channel, queue, dead_letter_queue, max_delivery_count).await?;

        channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    /// Hand one delivery to the handler, then ack or nack it.
    async fn process_delivery(delivery: lapin::message::Delivery, handler: Arc<dyn MessageHandler>) {
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        let content_type = delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string())
            .unwrap_or_else(|| super::JSON_CONTENT_TYPE.to_string());
        let delivery_count = Self::delivery_count(&delivery.properties, delivery.redelivered);

        let span = tracing::info_span!(
            "queue.consume",
            message_id = %message_id,
            delivery_count
        );

        async {
            let result = handler
                .handle(Delivery {
                    message: QueueMessage {
                        message_id,
                        content_type,
                        body: delivery.data.clone(),
                    },
                    delivery_count,
                })
                .await;

            match result {
                Ok(()) => {
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        error!(error = %e, "Failed to ack message");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Message abandoned, requeueing");
                    let options = BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    };
                    if let Err(e) = delivery.nack(options).await {
                        error!(error = %e, "Failed to nack message");
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }
}

#[async_trait]
impl Queue for AmqpQueue {
    #[tracing::instrument(name = "queue.send", skip_all, fields(queue = %self.queue, message_id = %message.message_id))]
    async fn send(&self, message: QueueMessage) -> Result<()> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_PUBLISH_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let channel = match self.get_channel().await {
                Ok(ch) => ch,
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to get channel, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default()
                .with_message_id(message.message_id.as_str().into())
                .with_content_type(message.content_type.as_str().into())
                .with_delivery_mode(2); // persistent

            match channel
                .basic_publish(
                    "",
                    &self.queue,
                    BasicPublishOptions::default(),
                    &message.body,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!("Published message");
                        return Ok(());
                    }
                    Err(e) => {
                        error!(
                            attempt = attempt + 1,
                            error = %e,
                            "Publish confirmation failed, retrying..."
                        );
                        last_error = Some(QueueError::Send(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(QueueError::Send(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| QueueError::Send("Max retries exceeded".to_string())))
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let pool = self.pool.clone();
        let queue = self.queue.clone();
        let dead_letter_queue = self.dead_letter_queue.clone();
        let max_delivery_count = self.max_delivery_count;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(queue = %queue, "Shutdown requested, stopping AMQP consumer");
                }
                _ = Self::consume_with_reconnect(
                    pool,
                    queue.clone(),
                    dead_letter_queue,
                    max_delivery_count,
                    handler,
                ) => {}
            }
        });

        Ok(())
    }
}


/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test --features amqp amqp_integration -- --ignored
#[cfg(test)]
mod amqp_integration {
    use super::*;
    use futures::future::BoxFuture;
    use tokio::sync::mpsc;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    struct ForwardingHandler {
        tx: mpsc::Sender<Delivery>,
    }

    impl MessageHandler for ForwardingHandler {
        fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Result<()>> {
            let tx = self.tx.clone();
            Box::pin(async move {
                let _ = tx.send(delivery).await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_send_and_consume() {
        let config = QueueConfig {
            name: format!("test-orders-{}", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        let queue = AmqpQueue::new(&amqp_url(), &config)
            .await
            .expect("Failed to connect");

        let (tx, mut rx) = mpsc::channel(10);
        queue
            .subscribe(Arc::new(ForwardingHandler { tx }))
            .await
            .expect("Failed to subscribe");

        queue
            .send(QueueMessage::json("abc-1", b"{\"sessionId\":\"abc\"}".to_vec()))
            .await
            .expect("Failed to send");

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Channel closed");

        assert_eq!(received.message.message_id, "abc-1");
        assert_eq!(received.message.content_type, "application/json");
        assert_eq!(received.delivery_count, 1);
    }
}
