//! In-memory channel-based queue for standalone mode.
//!
//! Uses a tokio mpsc channel as the queue within a single process. Each
//! delivery is handled on its own task. Failed deliveries go back on the
//! channel with a higher delivery count; once the count reaches the limit the
//! message moves to the dead-letter receiver instead.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::{Delivery, MessageHandler, Queue, QueueConfig, QueueError, QueueMessage, Result};

/// A message that exhausted its deliveries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub delivery_count: u32,
    /// Error from the final delivery.
    pub reason: String,
}

/// In-process queue with redelivery and dead-lettering.
pub struct ChannelQueue {
    name: String,
    dead_letter_queue: String,
    max_delivery_count: u32,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    dead_letter_sender: mpsc::UnboundedSender<DeadLetter>,
    dead_letter_receiver: Mutex<Option<mpsc::UnboundedReceiver<DeadLetter>>>,
    shutdown: CancellationToken,
}

impl ChannelQueue {
    pub fn new(config: &QueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (dead_letter_sender, dead_letter_receiver) = mpsc::unbounded_channel();

        info!(
            queue = %config.name,
            max_delivery_count = config.max_delivery_count(),
            "Channel queue initialized"
        );

        Self {
            name: config.name.clone(),
            dead_letter_queue: config.dead_letter_queue(),
            max_delivery_count: config.max_delivery_count(),
            sender,
            receiver: Mutex::new(Some(receiver)),
            dead_letter_sender,
            dead_letter_receiver: Mutex::new(Some(dead_letter_receiver)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop consuming when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the dead-letter receiver. Only the first call gets it.
    pub async fn take_dead_letters(&self) -> Option<mpsc::UnboundedReceiver<DeadLetter>> {
        self.dead_letter_receiver.lock().await.take()
    }

    async fn consume(
        mut receiver: mpsc::UnboundedReceiver<Delivery>,
        redeliver: mpsc::UnboundedSender<Delivery>,
        dead_letters: mpsc::UnboundedSender<DeadLetter>,
        handler: Arc<dyn MessageHandler>,
        max_delivery_count: u32,
        dead_letter_queue: String,
        shutdown: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping channel consumer");
                    break;
                }
                delivery = receiver.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        info!("Channel closed, stopping consumer");
                        break;
                    }
                },
            };

            let span = tracing::info_span!(
                "queue.consume",
                message_id = %delivery.message.message_id,
                delivery_count = delivery.delivery_count
            );
            let handler = handler.clone();
            let redeliver = redeliver.clone();
            let dead_letters = dead_letters.clone();
            let dead_letter_queue = dead_letter_queue.clone();

            tokio::spawn(
                async move {
                    Self::process_delivery(
                        delivery,
                        handler,
                        &redeliver,
                        &dead_letters,
                        max_delivery_count,
                        &dead_letter_queue,
                    )
                    .await;
                }
                .instrument(span),
            );
        }
    }

    async fn process_delivery(
        delivery: Delivery,
        handler: Arc<dyn MessageHandler>,
        redeliver: &mpsc::UnboundedSender<Delivery>,
        dead_letters: &mpsc::UnboundedSender<DeadLetter>,
        max_delivery_count: u32,
        dead_letter_queue: &str,
    ) {
        let result = handler.handle(delivery.clone()).await;

        let reason = match result {
            Ok(()) => {
                debug!("Message completed");
                return;
            }
            Err(e) => e.to_string(),
        };

        if delivery.delivery_count >= max_delivery_count {
            error!(
                dlq = %dead_letter_queue,
                delivery_count = delivery.delivery_count,
                reason = %reason,
                "Max delivery count reached, dead-lettering message"
            );
            let dead_letter = DeadLetter {
                message: delivery.message,
                delivery_count: delivery.delivery_count,
                reason,
            };
            if dead_letters.send(dead_letter).is_err() {
                warn!("Dead-letter receiver dropped, message discarded");
            }
            return;
        }

        warn!(
            delivery_count = delivery.delivery_count,
            max_delivery_count,
            reason = %reason,
            "Message abandoned, redelivering"
        );
        let next = Delivery {
            message: delivery.message,
            delivery_count: delivery.delivery_count + 1,
        };
        if redeliver.send(next).is_err() {
            error!("Queue closed, redelivery lost");
        }
    }
}

#[async_trait]
impl Queue for ChannelQueue {
    #[tracing::instrument(name = "queue.send", skip_all, fields(queue = %self.name, message_id = %message.message_id))]
    async fn send(&self, message: QueueMessage) -> Result<()> {
        self.sender
            .send(Delivery {
                message,
                delivery_count: 1,
            })
            .map_err(|_| QueueError::Send("Queue closed".to_string()))?;

        debug!("Message enqueued");
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| QueueError::Subscribe("Queue already has a consumer".to_string()))?;

        tokio::spawn(Self::consume(
            receiver,
            self.sender.clone(),
            self.dead_letter_sender.clone(),
            handler,
            self.max_delivery_count,
            self.dead_letter_queue.clone(),
            self.shutdown.clone(),
        ));

        info!(queue = %self.name, "Channel consumer started");
        Ok(())
    }
}
