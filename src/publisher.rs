//! Order update publisher.
//!
//! Turns an order into an `OrderEvent` and enqueues it. Publishing is a
//! best-effort side channel of order processing: `publish` logs failures and
//! never returns them. `try_publish` exposes the outcome.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::event::{non_blank, now, Order, OrderEvent};
use crate::queue::{Queue, QueueError, QueueMessage};
use crate::writer::FailureKind;

/// Errors from [`OrderPublisher::try_publish`].
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("No session id for order {0}")]
    MissingSessionId(String),

    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to enqueue event: {0}")]
    Queue(#[from] QueueError),
}

impl PublishError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::PublishFailure
    }
}

/// Publishes order updates to the order update queue.
pub struct OrderPublisher {
    queue: Arc<dyn Queue>,
}

impl OrderPublisher {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self { queue }
    }

    /// Session id to publish under: the caller's, else the order's own,
    /// else the order id.
    pub fn effective_session_id<'a>(order: &'a Order, session_id: Option<&'a str>) -> Option<&'a str> {
        non_blank(session_id)
            .or_else(|| non_blank(order.session_id.as_deref()))
            .or_else(|| non_blank(Some(order.id.as_str())))
    }

    /// Build the event for an order update.
    pub fn build_event(order: &Order, session_id: &str, timestamp: DateTime<FixedOffset>) -> OrderEvent {
        OrderEvent {
            session_id: Some(session_id.to_string()),
            order_id: non_blank(Some(order.id.as_str())).map(str::to_string),
            email: order.email.clone(),
            timestamp: Some(timestamp),
            items: Some(order.products.clone()),
            total: order.total(),
        }
    }

    /// Message id: `{sessionId}-{epoch millis}`.
    pub fn message_id(session_id: &str, timestamp: DateTime<FixedOffset>) -> String {
        format!("{}-{}", session_id, timestamp.timestamp_millis())
    }

    /// Publish an order update, reporting failures.
    #[tracing::instrument(name = "publisher.publish", skip_all, fields(order_id = %order.id))]
    pub async fn try_publish(
        &self,
        order: &Order,
        session_id: Option<&str>,
    ) -> Result<(), PublishError> {
        let session_id = Self::effective_session_id(order, session_id)
            .ok_or_else(|| PublishError::MissingSessionId(order.id.clone()))?;

        let timestamp = now();
        let event = Self::build_event(order, session_id, timestamp);
        let body = event.to_json()?;
        let message = QueueMessage::json(Self::message_id(session_id, timestamp), body);

        debug!(
            session_id = %session_id,
            message_id = %message.message_id,
            "Sending order update"
        );

        self.queue.send(message).await?;

        info!(session_id = %session_id, "Sent order update");
        Ok(())
    }

    /// Publish an order update. Failures are logged and discarded so order
    /// processing continues.
    pub async fn publish(&self, order: &Order, session_id: Option<&str>) {
        match self.try_publish(order, session_id).await {
            Ok(()) => {}
            Err(PublishError::MissingSessionId(order_id)) => {
                warn!(
                    order_id = %order_id,
                    kind = ?FailureKind::PublishFailure,
                    "No session id, skipping order update"
                );
            }
            Err(e) => {
                error!(
                    order_id = %order.id,
                    kind = ?e.kind(),
                    error = %e,
                    "Failed to send order update"
                );
            }
        }
    }
}
