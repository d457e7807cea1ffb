//! Queue-triggered ingestion.
//!
//! Each delivered message is decoded, validated and handed to the snapshot
//! writer. Returning `Ok` completes the message. Any failure is returned to
//! the queue, which redelivers and eventually dead-letters the message.

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{error, info};

use crate::event::OrderEvent;
use crate::queue::{Delivery, MessageHandler, QueueError};
use crate::writer::{FailureKind, SnapshotWriter, Stored, WriteError};

/// Errors from ingesting one message.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Message has no sessionId")]
    MissingSessionId,

    #[error("Storage configuration missing")]
    StorageNotConfigured,

    #[error(transparent)]
    Write(#[from] WriteError),
}

impl IngestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::Decode(_) | IngestError::MissingSessionId => FailureKind::InvalidInput,
            IngestError::StorageNotConfigured => FailureKind::StorageRejected,
            IngestError::Write(e) => e.kind(),
        }
    }
}

/// Consumer of the order update queue.
///
/// Holds no writer when storage is not configured; every message then fails.
#[derive(Clone)]
pub struct QueueIngestor {
    writer: Option<Arc<SnapshotWriter>>,
}

impl QueueIngestor {
    pub fn new(writer: Option<Arc<SnapshotWriter>>) -> Self {
        Self { writer }
    }

    /// Decode and store one message body.
    pub async fn ingest(&self, body: &[u8]) -> Result<Stored, IngestError> {
        let event = OrderEvent::from_json(body)?;
        if event.session().is_none() {
            return Err(IngestError::MissingSessionId);
        }
        let writer = self
            .writer
            .as_ref()
            .ok_or(IngestError::StorageNotConfigured)?;

        Ok(writer.store(event).await?)
    }
}

impl MessageHandler for QueueIngestor {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Result<(), QueueError>> {
        let ingestor = self.clone();
        Box::pin(async move {
            match ingestor.ingest(&delivery.message.body).await {
                Ok(stored) => {
                    info!(
                        object = %stored.object_name,
                        attempts = stored.attempts,
                        "Order update ingested"
                    );
                    Ok(())
                }
                Err(e) => {
                    error!(
                        kind = ?e.kind(),
                        delivery_count = delivery.delivery_count,
                        error = %e,
                        "Order update ingestion failed"
                    );
                    Err(QueueError::Handler(e.to_string()))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueMessage;
    use crate::store::{ErrorCode, Fault, MemoryObjectStore, SnapshotTarget, StoreOp};

    fn ingestor(store: Arc<MemoryObjectStore>) -> QueueIngestor {
        let writer = SnapshotWriter::new(SnapshotTarget::new(store, "orders"));
        QueueIngestor::new(Some(Arc::new(writer)))
    }

    fn delivery(body: &[u8]) -> Delivery {
        Delivery {
            message: QueueMessage::json("abc-1", body.to_vec()),
            delivery_count: 1,
        }
    }

    #[tokio::test]
    async fn test_ingest_stores_snapshot() {
        let store = Arc::new(MemoryObjectStore::new());
        let ingestor = ingestor(store.clone());

        let stored = ingestor
            .ingest(br#"{"sessionId":"abc","orderId":null,"total":19.99}"#)
            .await
            .unwrap();

        assert_eq!(stored.object_name, "session-abc.json");
        assert!(stored.event.order_id.is_some());
        assert!(stored.event.timestamp.is_some());
        assert_eq!(store.object_count().await, 1);
    }

    #[tokio::test]
    async fn test_ingest_accepts_null_numbers() {
        let store = Arc::new(MemoryObjectStore::new());
        let ingestor = ingestor(store.clone());

        let stored = ingestor
            .ingest(br#"{"sessionId":"abc","total":null,"products":[{"quantity":null,"price":null}]}"#)
            .await
            .unwrap();

        assert_eq!(stored.event.total, 0.0);
        assert_eq!(store.object_count().await, 1);
    }

    #[tokio::test]
    async fn test_undecodable_body_never_reaches_writer() {
        let store = Arc::new(MemoryObjectStore::new());
        let ingestor = ingestor(store.clone());

        let err = ingestor.ingest(b"not json").await.unwrap_err();
        assert!(matches!(err, IngestError::Decode(_)));

        let err = ingestor.ingest(&[0xff, 0xfe, 0x00]).await.unwrap_err();
        assert!(matches!(err, IngestError::Decode(_)));

        assert_eq!(store.total_calls().await, 0);
    }

    #[tokio::test]
    async fn test_missing_session_is_invalid_input() {
        let store = Arc::new(MemoryObjectStore::new());
        let ingestor = ingestor(store.clone());

        let err = ingestor.ingest(br#"{"total":5}"#).await.unwrap_err();

        assert!(matches!(err, IngestError::MissingSessionId));
        assert_eq!(err.kind(), FailureKind::InvalidInput);
        assert_eq!(store.total_calls().await, 0);
    }

    #[tokio::test]
    async fn test_missing_storage_configuration() {
        let ingestor = QueueIngestor::new(None);

        let err = ingestor.ingest(br#"{"sessionId":"abc"}"#).await.unwrap_err();

        assert!(matches!(err, IngestError::StorageNotConfigured));
    }

    #[tokio::test]
    async fn test_handler_completes_on_success() {
        let store = Arc::new(MemoryObjectStore::new());
        let ingestor = ingestor(store);

        let result = ingestor.handle(delivery(br#"{"sessionId":"abc"}"#)).await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_abandons_on_failure() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .fail_always(StoreOp::Put, Fault::Status(503, ErrorCode::ServerBusy))
            .await;
        let ingestor = ingestor(store.clone());

        let result = ingestor.handle(delivery(br#"{"sessionId":"abc"}"#)).await;

        assert!(matches!(result, Err(QueueError::Handler(_))));
        assert_eq!(store.calls(StoreOp::Put).await, 3);
    }
}
