//! Mock queue implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{MessageHandler, Queue, QueueError, QueueMessage, Result};

/// Mock queue for testing.
#[derive(Default)]
pub struct MockQueue {
    sent: RwLock<Vec<QueueMessage>>,
    fail_on_send: RwLock<bool>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_send(&self, fail: bool) {
        *self.fail_on_send.write().await = fail;
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }

    pub async fn take_sent(&self) -> Vec<QueueMessage> {
        std::mem::take(&mut *self.sent.write().await)
    }
}

#[async_trait]
impl Queue for MockQueue {
    async fn send(&self, message: QueueMessage) -> Result<()> {
        if *self.fail_on_send.read().await {
            return Err(QueueError::Connection("Mock send failure".to_string()));
        }
        self.sent.write().await.push(message);
        Ok(())
    }

    async fn subscribe(&self, _handler: Arc<dyn MessageHandler>) -> Result<()> {
        Err(QueueError::Subscribe(
            "Mock queue does not deliver messages".to_string(),
        ))
    }
}
