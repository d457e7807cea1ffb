//! Durable snapshot writer.
//!
//! Takes a decoded `OrderEvent` through validate → fill-in → serialize →
//! store, retrying transient storage failures a bounded number of times with
//! a fixed delay. Fatal storage failures stop the loop at once.
//!
//! The retry tier here absorbs short blips. Prolonged outages surface as
//! `RetriesExhausted`, which the queue consumer turns into a failed delivery
//! so the queue's own redelivery and dead-letter handling take over.

use std::time::Duration;

use backon::BackoffBuilder;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::{snapshot_name, OrderEvent};
use crate::store::{SnapshotTarget, StoreError};
use crate::utils::retry::{snapshot_backoff, RetryPolicy};

/// Failure taxonomy of the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Missing or malformed required input. Never retried.
    InvalidInput,
    /// Non-transient storage error. Not retried.
    StorageRejected,
    /// Retryable storage error; only seen per attempt.
    Transient,
    /// Attempt budget spent on transient errors.
    RetriesExhausted,
    /// Producer could not enqueue. Always swallowed.
    PublishFailure,
}

/// Errors returned by [`SnapshotWriter::store`].
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage rejected snapshot: {0}")]
    StorageRejected(#[source] StoreError),

    #[error("Failed to store snapshot after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: StoreError,
    },
}

impl WriteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            WriteError::InvalidInput(_) => FailureKind::InvalidInput,
            WriteError::StorageRejected(_) => FailureKind::StorageRejected,
            WriteError::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
        }
    }
}

/// Classify a single failed storage attempt.
pub fn classify(err: &StoreError) -> FailureKind {
    if err.is_retryable() {
        FailureKind::Transient
    } else {
        FailureKind::StorageRejected
    }
}

/// A successfully written snapshot.
#[derive(Debug, Clone)]
pub struct Stored {
    pub object_name: String,
    pub byte_size: usize,
    /// Attempts used, the successful one included.
    pub attempts: u32,
    /// The event as written, with `orderId` and `timestamp` filled in.
    pub event: OrderEvent,
}

/// Writes order snapshots to the configured target.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    target: SnapshotTarget,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl SnapshotWriter {
    pub fn new(target: SnapshotTarget) -> Self {
        Self {
            target,
            policy: RetryPolicy::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Token whose cancellation cuts short any pending retry delay.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn target(&self) -> &SnapshotTarget {
        &self.target
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Store with the configured retry policy.
    pub async fn store(&self, event: OrderEvent) -> Result<Stored, WriteError> {
        self.store_with(event, self.policy).await
    }

    /// Store with exactly one attempt.
    pub async fn store_once(&self, event: OrderEvent) -> Result<Stored, WriteError> {
        self.store_with(event, RetryPolicy::single()).await
    }

    #[tracing::instrument(name = "writer.store", skip_all, fields(session_id = tracing::field::Empty))]
    pub async fn store_with(
        &self,
        mut event: OrderEvent,
        policy: RetryPolicy,
    ) -> Result<Stored, WriteError> {
        let Some(session_id) = event.session().map(str::to_string) else {
            return Err(WriteError::InvalidInput("sessionId is required".to_string()));
        };
        tracing::Span::current().record("session_id", session_id.as_str());

        // Fixed once; every attempt below writes these exact bytes.
        event.resolve();
        let body = event
            .to_json()
            .map_err(|e| WriteError::InvalidInput(format!("Failed to serialize event: {}", e)))?;
        let object_name = snapshot_name(&session_id);
        let max_attempts = policy.max_attempts.max(1);

        debug!(order_id = ?event.order_id, object = %object_name, "Writing snapshot");

        let backoff = snapshot_backoff(&policy).build();
        let mut attempts = 0;
        let mut last_error = None;

        for (index, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if index > 0 {
                self.pause(delay).await;
            }
            attempts += 1;

            debug!(attempt = attempts, max_attempts, "Snapshot upload attempt");

            match self.target.replace(&object_name, &body).await {
                Ok(()) => {
                    info!(
                        object = %object_name,
                        size = body.len(),
                        attempt = attempts,
                        "Stored snapshot"
                    );
                    return Ok(Stored {
                        object_name,
                        byte_size: body.len(),
                        attempts,
                        event,
                    });
                }
                Err(e) if classify(&e) == FailureKind::Transient => {
                    warn!(
                        attempt = attempts,
                        max_attempts,
                        error = %e,
                        "Transient storage error"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(attempt = attempts, error = %e, "Non-retryable storage error");
                    return Err(WriteError::StorageRejected(e));
                }
            }
        }

        let last_error = match last_error {
            Some(e) => e,
            None => StoreError::Transport("no attempt was made".to_string()),
        };
        warn!(
            attempts,
            error = %last_error,
            "All snapshot upload attempts failed"
        );
        Err(WriteError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    /// Wait between attempts. Shutdown ends the wait early; the loop then
    /// carries on with its next attempt.
    async fn pause(&self, delay: Duration) {
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before retry");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => {
                warn!("Retry delay interrupted");
            }
        }
    }
}
