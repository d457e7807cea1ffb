//! Synchronous HTTP ingress.
//!
//! Endpoints:
//! - `POST /api/reserveOrder` or `POST /api/reserve-order`: store an order snapshot
//! - `GET /health`: health check
//!
//! The session id comes from the `x-session-id` header when present, else from
//! the body. Storage runs inline: a single attempt by default, or the writer's
//! full retry loop when `server.direct_retry` is set.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::event::{non_blank, OrderEvent};
use crate::writer::{SnapshotWriter, WriteError};

/// Header carrying the caller's session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Response of the direct endpoint: a status and a plain-text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectResponse {
    pub status: StatusCode,
    pub message: String,
}

impl DirectResponse {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for DirectResponse {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Synchronous order reservation.
pub struct DirectEndpoint {
    writer: Option<Arc<SnapshotWriter>>,
    retry: bool,
}

impl DirectEndpoint {
    pub fn new(writer: Option<Arc<SnapshotWriter>>) -> Self {
        Self {
            writer,
            retry: false,
        }
    }

    /// Use the writer's retry loop instead of a single attempt.
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    #[tracing::instrument(name = "direct.reserve", skip_all, fields(session_id = tracing::field::Empty))]
    pub async fn handle(&self, body: &[u8], header_session: Option<&str>) -> DirectResponse {
        if body.is_empty() {
            return DirectResponse::bad_request("Request body required");
        }

        let mut event = match OrderEvent::from_json(body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Undecodable request body");
                return DirectResponse::bad_request(format!("Invalid request body: {}", e));
            }
        };

        let Some(session_id) = non_blank(header_session)
            .or_else(|| event.session())
            .map(str::to_string)
        else {
            return DirectResponse::bad_request(
                "sessionId required (header x-session-id or body.sessionId)",
            );
        };
        tracing::Span::current().record("session_id", session_id.as_str());

        event.session_id = Some(session_id);
        event.resolve();

        let Some(writer) = self.writer.as_ref() else {
            error!("Storage configuration missing");
            return DirectResponse::server_error("Storage configuration missing");
        };

        let result = if self.retry {
            writer.store(event).await
        } else {
            writer.store_once(event).await
        };

        match result {
            Ok(stored) => {
                info!(object = %stored.object_name, "Order reserved");
                DirectResponse::new(
                    StatusCode::OK,
                    format!("Order reserved and written to blob {}", stored.object_name),
                )
            }
            Err(e) => {
                error!(error = %e, "Order reservation failed");
                DirectResponse::server_error(format!("Error: {}", error_detail(&e)))
            }
        }
    }
}

/// The underlying failure, without the writer's wrapping.
fn error_detail(err: &WriteError) -> String {
    match err {
        WriteError::InvalidInput(message) => message.clone(),
        WriteError::StorageRejected(e) => e.to_string(),
        WriteError::RetriesExhausted { last_error, .. } => last_error.to_string(),
    }
}

/// Shared state for axum handlers.
type AppState = Arc<DirectEndpoint>;

/// Build the axum router (separated for testing).
pub fn router(endpoint: Arc<DirectEndpoint>) -> Router {
    Router::new()
        .route("/api/reserveOrder", post(reserve_order))
        .route("/api/reserve-order", post(reserve_order))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(endpoint)
}

/// Serve the router until `shutdown` is cancelled.
///
/// When `port` is 0, the OS assigns an ephemeral port. The actual bound
/// port is always logged so it can be discovered.
pub async fn serve(
    endpoint: Arc<DirectEndpoint>,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(endpoint);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "HTTP ingress listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP ingress stopped");
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn reserve_order(
    State(endpoint): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> DirectResponse {
    let session = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok());
    endpoint.handle(&body, session).await
}
