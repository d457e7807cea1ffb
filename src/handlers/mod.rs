//! Ingestion entry points.
//!
//! - `ingest`: queue consumer, one invocation per delivered message
//! - `direct`: synchronous HTTP ingress

pub mod direct;
pub mod ingest;

pub use direct::{DirectEndpoint, DirectResponse};
pub use ingest::{IngestError, QueueIngestor};
