//! Order Reserver - order-update ingestion pipeline
//!
//! The order service publishes order-change events to a queue; the reserver
//! consumes them and keeps one JSON snapshot per shopping session in object
//! storage. A synchronous HTTP ingress performs the same store inline.
//!
//! ```text
//! [OrderPublisher] -> [Queue] -> [QueueIngestor] -> [SnapshotWriter] -> [ObjectStore]
//!                                                          ^
//!                            [HTTP DirectEndpoint] --------+
//! ```

pub mod config;
pub mod event;
pub mod handlers;
pub mod publisher;
pub mod queue;
pub mod store;
pub mod utils;
pub mod writer;
