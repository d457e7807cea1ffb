//! End-to-end ingestion: publisher -> channel queue -> ingestor -> filesystem store.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use order_reserver::event::{Order, OrderEvent, OrderItem};
use order_reserver::handlers::QueueIngestor;
use order_reserver::publisher::OrderPublisher;
use order_reserver::queue::{ChannelQueue, Queue, QueueConfig, QueueMessage};
use order_reserver::store::{FilesystemObjectStore, ObjectStore, SnapshotTarget};
use order_reserver::utils::retry::RetryPolicy;
use order_reserver::writer::SnapshotWriter;

const CONTAINER: &str = "order-items";

struct Pipeline {
    queue: Arc<ChannelQueue>,
    store: Arc<FilesystemObjectStore>,
    _dir: TempDir,
}

async fn pipeline(max_delivery_count: u32) -> Pipeline {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FilesystemObjectStore::new(dir.path()).await.unwrap());
    let writer = SnapshotWriter::new(SnapshotTarget::new(store.clone(), CONTAINER))
        .with_policy(RetryPolicy::new(3, Duration::from_millis(10)));

    let queue = Arc::new(ChannelQueue::new(&QueueConfig {
        max_delivery_count,
        ..Default::default()
    }));
    queue
        .subscribe(Arc::new(QueueIngestor::new(Some(Arc::new(writer)))))
        .await
        .unwrap();

    Pipeline {
        queue,
        store,
        _dir: dir,
    }
}

async fn wait_for_snapshot(store: &FilesystemObjectStore, name: &str) -> OrderEvent {
    // Replacement deletes before writing, so the object may briefly vanish.
    for _ in 0..200 {
        if let Ok(body) = store.get(CONTAINER, name).await {
            return OrderEvent::from_json(&body).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("snapshot {} never appeared", name);
}

fn order(email: &str) -> Order {
    Order {
        id: "68FAE9B1D86B794F0AE0ADD35A437428".to_string(),
        email: Some(email.to_string()),
        session_id: None,
        products: vec![OrderItem {
            product_id: Some(7),
            name: Some("Catnip".to_string()),
            quantity: 3,
            price: 2.5,
            category: Some("Cat Toys".to_string()),
            photo_url: None,
        }],
    }
}

#[tokio::test]
async fn test_published_order_lands_in_store() {
    let pipeline = pipeline(3).await;
    let publisher = OrderPublisher::new(pipeline.queue.clone());

    publisher.publish(&order("buyer@example.com"), Some("abc")).await;

    let snapshot = wait_for_snapshot(&pipeline.store, "session-abc.json").await;
    assert_eq!(snapshot.session_id.as_deref(), Some("abc"));
    assert_eq!(
        snapshot.order_id.as_deref(),
        Some("68FAE9B1D86B794F0AE0ADD35A437428")
    );
    assert_eq!(snapshot.email.as_deref(), Some("buyer@example.com"));
    assert_eq!(snapshot.total, 7.5);
    assert!(snapshot.timestamp.is_some());
}

#[tokio::test]
async fn test_minimal_message_is_filled_in() {
    let pipeline = pipeline(3).await;

    pipeline
        .queue
        .send(QueueMessage::json(
            "abc-1",
            br#"{"sessionId":"abc","orderId":null,"total":19.99}"#.to_vec(),
        ))
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&pipeline.store, "session-abc.json").await;
    assert!(!snapshot.order_id.unwrap().is_empty());
    assert!(snapshot.timestamp.is_some());
    assert_eq!(snapshot.total, 19.99);
}

#[tokio::test]
async fn test_later_update_replaces_snapshot() {
    let pipeline = pipeline(3).await;
    let publisher = OrderPublisher::new(pipeline.queue.clone());

    publisher.publish(&order("first@example.com"), Some("abc")).await;
    let first = wait_for_snapshot(&pipeline.store, "session-abc.json").await;
    assert_eq!(first.email.as_deref(), Some("first@example.com"));

    publisher.publish(&order("second@example.com"), Some("abc")).await;
    for _ in 0..200 {
        let current = wait_for_snapshot(&pipeline.store, "session-abc.json").await;
        if current.email.as_deref() == Some("second@example.com") {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("snapshot was not replaced");
}

#[tokio::test]
async fn test_poison_message_is_dead_lettered() {
    let pipeline = pipeline(2).await;
    let mut dead_letters = pipeline.queue.take_dead_letters().await.unwrap();

    pipeline
        .queue
        .send(QueueMessage::json("bad-1", b"{\"total\":5}".to_vec()))
        .await
        .unwrap();

    let dead = tokio::time::timeout(Duration::from_secs(5), dead_letters.recv())
        .await
        .expect("Timed out waiting for dead letter")
        .expect("Channel closed");

    assert_eq!(dead.message.message_id, "bad-1");
    assert_eq!(dead.delivery_count, 2);
    assert!(dead.reason.contains("sessionId"));
    assert!(!pipeline.store.container_exists(CONTAINER).await.unwrap());
}
