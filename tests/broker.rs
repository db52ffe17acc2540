//! Event broker integration tests against the in-memory stream store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use entity_sync::broker::handler_fn;
use entity_sync::storage::memory_stream::InMemoryStreamStore;
use entity_sync::{BrokerError, Event, EventBroker, Registry, StreamStore};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    note: String,
}

fn broker() -> EventBroker {
    let mut registry = Registry::new();
    registry
        .register_redis("default")
        .register_redis("events")
        .register_stream("orders", "events", &["billing", "shipping"])
        .register_stream("audit", "default", &["archiver"]);
    let registry = Arc::new(registry.validate().unwrap());

    let mut stores: HashMap<String, Arc<dyn StreamStore>> = HashMap::new();
    stores.insert("default".into(), Arc::new(InMemoryStreamStore::new()));
    stores.insert("events".into(), Arc::new(InMemoryStreamStore::new()));
    EventBroker::new(registry, stores)
}

async fn group_pending(broker: &EventBroker, stream: &str, group: &str) -> u64 {
    let stats = broker.stream_statistics(&[stream]).await.unwrap();
    stats[0]
        .groups
        .iter()
        .find(|g| g.group == group)
        .map_or(0, |g| g.pending)
}

#[tokio::test]
async fn test_large_batch_is_fully_acknowledged() {
    let broker = broker();
    let mut flusher = broker.new_flusher();
    for i in 0..10_001u64 {
        flusher
            .publish(
                "orders",
                &Order {
                    id: i,
                    note: String::new(),
                },
            )
            .unwrap();
    }
    assert_eq!(flusher.flush().await.unwrap().len(), 10_001);

    let mut consumer = broker.consumer("billing").unwrap();
    consumer.disable_block_mode();
    let (_tx, rx) = watch::channel(false);
    let seen = AtomicUsize::new(0);
    let handler = handler_fn(|events: &[Event]| {
        seen.fetch_add(events.len(), Ordering::SeqCst);
        Ok(())
    });
    assert!(consumer.consume(rx.clone(), 11_000, &handler).await.unwrap());
    assert_eq!(seen.load(Ordering::SeqCst), 10_001);
    assert_eq!(group_pending(&broker, "orders", "billing").await, 0);
    assert!(!consumer.consume(rx, 11_000, &handler).await.unwrap());
}

#[tokio::test]
async fn test_panicking_handler_leaves_batch_pending() {
    let broker = broker();
    for i in 0..25u64 {
        broker
            .publish(
                "orders",
                &Order {
                    id: i,
                    note: "x".into(),
                },
            )
            .await
            .unwrap();
    }
    let mut consumer = broker.consumer("shipping").unwrap();
    consumer.disable_block_mode();
    let (_tx, rx) = watch::channel(false);

    let panicking = handler_fn(|_: &[Event]| panic!("shipping handler exploded"));
    let err = consumer.consume(rx.clone(), 10, &panicking).await.unwrap_err();
    assert!(matches!(err, BrokerError::HandlerPanicked(ref m) if m.contains("exploded")));
    assert_eq!(group_pending(&broker, "orders", "shipping").await, 10);

    // The same consumer gets its unacknowledged batch back first.
    let redelivered = parking_lot::Mutex::new(Vec::new());
    let handler = handler_fn(|events: &[Event]| {
        for event in events {
            redelivered.lock().push(event.deserialize::<Order>()?.id);
        }
        Ok(())
    });
    assert!(consumer.consume(rx, 10, &handler).await.unwrap());
    assert_eq!(*redelivered.lock(), (0..10).collect::<Vec<u64>>());
    assert_eq!(group_pending(&broker, "orders", "shipping").await, 0);
}

#[tokio::test]
async fn test_groups_read_independently() {
    let broker = broker();
    for i in 0..3u64 {
        broker
            .publish(
                "orders",
                &Order {
                    id: i,
                    note: String::new(),
                },
            )
            .await
            .unwrap();
    }
    let (_tx, rx) = watch::channel(false);
    for group in ["billing", "shipping"] {
        let mut consumer = broker.consumer(group).unwrap();
        consumer.disable_block_mode();
        let ids = parking_lot::Mutex::new(Vec::new());
        let handler = handler_fn(|events: &[Event]| {
            for event in events {
                ids.lock().push(event.deserialize::<Order>()?.id);
            }
            Ok(())
        });
        assert!(consumer.consume(rx.clone(), 100, &handler).await.unwrap());
        assert_eq!(*ids.lock(), vec![0, 1, 2]);
    }
}

#[tokio::test]
async fn test_large_payloads_survive_compression() {
    let broker = broker();
    let order = Order {
        id: 7,
        note: "lorem ipsum ".repeat(200),
    };
    broker.publish("orders", &order).await.unwrap();

    let mut consumer = broker.consumer("billing").unwrap();
    consumer.disable_block_mode();
    let (_tx, rx) = watch::channel(false);
    let received = parking_lot::Mutex::new(None);
    let handler = handler_fn(|events: &[Event]| {
        *received.lock() = Some(events[0].deserialize::<Order>()?);
        assert!(events[0].meta().published_at > 0);
        Ok(())
    });
    consumer.consume(rx, 10, &handler).await.unwrap();
    assert_eq!(received.lock().take(), Some(order));
}

#[tokio::test]
async fn test_statistics_cover_every_stream() {
    let broker = broker();
    broker.publish("audit", "login").await.unwrap();
    let mut stats = broker.streams_statistics().await.unwrap();
    stats.sort_by(|a, b| a.stream.cmp(&b.stream));
    let names: Vec<&str> = stats.iter().map(|s| s.stream.as_str()).collect();
    assert!(names.contains(&"audit"));
    assert!(names.contains(&"orders"));
    let audit = stats.iter().find(|s| s.stream == "audit").unwrap();
    assert_eq!(audit.len, 1);
    assert_eq!(audit.redis_pool, "default");
}
