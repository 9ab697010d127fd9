use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use pricewatch::bus::{run_consumer, ChannelBus, Publisher};
use pricewatch::db::{self, SqliteStore};
use pricewatch::gateway::{NotificationGateway, NotificationRequest, NotificationResponse};
use pricewatch::pipeline::{Pipeline, PipelineSettings};
use pricewatch::scheduler::{PollScheduler, SnapshotSource};

const TOPIC: &str = "FAVORITE_PRODUCTS";

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
struct RecordingGateway {
    calls: Arc<Mutex<Vec<NotificationRequest>>>,
}

#[async_trait::async_trait]
impl NotificationGateway for RecordingGateway {
    async fn send(&self, request: &NotificationRequest) -> Result<NotificationResponse> {
        self.calls.lock().await.push(request.clone());
        Ok(NotificationResponse { success: true })
    }
}

#[derive(Clone, Default)]
struct RecordingPublisher {
    messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

#[async_trait::async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.messages.lock().await.push((topic.to_string(), payload));
        Ok(())
    }
}

/// Canned snapshots keyed by product id; unknown ids error.
#[derive(Default)]
struct FakeSource {
    snapshots: HashMap<u32, Option<Value>>,
    fetched: Mutex<Vec<u32>>,
}

#[async_trait::async_trait]
impl SnapshotSource for FakeSource {
    async fn fetch(&self, product_id: u32) -> Result<Option<Value>> {
        self.fetched.lock().await.push(product_id);
        self.snapshots
            .get(&product_id)
            .cloned()
            .ok_or_else(|| anyhow!("source returned 503"))
    }
}

fn snap(id: u32, price: f64, stock: i64) -> Value {
    json!({
        "id": id,
        "name": format!("Product {id}"),
        "priceInfo": {"originalPrice": price, "discountedPrice": price},
        "stockInfo": {"stock": stock},
        "isActive": true,
        "isFavorite": true
    })
}

async fn seed(pool: &sqlx::SqlitePool, items: &[Value]) {
    let pipeline = Pipeline::new(
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(RecordingGateway::default()),
        Arc::new(RecordingPublisher::default()),
        PipelineSettings::default(),
    );
    let payload = serde_json::to_vec(items).unwrap();
    pipeline.handle_delivery(&payload).await.unwrap();
}

#[tokio::test]
async fn consumer_drains_queue_including_its_own_forwards() {
    let pool = setup_pool().await;
    let uid = db::get_or_create_user(&pool, "a@example.com", None, None)
        .await
        .unwrap();
    db::add_favorite(&pool, uid, 1).await.unwrap();

    let (bus, receiver) = ChannelBus::new(TOPIC);
    let gateway = RecordingGateway::default();
    let pipeline = Pipeline::new(
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(gateway.clone()),
        Arc::new(bus.clone()),
        PipelineSettings {
            favorites_topic: TOPIC.into(),
            dispatch_deadline: Duration::from_secs(1),
        },
    );

    bus.publish(TOPIC, serde_json::to_vec(&[snap(1, 10.0, 3)]).unwrap())
        .await
        .unwrap();
    bus.publish(TOPIC, b"not json".to_vec()).await.unwrap();
    bus.publish(TOPIC, serde_json::to_vec(&[snap(1, 8.0, 3)]).unwrap())
        .await
        .unwrap();

    let stats = run_consumer(receiver, &pipeline, std::future::ready(())).await;

    // Product 1 arrives already favorited, so its own forward is consumed last.
    // That copy still carries the 10.00 price and is applied as a change.
    assert_eq!(stats.deliveries, 4);
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.totals.created, 1);
    assert_eq!(stats.totals.fanned_out, 1);
    assert_eq!(stats.totals.done, 1);
    assert_eq!(stats.totals.notifications_delivered, 1);
    assert_eq!(db::change_history(&pool, 1).await.unwrap().len(), 2);

    let calls = gateway.calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].message, "Price dropped from 10.00 to 8.00 for Product 1!");
}

#[tokio::test]
async fn consumer_stops_when_all_senders_are_gone() {
    let pool = setup_pool().await;
    let (bus, receiver) = ChannelBus::new(TOPIC);
    bus.publish(TOPIC, b"[]".to_vec()).await.unwrap();
    drop(bus);

    let pipeline = Pipeline::new(
        Arc::new(SqliteStore::new(pool)),
        Arc::new(RecordingGateway::default()),
        Arc::new(RecordingPublisher::default()),
        PipelineSettings::default(),
    );
    let stats = run_consumer(receiver, &pipeline, std::future::pending()).await;
    assert_eq!(stats.deliveries, 1);
    assert_eq!(stats.decode_failures, 0);
}

#[tokio::test]
async fn tick_publishes_only_active_favorited_products() {
    let pool = setup_pool().await;
    let mut inactive = snap(3, 5.0, 1);
    inactive["isActive"] = json!(false);
    seed(&pool, &[snap(1, 10.0, 1), snap(2, 20.0, 2), inactive]).await;
    for (email, pid) in [("a@example.com", 1), ("b@example.com", 2), ("c@example.com", 3)] {
        let uid = db::get_or_create_user(&pool, email, None, None).await.unwrap();
        db::add_favorite(&pool, uid, pid).await.unwrap();
    }

    let source = Arc::new(FakeSource {
        snapshots: HashMap::from([(1, Some(snap(1, 9.0, 1)))]),
        ..Default::default()
    });
    let publisher = RecordingPublisher::default();
    let scheduler = PollScheduler::new(
        Arc::new(SqliteStore::new(pool.clone())),
        source.clone(),
        Arc::new(publisher.clone()),
        TOPIC,
        Duration::from_secs(3600),
    );

    // Product 2 fails to fetch and is left out; product 3 is inactive.
    assert_eq!(scheduler.tick().await.unwrap(), 1);
    assert_eq!(*source.fetched.lock().await, vec![1, 2]);

    let messages = publisher.messages.lock().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, TOPIC);
    let batch: Value = serde_json::from_slice(&messages[0].1).unwrap();
    assert_eq!(batch, json!([snap(1, 9.0, 1)]));
}

#[tokio::test]
async fn tick_with_nothing_to_watch_publishes_nothing() {
    let pool = setup_pool().await;
    let publisher = RecordingPublisher::default();
    let scheduler = PollScheduler::new(
        Arc::new(SqliteStore::new(pool)),
        Arc::new(FakeSource::default()),
        Arc::new(publisher.clone()),
        TOPIC,
        Duration::from_secs(3600),
    );
    assert_eq!(scheduler.tick().await.unwrap(), 0);
    assert!(publisher.messages.lock().await.is_empty());
}

#[tokio::test]
async fn started_scheduler_ticks_immediately_and_stops() {
    let pool = setup_pool().await;
    seed(&pool, &[snap(1, 10.0, 1)]).await;
    let uid = db::get_or_create_user(&pool, "a@example.com", None, None)
        .await
        .unwrap();
    db::add_favorite(&pool, uid, 1).await.unwrap();

    let publisher = RecordingPublisher::default();
    let handle = PollScheduler::new(
        Arc::new(SqliteStore::new(pool)),
        Arc::new(FakeSource {
            snapshots: HashMap::from([(1, Some(snap(1, 10.0, 1)))]),
            ..Default::default()
        }),
        Arc::new(publisher.clone()),
        TOPIC,
        Duration::from_secs(3600),
    )
    .start();

    let published = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !publisher.messages.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(published.is_ok(), "first tick never published");

    handle.stop().await;
    assert_eq!(publisher.messages.lock().await.len(), 1);
}
