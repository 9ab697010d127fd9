//! In-process message bus and the single-threaded consumer loop.
//!
//! Deliveries are handled one at a time: a batch is fully processed before the
//! next message is taken off the channel. Nothing is acknowledged or replayed;
//! a delivery that fails to decode is logged and gone.

use std::future::Future;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::pipeline::{BatchSummary, Pipeline};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Single-topic bus backed by an unbounded tokio channel.
///
/// Unbounded so the consumer can publish onto its own topic without waiting
/// on itself.
#[derive(Debug, Clone)]
pub struct ChannelBus {
    topic: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

impl ChannelBus {
    pub fn new(topic: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<BusMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let topic = topic.into();
        info!(%topic, "channel bus initialized");
        (Self { topic, sender }, receiver)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Publisher for ChannelBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if topic != self.topic {
            return Err(anyhow!("unknown topic {topic}; this bus carries {}", self.topic));
        }
        self.sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| anyhow!("bus consumer has shut down"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub deliveries: usize,
    pub decode_failures: usize,
    pub totals: BatchSummary,
}

impl ConsumerStats {
    fn absorb(&mut self, s: &BatchSummary) {
        let t = &mut self.totals;
        t.created += s.created;
        t.discarded += s.discarded;
        t.done += s.done;
        t.fanned_out += s.fanned_out;
        t.skipped += s.skipped;
        t.failed += s.failed;
        t.notifications_delivered += s.notifications_delivered;
        t.notifications_failed += s.notifications_failed;
    }
}

/// Feed deliveries to the pipeline until `shutdown` resolves and the channel
/// has nothing ready, or until every sender is gone.
pub async fn run_consumer<F>(
    mut receiver: mpsc::UnboundedReceiver<BusMessage>,
    pipeline: &Pipeline,
    shutdown: F,
) -> ConsumerStats
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut stats = ConsumerStats::default();
    loop {
        let msg = tokio::select! {
            biased;
            msg = receiver.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = &mut shutdown => break,
        };
        info!(topic = %msg.topic, bytes = msg.payload.len(), "received message");
        stats.deliveries += 1;
        match pipeline.handle_delivery(&msg.payload).await {
            Ok(report) => stats.absorb(&report.summary()),
            Err(err) => {
                warn!(%err, topic = %msg.topic, "delivery discarded");
                stats.decode_failures += 1;
            }
        }
    }
    info!(deliveries = stats.deliveries, decode_failures = stats.decode_failures, "consumer stopped");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_rejects_foreign_topic() {
        let (bus, mut rx) = ChannelBus::new("FAVORITE_PRODUCTS");
        assert!(bus.publish("OTHER", b"[]".to_vec()).await.is_err());
        bus.publish("FAVORITE_PRODUCTS", b"[]".to_vec()).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "FAVORITE_PRODUCTS");
        assert_eq!(msg.payload, b"[]");
    }

    #[tokio::test]
    async fn publish_after_receiver_dropped_fails() {
        let (bus, rx) = ChannelBus::new("T");
        drop(rx);
        assert!(bus.publish("T", Vec::new()).await.is_err());
    }
}
