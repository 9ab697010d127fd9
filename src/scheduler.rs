//! Periodic refresh of favorited products.
//!
//! Each tick reads the products worth watching from the store, fetches a fresh
//! snapshot of each one in turn, and publishes the lot as a single batch on the
//! favorites topic. The scheduler owns no global state: it is started and
//! stopped through the handle it returns.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::Publisher;
use crate::db::ChangeStore;

/// Where fresh product snapshots come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// `Ok(None)` when the source no longer knows the product.
    async fn fetch(&self, product_id: u32) -> Result<Option<Value>>;
}

#[derive(Clone)]
pub struct HttpSnapshotSource {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpSnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSnapshotSource")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpSnapshotSource {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("pricewatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build snapshot source client")?;
        Ok(Self { http, base_url })
    }

    pub fn product_url(&self, product_id: u32) -> Result<Url> {
        self.base_url
            .join(&format!("products/{product_id}"))
            .context("invalid snapshot source base URL")
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, product_id: u32) -> Result<Option<Value>> {
        let res = self
            .http
            .get(self.product_url(product_id)?)
            .send()
            .await
            .context("failed to reach snapshot source")?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("snapshot source error {}: {}", status, body));
        }
        let value = res.json().await.context("invalid snapshot JSON")?;
        Ok(Some(value))
    }
}

pub struct PollScheduler {
    store: Arc<dyn ChangeStore>,
    source: Arc<dyn SnapshotSource>,
    publisher: Arc<dyn Publisher>,
    topic: String,
    interval: Duration,
}

impl PollScheduler {
    pub fn new(
        store: Arc<dyn ChangeStore>,
        source: Arc<dyn SnapshotSource>,
        publisher: Arc<dyn Publisher>,
        topic: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            source,
            publisher,
            topic: topic.into(),
            interval,
        }
    }

    /// Run one refresh. Returns the number of snapshots published.
    pub async fn tick(&self) -> Result<usize> {
        let ids = self
            .store
            .active_favorited_product_ids()
            .await
            .context("failed to list favorited products")?;
        if ids.is_empty() {
            info!("no active favorited products");
            return Ok(0);
        }

        let mut snapshots = Vec::with_capacity(ids.len());
        for product_id in ids {
            match self.source.fetch(product_id).await {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => warn!(product_id, "source no longer lists product"),
                Err(err) => warn!(?err, product_id, "failed to fetch product"),
            }
        }
        if snapshots.is_empty() {
            info!("nothing fetched");
            return Ok(0);
        }

        let count = snapshots.len();
        let payload = serde_json::to_vec(&snapshots).context("encode snapshots")?;
        self.publisher.publish(&self.topic, payload).await?;
        info!(count, topic = %self.topic, "published refreshed favorites");
        Ok(count)
    }

    /// Spawn the ticking loop. The first tick fires immediately.
    pub fn start(self) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            info!(interval = ?self.interval, "scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.tick().await {
                            error!(?err, "scheduled refresh failed");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            info!("scheduler stopped");
        });
        SchedulerHandle { stop_tx, task }
    }
}

pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for an in-flight refresh to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(err) = self.task.await {
            error!(?err, "scheduler task panicked");
        }
    }
}
