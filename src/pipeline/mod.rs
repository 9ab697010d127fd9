//! Change detection and fan-out for favorited products.
//!
//! One bus delivery is one batch. Every item goes through
//! classify → persist (if changed) → fan out (if the price dropped), and each
//! item's failure stays with that item. Only an undecodable payload fails the
//! whole delivery.

pub mod classify;
pub mod fanout;
pub mod persist;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::bus::Publisher;
use crate::db::ChangeStore;
use crate::gateway::NotificationGateway;
use crate::model::{ChangeSet, PersistedProduct};
use crate::snapshot::{self, DecodeError, ProductSnapshot};

pub use classify::{classify, Classification};
pub use fanout::{fan_out, DispatchStatus, FanOutReport, NotificationOutcome};
pub use persist::persist_change;

/// Terminal state of one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Created { favorited_on_arrival: bool },
    /// Unchanged; nothing written.
    Discarded,
    /// Persisted, no price drop.
    Done { change: ChangeSet },
    FannedOut { change: ChangeSet, report: FanOutReport },
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub product_id: Option<u32>,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub created: usize,
    pub discarded: usize,
    pub done: usize,
    pub fanned_out: usize,
    pub skipped: usize,
    pub failed: usize,
    pub notifications_delivered: usize,
    pub notifications_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub items: Vec<ItemReport>,
    /// Newly created, already-favorited products handed to the favorites topic.
    pub forwarded: usize,
    pub forward_error: Option<String>,
}

impl BatchReport {
    pub fn summary(&self) -> BatchSummary {
        let mut s = BatchSummary::default();
        for item in &self.items {
            match &item.outcome {
                ItemOutcome::Created { .. } => s.created += 1,
                ItemOutcome::Discarded => s.discarded += 1,
                ItemOutcome::Done { .. } => s.done += 1,
                ItemOutcome::FannedOut { report, .. } => {
                    s.fanned_out += 1;
                    s.notifications_delivered += report.delivered();
                    s.notifications_failed += report.failed();
                }
                ItemOutcome::Skipped { .. } => s.skipped += 1,
                ItemOutcome::Failed { .. } => s.failed += 1,
            }
        }
        s
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub favorites_topic: String,
    /// Upper bound for a single gateway dispatch; hitting it counts as a failure.
    pub dispatch_deadline: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            favorites_topic: crate::config::DEFAULT_FAVORITES_TOPIC.to_string(),
            dispatch_deadline: Duration::from_secs(5),
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn ChangeStore>,
    gateway: Arc<dyn NotificationGateway>,
    publisher: Arc<dyn Publisher>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ChangeStore>,
        gateway: Arc<dyn NotificationGateway>,
        publisher: Arc<dyn Publisher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            publisher,
            settings,
        }
    }

    /// Entry point for one bus delivery.
    pub async fn handle_delivery(&self, payload: &[u8]) -> Result<BatchReport, DecodeError> {
        let batch_id = Uuid::new_v4();
        let span = info_span!("batch", %batch_id);
        async move {
            let items = match snapshot::decode_batch(payload) {
                Ok(items) => items,
                Err(err) => {
                    error!(?err, bytes = payload.len(), "dropping undecodable batch");
                    return Err(err);
                }
            };
            info!(items = items.len(), "batch received");
            let report = self.process_batch(batch_id, items).await;
            info!(summary = ?report.summary(), forwarded = report.forwarded, "batch processed");
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Process already-decoded items strictly in order.
    pub async fn process_batch(&self, batch_id: Uuid, items: Vec<Value>) -> BatchReport {
        let mut reports = Vec::with_capacity(items.len());
        let mut favorited_on_arrival: Vec<ProductSnapshot> = Vec::new();

        for raw in items {
            let product_id = snapshot::raw_id(&raw);
            let outcome = self
                .process_item(product_id, raw, &mut favorited_on_arrival)
                .await;
            reports.push(ItemReport {
                product_id,
                outcome,
            });
        }

        let forwarded = favorited_on_arrival.len();
        let forward_error = if forwarded > 0 {
            self.forward_favorited(&favorited_on_arrival).await.err()
        } else {
            None
        };

        BatchReport {
            batch_id,
            items: reports,
            forwarded: if forward_error.is_some() { 0 } else { forwarded },
            forward_error,
        }
    }

    #[instrument(skip_all, fields(product_id = ?product_id))]
    async fn process_item(
        &self,
        product_id: Option<u32>,
        raw: Value,
        favorited_on_arrival: &mut Vec<ProductSnapshot>,
    ) -> ItemOutcome {
        let mut snap = match ProductSnapshot::from_value(raw) {
            Ok(snap) => snap,
            Err(err) => {
                warn!(%err, "skipping unparseable snapshot");
                return ItemOutcome::Skipped {
                    reason: err.to_string(),
                };
            }
        };

        let stored = match self.store.find_product(snap.id).await {
            Ok(stored) => stored,
            Err(err) => {
                error!(?err, product_id = snap.id, "product lookup failed");
                return ItemOutcome::Failed {
                    reason: format!("product lookup: {err:#}"),
                };
            }
        };
        let persisted = match stored.map(PersistedProduct::try_from).transpose() {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(%err, product_id = snap.id, "stored product does not parse; skipping");
                return ItemOutcome::Skipped {
                    reason: format!("stored {err}"),
                };
            }
        };

        match classify(&mut snap, persisted.as_ref()) {
            Classification::New => self.create(snap, favorited_on_arrival).await,
            Classification::Unchanged => {
                info!(product_id = snap.id, "unchanged");
                ItemOutcome::Discarded
            }
            Classification::Changed(change) | Classification::OutOfStock(change) => {
                if let Err(err) = persist_change(self.store.as_ref(), &change, &snap).await {
                    error!(?err, product_id = snap.id, "failed to persist change");
                    return ItemOutcome::Failed {
                        reason: format!("persist: {err:#}"),
                    };
                }
                if !change.is_price_drop() {
                    return ItemOutcome::Done { change };
                }
                let report = fan_out(
                    self.store.as_ref(),
                    self.gateway.as_ref(),
                    &change,
                    &snap.name,
                    self.settings.dispatch_deadline,
                )
                .await;
                ItemOutcome::FannedOut { change, report }
            }
        }
    }

    async fn create(
        &self,
        snap: ProductSnapshot,
        favorited_on_arrival: &mut Vec<ProductSnapshot>,
    ) -> ItemOutcome {
        if let Err(err) = self.store.create_product(&snap).await {
            error!(?err, product_id = snap.id, "failed to create product");
            return ItemOutcome::Failed {
                reason: format!("create: {err:#}"),
            };
        }
        info!(product_id = snap.id, name = %snap.name, "new product created");

        if !(snap.is_active && snap.is_favorite) {
            return ItemOutcome::Created {
                favorited_on_arrival: false,
            };
        }
        let fans = match self.store.count_favorites_by_product(snap.id).await {
            Ok(n) => n,
            Err(err) => {
                warn!(?err, product_id = snap.id, "favorite count failed after create");
                0
            }
        };
        if fans == 0 {
            return ItemOutcome::Created {
                favorited_on_arrival: false,
            };
        }
        // There is no previous price to compare, so this never fans out here.
        warn!(
            product_id = snap.id,
            fans, "new product already has favorites; forwarding to favorites topic"
        );
        favorited_on_arrival.push(snap);
        ItemOutcome::Created {
            favorited_on_arrival: true,
        }
    }

    async fn forward_favorited(&self, products: &[ProductSnapshot]) -> Result<(), String> {
        let payload = serde_json::to_vec(products).map_err(|err| {
            error!(?err, "failed to encode favorited products");
            err.to_string()
        })?;
        match self
            .publisher
            .publish(&self.settings.favorites_topic, payload)
            .await
        {
            Ok(()) => {
                info!(count = products.len(), topic = %self.settings.favorites_topic, "forwarded favorited products");
                Ok(())
            }
            Err(err) => {
                error!(?err, topic = %self.settings.favorites_topic, "failed to forward favorited products");
                Err(format!("{err:#}"))
            }
        }
    }
}
