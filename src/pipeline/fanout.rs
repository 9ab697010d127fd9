use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::db::ChangeStore;
use crate::gateway::{NotificationGateway, NotificationRequest};
use crate::model::ChangeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DispatchStatus {
    Delivered,
    /// The gateway answered `success: false`.
    Rejected,
    UserMissing,
    Failed(String),
}

/// Result of one dispatch attempt. Lives only as long as the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationOutcome {
    pub user_id: i64,
    pub product_id: u32,
    pub status: DispatchStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub product_id: u32,
    pub attempts: Vec<NotificationOutcome>,
    /// Set when the favorites lookup failed and nobody was tried.
    pub abandoned: Option<String>,
}

impl FanOutReport {
    pub fn delivered(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status == DispatchStatus::Delivered)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.attempts.len() - self.delivered()
    }
}

pub fn price_drop_message(old_price: f64, new_price: f64, product_name: &str) -> String {
    format!("Price dropped from {old_price:.2} to {new_price:.2} for {product_name}!")
}

/// Notify every user who favorited the product about a price drop.
///
/// One user's failure never stops the others. Only a failed favorites lookup
/// abandons the whole product.
#[instrument(skip_all, fields(product_id = change.product_id))]
pub async fn fan_out(
    store: &dyn ChangeStore,
    gateway: &dyn NotificationGateway,
    change: &ChangeSet,
    product_name: &str,
    deadline: Duration,
) -> FanOutReport {
    let product_id = change.product_id;
    let mut report = FanOutReport {
        product_id,
        attempts: Vec::new(),
        abandoned: None,
    };

    let favorites = match store.find_favorites_by_product(product_id).await {
        Ok(favorites) => favorites,
        Err(err) => {
            warn!(?err, product_id, "favorites lookup failed; abandoning fan-out");
            report.abandoned = Some(format!("{err:#}"));
            return report;
        }
    };

    let message = price_drop_message(change.old_price, change.new_price, product_name);
    for favorite in favorites {
        let user_id = favorite.user_id;
        let status = dispatch_one(store, gateway, user_id, product_id, &message, deadline).await;
        match &status {
            DispatchStatus::Delivered => info!(user_id, product_id, "notification delivered"),
            DispatchStatus::Rejected => warn!(user_id, product_id, "gateway rejected notification"),
            DispatchStatus::UserMissing => warn!(user_id, product_id, "favoriting user not found"),
            DispatchStatus::Failed(reason) => {
                warn!(user_id, product_id, %reason, "notification dispatch failed")
            }
        }
        report.attempts.push(NotificationOutcome {
            user_id,
            product_id,
            status,
        });
    }
    report
}

async fn dispatch_one(
    store: &dyn ChangeStore,
    gateway: &dyn NotificationGateway,
    user_id: i64,
    product_id: u32,
    message: &str,
    deadline: Duration,
) -> DispatchStatus {
    let user = match store.find_user(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return DispatchStatus::UserMissing,
        Err(err) => return DispatchStatus::Failed(format!("user lookup: {err:#}")),
    };

    let request = NotificationRequest {
        user_id: user.id.to_string(),
        product_id,
        message: message.to_string(),
    };
    match tokio::time::timeout(deadline, gateway.send(&request)).await {
        Ok(Ok(res)) if res.success => DispatchStatus::Delivered,
        Ok(Ok(_)) => DispatchStatus::Rejected,
        Ok(Err(err)) => DispatchStatus::Failed(format!("{err:#}")),
        Err(_) => DispatchStatus::Failed(format!("timed out after {}ms", deadline.as_millis())),
    }
}
