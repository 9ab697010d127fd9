use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Decimal user id, as the gateway expects it.
    pub user_id: String,
    pub product_id: u32,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub success: bool,
}

/// Delivers one notification to one user.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<NotificationResponse>;
}

#[derive(Clone)]
pub struct HttpGateway {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpGateway {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("pricewatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build gateway http client")?;
        Ok(Self { http, base_url })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.gateway.base_url).context("invalid gateway.base_url")?;
        Self::new(base_url, cfg.gateway.timeout())
    }

    pub fn build_request(&self, request: &NotificationRequest) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v1/notifications")
            .context("invalid gateway base URL")?;
        self.http
            .post(endpoint)
            .json(request)
            .build()
            .context("failed to build notification request")
    }
}

#[async_trait]
impl NotificationGateway for HttpGateway {
    async fn send(&self, request: &NotificationRequest) -> Result<NotificationResponse> {
        let req = self.build_request(request)?;
        debug!(url = %req.url(), user_id = %request.user_id, product_id = request.product_id, "dispatching notification");
        let res = self
            .http
            .execute(req)
            .await
            .context("failed to reach notification gateway")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("gateway error {}: {}", status, body));
        }
        res.json::<NotificationResponse>()
            .await
            .context("invalid gateway response JSON")
    }
}
