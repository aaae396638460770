//! REST client for the notification endpoints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::notifications::models::Notification;
use crate::token::TokenSource;

/// Thin wrapper over the backend's notification REST API.
///
/// Every call reads the current bearer token from the token source, so
/// rotation needs no coordination with in-flight requests.
pub struct NotificationsApi {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl NotificationsApi {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            tokens,
        })
    }

    /// Fetch one page of notification history, newest first.
    pub async fn fetch(&self, page: u32, limit: u32) -> Result<Vec<Notification>> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/api/notifications", self.base_url);
        debug!("Fetching notifications page {page} (limit {limit})");

        let response = self
            .client
            .get(&url)
            .query(&[("limit", limit), ("page", page)])
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()
            .context("Notification fetch rejected by server")?;

        response
            .json()
            .await
            .context("Failed to parse notification list")
    }

    /// Mark one notification as read on the server.
    pub async fn mark_read(&self, id: &str) -> Result<()> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/api/notifications/read/{}", self.base_url, id);

        self.client
            .put(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()
            .with_context(|| format!("Mark-read rejected for notification {}", id))?;
        Ok(())
    }

    /// Mark every notification as read on the server.
    pub async fn mark_all_read(&self) -> Result<()> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/api/notifications/read-all", self.base_url);

        self.client
            .put(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()
            .context("Mark-all-read rejected by server")?;
        Ok(())
    }
}
