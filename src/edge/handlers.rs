//! Built-in HTTP replay handlers.
//!
//! Each handler maps a queued item's operation onto a REST verb against one
//! endpoint:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create | `POST {endpoint}` |
//! | update | `PUT {endpoint}/{record_id}` |
//! | delete | `DELETE {endpoint}/{record_id}` |
//!
//! A delete answered with 404 counts as replayed: the record is already gone.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::queue::{SyncHandler, SyncQueueManager};
use crate::net::{HttpClient, HttpRequest, NoToken, TokenProvider, join_url, record_url};
use crate::storage::{Operation, SyncQueueItem};
use crate::{HuginnError, Result};

/// Tag → endpoint pairs for the built-in handlers.
pub const DEFAULT_HANDLER_ENDPOINTS: &[(&str, &str)] = &[
    ("evaluation-sync", "/api/evaluations"),
    ("beneficiary-sync", "/api/beneficiaries"),
    ("document-upload", "/api/documents"),
    ("notification-sync", "/api/notifications"),
    ("analytics-sync", "/api/analytics/events"),
];

/// Replays queued items as REST calls against one endpoint.
pub struct HttpSyncHandler {
    client: Arc<dyn HttpClient>,
    base_url: String,
    endpoint: String,
    token: Arc<dyn TokenProvider>,
}

impl HttpSyncHandler {
    pub fn new(
        client: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            endpoint: endpoint.into(),
            token: Arc::new(NoToken),
        }
    }

    /// Authenticate requests with tokens from `token`.
    pub fn with_token(mut self, token: Arc<dyn TokenProvider>) -> Self {
        self.token = token;
        self
    }

    fn url(&self, record_id: Option<&str>) -> Result<String> {
        let base = join_url(&self.base_url, &self.endpoint);
        match record_id {
            Some(id) => record_url(&base, id),
            None => Ok(base),
        }
    }

    fn record_id<'a>(&self, item: &'a SyncQueueItem) -> Result<&'a str> {
        item.record_id.as_deref().ok_or_else(|| {
            HuginnError::InvalidInput(format!(
                "{} item {} has no record id",
                item.operation, item.id
            ))
        })
    }
}

#[async_trait]
impl SyncHandler for HttpSyncHandler {
    async fn replay(&self, item: &SyncQueueItem) -> Result<()> {
        let request = match item.operation {
            Operation::Create => HttpRequest::post(self.url(None)?).json(&item.payload)?,
            Operation::Update => {
                HttpRequest::put(self.url(Some(self.record_id(item)?))?).json(&item.payload)?
            }
            Operation::Delete => HttpRequest::delete(self.url(Some(self.record_id(item)?))?),
        };
        let request = match self.token.token().await? {
            Some(token) => request.bearer(token),
            None => request,
        };

        debug!(tag = %item.tag, method = %request.method, url = %request.url, "replaying sync item");
        match self.client.send(request).await {
            Ok(_) => Ok(()),
            Err(HuginnError::Server { status: 404, .. }) if item.operation == Operation::Delete => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// One [`HttpSyncHandler`] per entry of [`DEFAULT_HANDLER_ENDPOINTS`].
pub fn default_handlers(
    client: Arc<dyn HttpClient>,
    base_url: &str,
    token: Arc<dyn TokenProvider>,
) -> Vec<(String, Arc<dyn SyncHandler>)> {
    DEFAULT_HANDLER_ENDPOINTS
        .iter()
        .map(|(tag, endpoint)| {
            let handler = HttpSyncHandler::new(Arc::clone(&client), base_url, *endpoint)
                .with_token(Arc::clone(&token));
            (tag.to_string(), Arc::new(handler) as Arc<dyn SyncHandler>)
        })
        .collect()
}

impl SyncQueueManager {
    /// Register the built-in handlers for the five console domains.
    pub fn register_default_handlers(
        &self,
        client: Arc<dyn HttpClient>,
        base_url: &str,
        token: Arc<dyn TokenProvider>,
    ) {
        for (tag, handler) in default_handlers(client, base_url, token) {
            self.register_handler(tag, handler);
        }
    }
}
