//! Dispatch of deferred work by task type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::SearchRequest;
use crate::orchestrator::Orchestrator;
use crate::partial::PartialResultHandler;
use crate::retry::{RetryItem, derive_task_id};
use crate::traits::{KeywordGenerator, TaskExecutor};

/// Task type for a deferred metadata search.
pub const METADATA_SEARCH: &str = "metadata_search";

/// Encode a search as a deferred task, returning `(task_id, payload)`.
pub fn search_task(request: &SearchRequest) -> Result<(String, String), AppError> {
    let payload = serde_json::to_string(request)?;
    Ok((derive_task_id(METADATA_SEARCH, &payload), payload))
}

/// Handles the payload of one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &str;

    async fn handle(&self, cancel: &CancellationToken, payload: &str) -> Result<(), AppError>;
}

/// [`TaskExecutor`] that routes each item to the handler for its `task_type`.
#[derive(Clone, Default)]
pub struct TaskRouter {
    handlers: Arc<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        Arc::make_mut(&mut self.handlers).insert(handler.task_type().to_string(), handler);
        self
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl TaskExecutor for TaskRouter {
    async fn execute(&self, cancel: &CancellationToken, item: &RetryItem) -> Result<(), AppError> {
        let handler = self.handlers.get(&item.task_type).ok_or_else(|| {
            AppError::InvalidRequest(format!("no handler for task type '{}'", item.task_type))
        })?;
        handler.handle(cancel, &item.payload).await
    }
}

/// Re-runs a search that found nothing the first time.
///
/// The payload is a JSON [`SearchRequest`]. Finding nothing is a transient
/// failure so the item is retried with backoff.
pub struct MetadataSearchHandler<K: KeywordGenerator> {
    orchestrator: Arc<Orchestrator<K>>,
    partial: Option<PartialResultHandler>,
}

impl<K: KeywordGenerator> MetadataSearchHandler<K> {
    pub fn new(orchestrator: Arc<Orchestrator<K>>) -> Self {
        Self {
            orchestrator,
            partial: None,
        }
    }

    /// Store found results so degraded searches can fall back to them.
    pub fn with_result_cache(mut self, partial: PartialResultHandler) -> Self {
        self.partial = Some(partial);
        self
    }
}

#[async_trait]
impl<K: KeywordGenerator + 'static> TaskHandler for MetadataSearchHandler<K> {
    fn task_type(&self) -> &str {
        METADATA_SEARCH
    }

    async fn handle(&self, cancel: &CancellationToken, payload: &str) -> Result<(), AppError> {
        let request: SearchRequest = serde_json::from_str(payload)?;
        let outcome = self.orchestrator.search(cancel, &request).await?;

        if outcome.status.cancelled {
            return Err(AppError::Cancelled);
        }

        match &outcome.result {
            Some(result) if outcome.found() => {
                tracing::info!(
                    query = %request.query,
                    provider = outcome.status.successful_provider().unwrap_or_default(),
                    items = result.items.len(),
                    "Deferred search succeeded"
                );
                if let Some(partial) = &self.partial {
                    partial.remember(&request, result).await;
                }
                Ok(())
            }
            _ => Err(AppError::Transient(format!(
                "no provider returned results for '{}'",
                request.query
            ))),
        }
    }
}
