use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{KeywordVariants, ProviderSource, ProviderStatus, SearchRequest, SearchResult};
use crate::retry::RetryItem;

/// An external metadata source (TMDb, Douban, Wikipedia, ...).
///
/// Providers are held as `Arc<dyn Provider>` in registration order by the
/// orchestrator. Cancellation is handled by the caller dropping the future.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short, lowercase identifier (e.g. `"tmdb"`).
    fn name(&self) -> &str;

    fn source(&self) -> ProviderSource;

    /// Returns `true` when the provider is configured and can serve requests.
    fn is_available(&self) -> bool;

    /// Self-reported status. Breaker state is layered on top by the orchestrator.
    fn status(&self) -> ProviderStatus {
        if self.is_available() {
            ProviderStatus::Available
        } else {
            ProviderStatus::Unavailable
        }
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResult, AppError>;
}

/// Supplies alternate spellings and localized names for the keyword-expansion pass.
pub trait KeywordGenerator: Send + Sync + Clone {
    fn generate_keywords(
        &self,
        title: &str,
    ) -> impl Future<Output = Result<KeywordVariants, AppError>> + Send;
}

/// A keyword generator that never produces variants.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeywords;

impl KeywordGenerator for NoKeywords {
    async fn generate_keywords(&self, title: &str) -> Result<KeywordVariants, AppError> {
        Ok(KeywordVariants::new(title))
    }
}

/// Performs the deferred work behind a [`RetryItem`].
///
/// Implementations must be idempotent: an item may run more than once after a
/// restart or a lost update.
pub trait TaskExecutor: Send + Sync + Clone + 'static {
    fn execute(
        &self,
        cancel: &CancellationToken,
        item: &RetryItem,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Durable storage for retry items, polled each scheduler tick.
///
/// `add` must enforce `task_id` uniqueness: it returns `Ok(false)` without
/// inserting when an item with the same `task_id` already exists.
pub trait RetryRepository: Send + Sync + Clone + 'static {
    fn add(&self, item: &RetryItem) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn find_by_id(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<RetryItem>, AppError>> + Send;

    fn find_by_task_id(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<Option<RetryItem>, AppError>> + Send;

    /// Items whose `next_attempt_at <= now`, oldest due first.
    fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RetryItem>, AppError>> + Send;

    fn list(&self, limit: usize) -> impl Future<Output = Result<Vec<RetryItem>, AppError>> + Send;

    fn update(&self, item: &RetryItem) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Returns `true` if an item was removed.
    fn delete(&self, id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn delete_by_task_id(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn count(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Removes every item, returning how many were removed.
    fn clear_all(&self) -> impl Future<Output = Result<u64, AppError>> + Send;
}
