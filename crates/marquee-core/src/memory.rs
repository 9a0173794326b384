use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::retry::RetryItem;
use crate::traits::RetryRepository;

/// Process-local retry store. Items do not survive a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRetryRepository {
    items: Arc<Mutex<BTreeMap<Uuid, RetryItem>>>,
}

impl InMemoryRetryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Uuid, RetryItem>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl RetryRepository for InMemoryRetryRepository {
    async fn add(&self, item: &RetryItem) -> Result<bool, AppError> {
        let mut items = self.lock();
        if items.values().any(|i| i.task_id == item.task_id) {
            return Ok(false);
        }
        items.insert(item.id, item.clone());
        Ok(true)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<RetryItem>, AppError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn find_by_task_id(&self, task_id: &str) -> Result<Option<RetryItem>, AppError> {
        Ok(self.lock().values().find(|i| i.task_id == task_id).cloned())
    }

    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryItem>, AppError> {
        let mut due: Vec<RetryItem> = self
            .lock()
            .values()
            .filter(|i| i.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|i| (i.next_attempt_at, i.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn list(&self, limit: usize) -> Result<Vec<RetryItem>, AppError> {
        let mut all: Vec<RetryItem> = self.lock().values().cloned().collect();
        all.sort_by_key(|i| (i.next_attempt_at, i.created_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn update(&self, item: &RetryItem) -> Result<(), AppError> {
        match self.lock().get_mut(&item.id) {
            Some(existing) => {
                *existing = item.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("retry item {}", item.id))),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        Ok(self.lock().remove(&id).is_some())
    }

    async fn delete_by_task_id(&self, task_id: &str) -> Result<bool, AppError> {
        let mut items = self.lock();
        let id = items
            .values()
            .find(|i| i.task_id == task_id)
            .map(|i| i.id);
        Ok(id.and_then(|id| items.remove(&id)).is_some())
    }

    async fn count(&self) -> Result<u64, AppError> {
        Ok(self.lock().len() as u64)
    }

    async fn clear_all(&self) -> Result<u64, AppError> {
        let mut items = self.lock();
        let n = items.len() as u64;
        items.clear();
        Ok(n)
    }
}
