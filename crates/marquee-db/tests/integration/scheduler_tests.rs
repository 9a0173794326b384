use std::sync::{Arc, Mutex};

use marquee_core::error::AppError;
use marquee_core::retry::{
    ProcessResult, QueueOutcome, RetryItem, RetryScheduler, SchedulerConfig, TriggerOutcome,
};
use marquee_core::traits::{RetryRepository, TaskExecutor};
use marquee_db::PgRetryRepository;
use tokio_util::sync::CancellationToken;

use crate::common::setup_test_db;

/// Fails while `failures` is positive, then succeeds.
#[derive(Clone, Default)]
struct FlakyExecutor {
    failures: Arc<Mutex<u32>>,
    runs: Arc<Mutex<Vec<String>>>,
}

impl FlakyExecutor {
    fn failing(times: u32) -> Self {
        Self {
            failures: Arc::new(Mutex::new(times)),
            ..Default::default()
        }
    }
}

impl TaskExecutor for FlakyExecutor {
    async fn execute(&self, _cancel: &CancellationToken, item: &RetryItem) -> Result<(), AppError> {
        self.runs.lock().unwrap().push(item.task_id.clone());
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(AppError::Transient("still down".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn queue_is_shared_across_scheduler_instances() {
    let (pool, _container) = setup_test_db().await;
    let first = RetryScheduler::new(
        PgRetryRepository::new(pool.clone()),
        FlakyExecutor::default(),
        SchedulerConfig::default(),
    );
    let second = RetryScheduler::new(
        PgRetryRepository::new(pool),
        FlakyExecutor::default(),
        SchedulerConfig::default(),
    );

    let err = AppError::Timeout(15);
    let queued = first.queue_retry("t-1", "metadata_search", "{}", &err).await.unwrap();
    let again = second.queue_retry("t-1", "metadata_search", "{}", &err).await.unwrap();

    assert!(matches!(queued, QueueOutcome::Queued(_)));
    assert_eq!(again, QueueOutcome::AlreadyQueued(queued.item_id()));
    assert_eq!(second.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn failed_attempt_is_rescheduled_then_succeeds() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgRetryRepository::new(pool);
    let executor = FlakyExecutor::failing(1);
    let scheduler = RetryScheduler::new(repo.clone(), executor.clone(), SchedulerConfig::default());

    let id = scheduler
        .queue_retry("t-2", "metadata_search", "{}", &AppError::RateLimitExceeded)
        .await
        .unwrap()
        .item_id();

    let first = scheduler.trigger_immediate(id).await.unwrap();
    assert_eq!(first, TriggerOutcome::Executed(ProcessResult::Rescheduled));

    let stored = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("Transient error: still down"));

    let second = scheduler.trigger_immediate(id).await.unwrap();
    assert_eq!(second, TriggerOutcome::Executed(ProcessResult::Succeeded));
    assert!(repo.find_by_id(id).await.unwrap().is_none());
    assert_eq!(executor.runs.lock().unwrap().len(), 2);
}
