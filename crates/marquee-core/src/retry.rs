//! Persistent retry queue for deferred asynchronous work.
//!
//! Work that failed with a transient error is stored as a [`RetryItem`] and
//! re-executed by a background loop once its `next_attempt_at` is due. Each
//! failure pushes the next attempt further out via [`BackoffCalculator`]; once
//! `attempt_count` reaches `max_attempts` the item is deleted and an
//! `Exhausted` event is reported. Delivery is at-least-once, so executors must
//! be idempotent.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::{BackoffCalculator, BackoffConfig};
use crate::error::{AppError, ErrorClass};
use crate::health::HealthMonitor;
use crate::traits::{RetryRepository, TaskExecutor};

/// A unit of deferred work waiting for its next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryItem {
    pub id: Uuid,
    /// Caller-chosen identity; at most one queued item per task id.
    pub task_id: String,
    /// Discriminator the executor dispatches on.
    pub task_type: String,
    /// Opaque to the scheduler; decoded by the executor for `task_type`.
    pub payload: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryItem {
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: impl Into<String>,
        max_attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            task_type: task_type.into(),
            payload: payload.into(),
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            next_attempt_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Stable task id for a piece of work, so re-queueing the same work collapses.
pub fn derive_task_id(task_type: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.as_bytes());
    format!("{}:{:x}", task_type, hasher.finalize())
}

/// Configuration for the retry scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the background loop looks for due items.
    pub poll_interval: Duration,
    /// Attempts before an item is dropped as exhausted.
    pub max_attempts: u32,
    /// Maximum number of due items processed per tick.
    pub batch_size: usize,
    pub backoff: BackoffConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_attempts: 5,
            batch_size: 50,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RetryEvent<'a> {
    Started,
    Tick {
        due: usize,
    },
    Queued {
        item: &'a RetryItem,
    },
    Duplicate {
        task_id: &'a str,
    },
    Succeeded {
        item: &'a RetryItem,
    },
    Failed {
        item: &'a RetryItem,
        error: &'a str,
    },
    Exhausted {
        item: &'a RetryItem,
        error: &'a str,
    },
    /// The executor returned a permanent error; the item will never succeed.
    Dropped {
        item: &'a RetryItem,
        error: &'a str,
    },
    Cancelled {
        task_id: &'a str,
    },
    Cleared {
        count: u64,
    },
    Stopped,
}

impl RetryEvent<'_> {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            RetryEvent::Failed { .. } => Some(ErrorClass::Transient),
            RetryEvent::Exhausted { .. } => Some(ErrorClass::RetryExhausted),
            RetryEvent::Dropped { .. } => Some(ErrorClass::Permanent),
            _ => None,
        }
    }
}

/// Trait for receiving scheduler events (decoupled logging).
pub trait RetryReporter: Send + Sync + 'static {
    fn report(&self, event: RetryEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRetryReporter;

impl RetryReporter for TracingRetryReporter {
    fn report(&self, event: RetryEvent<'_>) {
        match event {
            RetryEvent::Started => tracing::info!("Retry scheduler started"),
            RetryEvent::Tick { due } => tracing::debug!(%due, "Retry scheduler tick"),
            RetryEvent::Queued { item } => {
                tracing::info!(
                    task_id = %item.task_id,
                    task_type = %item.task_type,
                    next_attempt_at = %item.next_attempt_at,
                    "Retry queued"
                );
            }
            RetryEvent::Duplicate { task_id } => {
                tracing::debug!(%task_id, "Retry already queued");
            }
            RetryEvent::Succeeded { item } => {
                tracing::info!(
                    task_id = %item.task_id,
                    attempts = item.attempt_count + 1,
                    "Retry succeeded"
                );
            }
            RetryEvent::Failed { item, error } => {
                tracing::warn!(
                    task_id = %item.task_id,
                    attempt = item.attempt_count,
                    max_attempts = item.max_attempts,
                    next_attempt_at = %item.next_attempt_at,
                    %error,
                    "Retry attempt failed"
                );
            }
            RetryEvent::Exhausted { item, error } => {
                tracing::error!(
                    task_id = %item.task_id,
                    task_type = %item.task_type,
                    attempts = item.attempt_count,
                    %error,
                    "Retry exhausted, giving up"
                );
            }
            RetryEvent::Dropped { item, error } => {
                tracing::warn!(
                    task_id = %item.task_id,
                    %error,
                    "Retry dropped after permanent failure"
                );
            }
            RetryEvent::Cancelled { task_id } => tracing::info!(%task_id, "Retry cancelled"),
            RetryEvent::Cleared { count } => tracing::info!(%count, "Retry queue cleared"),
            RetryEvent::Stopped => tracing::info!("Retry scheduler stopped"),
        }
    }
}

/// Result of [`RetryScheduler::queue_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued(Uuid),
    /// An item with the same task id was already queued; nothing changed.
    AlreadyQueued(Uuid),
}

impl QueueOutcome {
    pub fn item_id(&self) -> Uuid {
        match self {
            QueueOutcome::Queued(id) | QueueOutcome::AlreadyQueued(id) => *id,
        }
    }
}

/// What happened to one item when it was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    Succeeded,
    Rescheduled,
    Exhausted,
    Dropped,
    /// Another execution of the same item is in progress.
    Busy,
    /// The item disappeared before it could run (cancelled or completed).
    Gone,
    /// The stored item was rescheduled into the future since it was listed.
    NotDue,
    /// The execution context was cancelled; the attempt was not counted.
    Interrupted,
}

/// Result of [`RetryScheduler::trigger_immediate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The loop is running and will pick the item up on its next tick.
    Scheduled,
    /// The loop is not running, so the item was executed directly.
    Executed(ProcessResult),
    /// The item is executing right now.
    InFlight,
}

struct LoopHandle {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Removes an item from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

/// Background scheduler that re-executes due [`RetryItem`]s.
///
/// Wrap in an `Arc` to call [`start`](Self::start).
pub struct RetryScheduler<R, E, P = TracingRetryReporter>
where
    R: RetryRepository,
    E: TaskExecutor,
    P: RetryReporter,
{
    repo: R,
    executor: E,
    reporter: P,
    backoff: BackoffCalculator,
    config: SchedulerConfig,
    health: Option<Arc<HealthMonitor>>,
    enqueue_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<HashSet<Uuid>>,
    runtime: Mutex<Option<LoopHandle>>,
}

impl<R, E> RetryScheduler<R, E, TracingRetryReporter>
where
    R: RetryRepository,
    E: TaskExecutor,
{
    pub fn new(repo: R, executor: E, config: SchedulerConfig) -> Self {
        Self {
            repo,
            executor,
            reporter: TracingRetryReporter,
            backoff: BackoffCalculator::new(config.backoff.clone()),
            config,
            health: None,
            enqueue_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
            runtime: Mutex::new(None),
        }
    }
}

impl<R, E, P> RetryScheduler<R, E, P>
where
    R: RetryRepository,
    E: TaskExecutor,
    P: RetryReporter,
{
    pub fn with_reporter<P2: RetryReporter>(self, reporter: P2) -> RetryScheduler<R, E, P2> {
        RetryScheduler {
            repo: self.repo,
            executor: self.executor,
            reporter,
            backoff: self.backoff,
            config: self.config,
            health: self.health,
            enqueue_lock: self.enqueue_lock,
            in_flight: self.in_flight,
            runtime: self.runtime,
        }
    }

    /// Report executor outcomes per task type to a shared health monitor.
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn backoff(&self) -> &BackoffCalculator {
        &self.backoff
    }

    pub fn reporter(&self) -> &P {
        &self.reporter
    }

    /// Queue work that failed with `error` for a later attempt.
    ///
    /// Permanent errors are rejected with [`AppError::NonRetryable`]. Queueing
    /// a task id that is already queued succeeds without changing anything.
    pub async fn queue_retry(
        &self,
        task_id: &str,
        task_type: &str,
        payload: &str,
        error: &AppError,
    ) -> Result<QueueOutcome, AppError> {
        if task_id.trim().is_empty() {
            return Err(AppError::InvalidRequest("task_id must not be empty".into()));
        }
        if task_type.trim().is_empty() {
            return Err(AppError::InvalidRequest("task_type must not be empty".into()));
        }
        if !error.is_retryable() {
            return Err(AppError::NonRetryable(error.to_string()));
        }

        // Check-then-insert must not interleave with another enqueue.
        let _guard = self.enqueue_lock.lock().await;

        if let Some(existing) = self.repo.find_by_task_id(task_id).await? {
            self.reporter.report(RetryEvent::Duplicate { task_id });
            return Ok(QueueOutcome::AlreadyQueued(existing.id));
        }

        let mut item = RetryItem::new(
            task_id,
            task_type,
            payload,
            self.config.max_attempts,
            Utc::now() + self.backoff.delta(0),
        );
        item.last_error = Some(error.to_string());

        if !self.repo.add(&item).await? {
            // Another process won the race; the store kept its item.
            self.reporter.report(RetryEvent::Duplicate { task_id });
            let existing = self.repo.find_by_task_id(task_id).await?;
            return Ok(QueueOutcome::AlreadyQueued(
                existing.map(|e| e.id).unwrap_or(item.id),
            ));
        }

        self.reporter.report(RetryEvent::Queued { item: &item });
        Ok(QueueOutcome::Queued(item.id))
    }

    /// Remove a queued task without executing it.
    pub async fn cancel_retry(&self, task_id: &str) -> Result<bool, AppError> {
        let removed = self.repo.delete_by_task_id(task_id).await?;
        if removed {
            self.reporter.report(RetryEvent::Cancelled { task_id });
        }
        Ok(removed)
    }

    /// Remove every queued item without executing any.
    pub async fn clear_all(&self) -> Result<u64, AppError> {
        let count = self.repo.clear_all().await?;
        self.reporter.report(RetryEvent::Cleared { count });
        Ok(count)
    }

    pub async fn get(&self, item_id: Uuid) -> Result<Option<RetryItem>, AppError> {
        self.repo.find_by_id(item_id).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<RetryItem>, AppError> {
        self.repo.list(limit).await
    }

    pub async fn pending_count(&self) -> Result<u64, AppError> {
        self.repo.count().await
    }

    /// Make an item due now. If the loop is not running, execute it directly.
    pub async fn trigger_immediate(&self, item_id: Uuid) -> Result<TriggerOutcome, AppError> {
        let Some(_guard) = self.claim(item_id) else {
            return Ok(TriggerOutcome::InFlight);
        };

        let mut item = self
            .repo
            .find_by_id(item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("retry item {item_id}")))?;

        let now = Utc::now();
        item.next_attempt_at = now;
        item.updated_at = now;
        self.repo.update(&item).await?;

        if self.is_running() {
            return Ok(TriggerOutcome::Scheduled);
        }

        let ctx = CancellationToken::new();
        let result = self.execute_claimed(item, &ctx).await?;
        Ok(TriggerOutcome::Executed(result))
    }

    /// Process every due item once. Returns how many were due.
    ///
    /// Called by the background loop on each tick; also usable on its own
    /// for one-shot draining.
    pub async fn tick(&self, ctx: &CancellationToken) -> usize {
        self.tick_until(ctx, ctx).await
    }

    async fn tick_until(&self, stop: &CancellationToken, ctx: &CancellationToken) -> usize {
        let due = match self
            .repo
            .get_pending(Utc::now(), self.config.batch_size)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load due retry items");
                return 0;
            }
        };

        self.reporter.report(RetryEvent::Tick { due: due.len() });

        for item in &due {
            if stop.is_cancelled() {
                break;
            }
            if let Err(e) = self.process_item(item.id, ctx).await {
                tracing::error!(
                    task_id = %item.task_id,
                    error = %e,
                    "Failed to process retry item"
                );
            }
        }
        due.len()
    }

    /// Execute one item by id, serialized against any other execution of it.
    pub async fn process_item(
        &self,
        item_id: Uuid,
        ctx: &CancellationToken,
    ) -> Result<ProcessResult, AppError> {
        let Some(_guard) = self.claim(item_id) else {
            tracing::debug!(%item_id, "Retry item already in flight, skipping");
            return Ok(ProcessResult::Busy);
        };

        // Reload under the claim: the listing may be stale.
        match self.repo.find_by_id(item_id).await? {
            Some(item) if !item.is_due(Utc::now()) => {
                tracing::debug!(
                    %item_id,
                    next_attempt_at = %item.next_attempt_at,
                    "Retry item no longer due, skipping"
                );
                Ok(ProcessResult::NotDue)
            }
            Some(item) => self.execute_claimed(item, ctx).await,
            None => Ok(ProcessResult::Gone),
        }
    }

    fn claim(&self, item_id: Uuid) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(item_id);
        inserted.then_some(InFlightGuard {
            set: &self.in_flight,
            id: item_id,
        })
    }

    async fn execute_claimed(
        &self,
        mut item: RetryItem,
        ctx: &CancellationToken,
    ) -> Result<ProcessResult, AppError> {
        let result = tokio::select! {
            r = self.executor.execute(ctx, &item) => r,
            () = ctx.cancelled() => Err(AppError::Cancelled),
        };

        let error = match result {
            Ok(()) => {
                self.repo.delete(item.id).await?;
                self.record_health(&item.task_type, Ok(()));
                self.reporter.report(RetryEvent::Succeeded { item: &item });
                return Ok(ProcessResult::Succeeded);
            }
            Err(AppError::Cancelled) => return Ok(ProcessResult::Interrupted),
            Err(e) => e,
        };

        self.record_health(&item.task_type, Err(&error));
        let message = error.to_string();
        let now = Utc::now();
        item.attempt_count = (item.attempt_count + 1).min(item.max_attempts);
        item.last_error = Some(message.clone());
        item.updated_at = now;

        if !error.is_retryable() {
            self.repo.delete(item.id).await?;
            self.reporter.report(RetryEvent::Dropped {
                item: &item,
                error: &message,
            });
            return Ok(ProcessResult::Dropped);
        }

        if item.is_exhausted() {
            self.repo.delete(item.id).await?;
            self.reporter.report(RetryEvent::Exhausted {
                item: &item,
                error: &message,
            });
            return Ok(ProcessResult::Exhausted);
        }

        item.next_attempt_at = now + self.backoff.delta(item.attempt_count);
        self.repo.update(&item).await?;
        self.reporter.report(RetryEvent::Failed {
            item: &item,
            error: &message,
        });
        Ok(ProcessResult::Rescheduled)
    }

    fn record_health(&self, task_type: &str, outcome: Result<(), &AppError>) {
        if let Some(health) = &self.health {
            health.update_service_health(task_type, outcome);
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|rt| !rt.handle.is_finished())
    }

    async fn run_loop(&self, stop: CancellationToken, ctx: CancellationToken) {
        self.reporter.report(RetryEvent::Started);

        loop {
            if stop.is_cancelled() {
                break;
            }

            self.tick_until(&stop, &ctx).await;

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = stop.cancelled() => break,
            }
        }

        self.reporter.report(RetryEvent::Stopped);
    }
}

impl<R, E, P> RetryScheduler<R, E, P>
where
    R: RetryRepository,
    E: TaskExecutor,
    P: RetryReporter,
{
    /// Spawn the background loop.
    ///
    /// `ctx` is handed to every execution and also stops the loop when
    /// cancelled. Calling `start` while already running is a no-op.
    pub fn start(self: &Arc<Self>, ctx: CancellationToken) {
        let mut runtime = self.runtime.lock().unwrap_or_else(|p| p.into_inner());
        if runtime.as_ref().is_some_and(|rt| !rt.handle.is_finished()) {
            tracing::warn!("Retry scheduler already running");
            return;
        }

        let stop = ctx.child_token();
        let this = Arc::clone(self);
        let loop_stop = stop.clone();
        let handle = tokio::spawn(async move { this.run_loop(loop_stop, ctx).await });
        *runtime = Some(LoopHandle { stop, handle });
    }

    /// Stop scheduling new work and wait for the loop to exit.
    ///
    /// An execution already in progress runs to completion.
    pub async fn stop(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        if let Some(rt) = runtime {
            rt.stop.cancel();
            if let Err(e) = rt.handle.await {
                tracing::error!(error = %e, "Retry scheduler loop panicked");
            }
        }
    }

    /// Stop the loop, giving in-flight work `grace` to finish before `ctx`
    /// (the token passed to [`start`](Self::start)) is cancelled.
    ///
    /// Returns `false` when the grace period ran out. The loop has exited
    /// either way.
    pub async fn shutdown(&self, grace: Duration, ctx: &CancellationToken) -> bool {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let Some(LoopHandle { stop, mut handle }) = runtime else {
            return true;
        };
        stop.cancel();

        let (joined, graceful) = match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => (joined, true),
            Err(_) => {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "In-flight retry work did not finish in time, cancelling"
                );
                ctx.cancel();
                (handle.await, false)
            }
        };

        if let Err(e) = joined {
            tracing::error!(error = %e, "Retry scheduler loop panicked");
        }
        graceful
    }
}
