pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod partial;
pub mod retry;
pub mod tasks;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use backoff::{BackoffCalculator, BackoffConfig};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use config::EngineConfig;
pub use error::{AppError, ErrorClass};
pub use health::{
    DegradationLevel, HealthCheck, HealthConfig, HealthMonitor, HealthStatus, HealthStatusResponse,
    ProviderHealthCheck, ServiceHealth,
};
pub use memory::InMemoryRetryRepository;
pub use models::{
    Attempt, AttemptKind, FallbackStatus, KeywordVariants, MediaType, MetadataItem, ProviderSource,
    ProviderStatus, SearchOutcome, SearchPhase, SearchRequest, SearchResult,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, ProviderStatusView};
pub use partial::{DegradedResult, PartialResultConfig, PartialResultHandler};
pub use retry::{
    ProcessResult, QueueOutcome, RetryEvent, RetryItem, RetryReporter, RetryScheduler,
    SchedulerConfig, TracingRetryReporter, TriggerOutcome, derive_task_id,
};
pub use tasks::{METADATA_SEARCH, MetadataSearchHandler, TaskHandler, TaskRouter, search_task};
pub use traits::{KeywordGenerator, NoKeywords, Provider, RetryRepository, TaskExecutor};
