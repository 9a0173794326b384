//! Per-service health tracking and system-wide degradation level.
//!
//! Every provider call, health check and deferred task outcome is reported to
//! a single [`HealthMonitor`] shared by reference. Status moves one step at a
//! time so a single blip neither marks a service down nor instantly clears it:
//!
//! ```text
//! HEALTHY --[degraded_after failures]--> DEGRADED --[down_after failures]--> DOWN
//! HEALTHY <--[recover_after successes]-- DEGRADED <--[recover_after successes]-- DOWN
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, ErrorClass};
use crate::models::{MediaType, SearchRequest};
use crate::traits::Provider;

/// Health of a single service, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Down => write!(f, "down"),
        }
    }
}

/// System-wide summary of dependency health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    Normal,
    Degraded,
    Critical,
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DegradationLevel::Normal => write!(f, "normal"),
            DegradationLevel::Degraded => write!(f, "degraded"),
            DegradationLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Public view of one tracked service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: HealthStatus,
    pub essential: bool,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Snapshot of every tracked service plus the aggregate level.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatusResponse {
    pub level: DegradationLevel,
    pub services: Vec<ServiceHealth>,
    pub checked_at: DateTime<Utc>,
}

/// Thresholds for status transitions.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures that move a healthy service to degraded.
    pub degraded_after: u32,
    /// Consecutive failures that move a service to down.
    pub down_after: u32,
    /// Consecutive successes needed to step one level back toward healthy.
    pub recover_after: u32,
    /// Interval between periodic health check runs.
    pub check_interval: Duration,
    /// Upper bound on a single health check.
    pub check_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: 2,
            down_after: 5,
            recover_after: 3,
            check_interval: Duration::from_secs(60),
            check_timeout: Duration::from_secs(10),
        }
    }
}

/// A check for one monitored service.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<(), AppError>;
}

/// Query used when a provider check does not name its own.
pub const DEFAULT_CHECK_QUERY: &str = "Casablanca";

/// Checks a [`Provider`] with a real, one-page search for a well-known title.
///
/// An unconfigured provider fails without being contacted. A not-found answer
/// still proves the service responded and is neutral to the monitor.
pub struct ProviderHealthCheck {
    provider: Arc<dyn Provider>,
    request: SearchRequest,
}

impl ProviderHealthCheck {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            request: SearchRequest::new(DEFAULT_CHECK_QUERY, MediaType::Movie),
        }
    }

    pub fn with_request(mut self, request: SearchRequest) -> Self {
        self.request = request;
        self
    }
}

#[async_trait]
impl HealthCheck for ProviderHealthCheck {
    async fn check(&self) -> Result<(), AppError> {
        if !self.provider.is_available() {
            return Err(AppError::Transient(format!(
                "provider '{}' is not configured",
                self.provider.name()
            )));
        }

        self.provider.search(&self.request).await.map(|_| ())
    }
}

#[derive(Debug)]
struct ServiceState {
    status: HealthStatus,
    essential: bool,
    last_error: Option<String>,
    last_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl ServiceState {
    fn new(essential: bool) -> Self {
        Self {
            status: HealthStatus::Healthy,
            essential,
            last_error: None,
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

/// Aggregates per-service health into a [`DegradationLevel`].
pub struct HealthMonitor {
    config: HealthConfig,
    services: Mutex<BTreeMap<String, ServiceState>>,
    checks: Mutex<Vec<(String, Arc<dyn HealthCheck>)>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            services: Mutex::new(BTreeMap::new()),
            checks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn lock_services(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ServiceState>> {
        self.services.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned health monitor mutex");
            poisoned.into_inner()
        })
    }

    /// Start tracking a service. Essential services decide the critical level.
    pub fn register_service(&self, name: impl Into<String>, essential: bool) {
        let mut services = self.lock_services();
        services
            .entry(name.into())
            .and_modify(|s| s.essential = essential)
            .or_insert_with(|| ServiceState::new(essential));
    }

    /// Register a periodic check for a service (also registers the service).
    pub fn register_check(
        &self,
        name: impl Into<String>,
        essential: bool,
        check: Arc<dyn HealthCheck>,
    ) {
        let name = name.into();
        self.register_service(name.clone(), essential);
        self.checks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((name, check));
    }

    /// Record the outcome of a call to `name`.
    ///
    /// Transient errors count as failures. Permanent errors (not-found, bad
    /// input) prove the service is answering and are recorded without moving
    /// either streak. Unknown services are tracked as non-essential.
    pub fn update_service_health(&self, name: &str, outcome: Result<(), &AppError>) {
        let mut services = self.lock_services();
        let state = services
            .entry(name.to_string())
            .or_insert_with(|| ServiceState::new(false));
        state.last_check = Some(Utc::now());

        let previous = state.status;
        match outcome {
            Ok(()) => {
                state.consecutive_failures = 0;
                state.consecutive_successes += 1;
                if state.status != HealthStatus::Healthy
                    && state.consecutive_successes >= self.config.recover_after
                {
                    state.status = match state.status {
                        HealthStatus::Down => HealthStatus::Degraded,
                        _ => HealthStatus::Healthy,
                    };
                    state.consecutive_successes = 0;
                    if state.status == HealthStatus::Healthy {
                        state.last_error = None;
                    }
                }
            }
            Err(e) if e.class() == ErrorClass::Transient => {
                state.consecutive_successes = 0;
                state.consecutive_failures += 1;
                state.last_error = Some(e.to_string());
                if state.consecutive_failures >= self.config.down_after {
                    state.status = HealthStatus::Down;
                } else if state.consecutive_failures >= self.config.degraded_after
                    && state.status == HealthStatus::Healthy
                {
                    state.status = HealthStatus::Degraded;
                }
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
            }
        }

        if state.status != previous {
            if state.status > previous {
                tracing::warn!(
                    service = %name,
                    from = %previous,
                    to = %state.status,
                    "Service health worsened"
                );
            } else {
                tracing::info!(
                    service = %name,
                    from = %previous,
                    to = %state.status,
                    "Service health recovered"
                );
            }
        }
    }

    pub fn service_health(&self, name: &str) -> Option<ServiceHealth> {
        self.lock_services()
            .get(name)
            .map(|state| to_public(name, state))
    }

    /// Normal only if every service is healthy; critical when all essential
    /// services (or, with none marked essential, all services) are down.
    pub fn degradation_level(&self) -> DegradationLevel {
        aggregate(&self.lock_services())
    }

    pub fn snapshot(&self) -> HealthStatusResponse {
        let services = self.lock_services();
        HealthStatusResponse {
            level: aggregate(&services),
            services: services
                .iter()
                .map(|(name, state)| to_public(name, state))
                .collect(),
            checked_at: Utc::now(),
        }
    }

    /// Run every registered check concurrently and feed the results in.
    pub async fn run_checks(&self) {
        let checks: Vec<_> = self
            .checks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        let timeout = self.config.check_timeout;
        let results = futures::future::join_all(checks.iter().map(|(name, check)| async move {
            let result = match tokio::time::timeout(timeout, check.check()).await {
                Ok(r) => r,
                Err(_) => Err(AppError::Timeout(timeout.as_secs())),
            };
            (name, result)
        }))
        .await;

        for (name, result) in results {
            if let Err(e) = &result {
                tracing::debug!(service = %name, error = %e, "Health check failed");
            }
            self.update_service_health(name, result.as_ref().map(|_| ()));
        }
    }

    /// Run checks every `check_interval` until `cancel` fires.
    pub fn spawn_periodic(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                monitor.run_checks().await;
                tokio::select! {
                    () = tokio::time::sleep(monitor.config.check_interval) => {}
                    () = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Periodic health checks stopped");
        })
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

fn to_public(name: &str, state: &ServiceState) -> ServiceHealth {
    ServiceHealth {
        name: name.to_string(),
        status: state.status,
        essential: state.essential,
        last_error: state.last_error.clone(),
        last_check: state.last_check,
        consecutive_failures: state.consecutive_failures,
        consecutive_successes: state.consecutive_successes,
    }
}

fn aggregate(services: &BTreeMap<String, ServiceState>) -> DegradationLevel {
    if services.values().all(|s| s.status == HealthStatus::Healthy) {
        return DegradationLevel::Normal;
    }

    let has_essential = services.values().any(|s| s.essential);
    let all_down = services
        .values()
        .filter(|s| s.essential || !has_essential)
        .all(|s| s.status == HealthStatus::Down);

    if all_down {
        DegradationLevel::Critical
    } else {
        DegradationLevel::Degraded
    }
}
