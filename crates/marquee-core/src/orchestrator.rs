//! Fallback-chain search across metadata providers.
//!
//! Providers are tried in registration order; the first usable answer wins.
//! Each provider sits behind its own [`CircuitBreaker`]. When the primary pass
//! finds nothing and a [`KeywordGenerator`] is configured, the whole chain is
//! re-run once per generated query variant. Every attempt, including skipped
//! ones, lands in the [`FallbackStatus`] audit trail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
use crate::error::AppError;
use crate::health::HealthMonitor;
use crate::models::{
    Attempt, AttemptKind, FallbackStatus, ProviderSource, ProviderStatus, SearchOutcome,
    SearchPhase, SearchRequest, SearchResult,
};
use crate::traits::{KeywordGenerator, NoKeywords, Provider};

/// Health monitor service name for the keyword generator.
pub const KEYWORD_SERVICE: &str = "keywords";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on a single provider call.
    pub provider_timeout: Duration,
    /// Pause after a provider error before moving to the next provider.
    pub failure_delay: Duration,
    /// Maximum number of keyword variants tried after the primary pass.
    pub max_keyword_variants: usize,
    /// Results whose best item scores below this are not usable.
    pub min_confidence: f64,
    /// Applied to every provider's breaker.
    pub breaker: CircuitBreakerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(15),
            failure_delay: Duration::from_millis(250),
            max_keyword_variants: 3,
            min_confidence: 0.3,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay = delay;
        self
    }

    pub fn with_max_keyword_variants(mut self, max: usize) -> Self {
        self.max_keyword_variants = max;
        self
    }

    pub fn with_min_confidence(mut self, min: f64) -> Self {
        self.min_confidence = min.clamp(0.0, 1.0);
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

/// Combined provider/breaker view for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusView {
    pub name: String,
    pub source: ProviderSource,
    pub status: ProviderStatus,
    pub circuit: CircuitState,
}

struct ProviderSlot {
    provider: Arc<dyn Provider>,
    breaker: CircuitBreaker,
}

enum Step {
    Found(SearchResult),
    Miss { errored: bool },
    Cancelled,
}

pub struct Orchestrator<K: KeywordGenerator = NoKeywords> {
    providers: Vec<ProviderSlot>,
    keywords: Option<K>,
    health: Option<Arc<HealthMonitor>>,
    config: OrchestratorConfig,
}

impl Orchestrator<NoKeywords> {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            providers: Vec::new(),
            keywords: None,
            health: None,
            config,
        }
    }
}

impl<K: KeywordGenerator> Orchestrator<K> {
    /// Enable the keyword-expansion pass.
    pub fn with_keyword_generator<K2: KeywordGenerator>(self, generator: K2) -> Orchestrator<K2> {
        Orchestrator {
            providers: self.providers,
            keywords: Some(generator),
            health: self.health,
            config: self.config,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Append a provider to the chain. Registration order is priority order.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let breaker = CircuitBreaker::new(provider.name(), self.config.breaker.clone());
        self.providers.push(ProviderSlot { provider, breaker });
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter().map(|slot| &slot.provider)
    }

    pub fn breaker(&self, provider: &str) -> Option<&CircuitBreaker> {
        self.providers
            .iter()
            .find(|slot| slot.provider.name() == provider)
            .map(|slot| &slot.breaker)
    }

    /// Search the whole chain.
    ///
    /// Finding nothing is not an error: the outcome carries `result: None`
    /// and a status where `all_failed()` holds. Only a malformed request
    /// returns `Err`.
    pub async fn search(
        &self,
        cancel: &CancellationToken,
        request: &SearchRequest,
    ) -> Result<SearchOutcome, AppError> {
        request.validate()?;

        let mut status = FallbackStatus::default();
        let result = self.search_chain(cancel, request, &mut status).await;

        if status.cancelled {
            tracing::info!(
                query = %request.query,
                attempts = status.attempts.len(),
                "Search cancelled"
            );
        } else if result.is_none() {
            tracing::info!(
                query = %request.query,
                attempts = status.attempts.len(),
                phases = status.phases_run,
                "No provider produced a usable result"
            );
        }

        Ok(SearchOutcome { result, status })
    }

    /// Search a single provider chosen by the caller.
    ///
    /// The breaker is still consulted and updated; an open circuit shows up
    /// as a `circuit_open` attempt. No keyword pass.
    pub async fn search_source(
        &self,
        cancel: &CancellationToken,
        request: &SearchRequest,
        source: ProviderSource,
    ) -> Result<SearchOutcome, AppError> {
        request.validate()?;

        let slot = self
            .providers
            .iter()
            .find(|slot| slot.provider.source() == source)
            .ok_or_else(|| {
                AppError::InvalidRequest(format!("no provider registered for source '{source}'"))
            })?;

        let mut status = FallbackStatus {
            phases_run: 1,
            ..Default::default()
        };
        let result = match self
            .try_provider(slot, cancel, request, SearchPhase::Primary, &mut status)
            .await
        {
            Step::Found(result) => Some(result),
            Step::Miss { .. } => None,
            Step::Cancelled => {
                status.cancelled = true;
                None
            }
        };

        Ok(SearchOutcome { result, status })
    }

    async fn search_chain(
        &self,
        cancel: &CancellationToken,
        request: &SearchRequest,
        status: &mut FallbackStatus,
    ) -> Option<SearchResult> {
        match self.run_pass(cancel, request, SearchPhase::Primary, status).await {
            Step::Found(result) => return Some(result),
            Step::Cancelled => {
                status.cancelled = true;
                return None;
            }
            Step::Miss { .. } => {}
        }

        let generator = self.keywords.as_ref()?;
        if self.config.max_keyword_variants == 0 {
            return None;
        }

        let generated = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                status.cancelled = true;
                return None;
            }
            r = generator.generate_keywords(&request.query) => r,
        };

        let variants = match generated {
            Ok(keywords) => {
                self.report_health(KEYWORD_SERVICE, Ok(()));
                keywords.variants(self.config.max_keyword_variants)
            }
            Err(e) => {
                tracing::warn!(query = %request.query, error = %e, "Keyword generation failed");
                self.report_health(KEYWORD_SERVICE, Err(&e));
                return None;
            }
        };

        if !variants.is_empty() {
            tracing::debug!(query = %request.query, ?variants, "Trying keyword variants");
        }

        for variant in variants {
            let variant_request = request.with_query(variant);
            match self
                .run_pass(cancel, &variant_request, SearchPhase::Keyword, status)
                .await
            {
                Step::Found(result) => return Some(result),
                Step::Cancelled => {
                    status.cancelled = true;
                    return None;
                }
                Step::Miss { .. } => {}
            }
        }

        None
    }

    /// One full loop over the provider chain.
    async fn run_pass(
        &self,
        cancel: &CancellationToken,
        request: &SearchRequest,
        phase: SearchPhase,
        status: &mut FallbackStatus,
    ) -> Step {
        status.phases_run += 1;
        let last = self.providers.len().saturating_sub(1);

        for (i, slot) in self.providers.iter().enumerate() {
            if cancel.is_cancelled() {
                return Step::Cancelled;
            }

            let pause = i < last && !self.config.failure_delay.is_zero();
            match self.try_provider(slot, cancel, request, phase, status).await {
                Step::Miss { errored: true } if pause => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.failure_delay) => {}
                        () = cancel.cancelled() => return Step::Cancelled,
                    }
                }
                Step::Miss { .. } => {}
                done => return done,
            }
        }

        Step::Miss { errored: false }
    }

    async fn try_provider(
        &self,
        slot: &ProviderSlot,
        cancel: &CancellationToken,
        request: &SearchRequest,
        phase: SearchPhase,
        status: &mut FallbackStatus,
    ) -> Step {
        let name = slot.provider.name();
        let attempt = |kind, success, error: Option<String>, duration| Attempt {
            provider: name.to_string(),
            success,
            error,
            duration,
            kind,
            phase,
            query: request.query.clone(),
        };

        if !slot.provider.is_available() {
            status.push(attempt(
                AttemptKind::Unavailable,
                false,
                Some("provider is not configured".to_string()),
                Duration::ZERO,
            ));
            return Step::Miss { errored: false };
        }

        let Some(permit) = slot.breaker.try_acquire() else {
            tracing::debug!(provider = %name, "Circuit open, skipping provider");
            status.push(attempt(
                AttemptKind::CircuitOpen,
                false,
                Some(AppError::CircuitOpen(name.to_string()).to_string()),
                Duration::ZERO,
            ));
            return Step::Miss { errored: false };
        };

        let started = Instant::now();
        let timeout = self.config.provider_timeout;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            r = tokio::time::timeout(timeout, slot.provider.search(request)) => {
                Some(r.unwrap_or_else(|_| Err(AppError::Timeout(timeout.as_secs()))))
            }
        };
        let elapsed = started.elapsed();

        // Dropping the permit unrecorded frees a half-open slot.
        let Some(outcome) = outcome else {
            return Step::Cancelled;
        };

        match outcome {
            Ok(result) => {
                permit.record_success();
                self.report_health(name, Ok(()));

                if self.is_usable(&result) {
                    tracing::debug!(
                        provider = %name,
                        items = result.items.len(),
                        "Provider returned results"
                    );
                    status.push(attempt(AttemptKind::Called, true, None, elapsed));
                    Step::Found(result)
                } else {
                    status.push(attempt(
                        AttemptKind::Called,
                        false,
                        Some("no usable results".to_string()),
                        elapsed,
                    ));
                    Step::Miss { errored: false }
                }
            }
            Err(e) => {
                tracing::warn!(
                    provider = %name,
                    query = %request.query,
                    error = %e,
                    "Provider search failed"
                );
                permit.record_outcome(Err(&e));
                self.report_health(name, Err(&e));
                status.push(attempt(AttemptKind::Called, false, Some(e.to_string()), elapsed));
                Step::Miss { errored: true }
            }
        }
    }

    fn is_usable(&self, result: &SearchResult) -> bool {
        result
            .best_confidence()
            .is_some_and(|c| c >= self.config.min_confidence)
    }

    fn report_health(&self, service: &str, outcome: Result<(), &AppError>) {
        if let Some(health) = &self.health {
            health.update_service_health(service, outcome);
        }
    }

    /// Each provider's own status combined with its breaker.
    pub fn provider_statuses(&self) -> Vec<ProviderStatusView> {
        self.providers
            .iter()
            .map(|slot| {
                let circuit = slot.breaker.state();
                let status = match slot.provider.status() {
                    ProviderStatus::Available if circuit == CircuitState::Open => {
                        ProviderStatus::CircuitOpen
                    }
                    other => other,
                };
                ProviderStatusView {
                    name: slot.provider.name().to_string(),
                    source: slot.provider.source(),
                    status,
                    circuit,
                }
            })
            .collect()
    }

    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.providers.iter().map(|slot| slot.breaker.stats()).collect()
    }
}
