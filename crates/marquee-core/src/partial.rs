//! Presentable answers when some or all providers are failing.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;

use crate::health::{DegradationLevel, HealthMonitor};
use crate::models::{
    MediaType, MetadataItem, ProviderSource, SearchOutcome, SearchRequest, SearchResult,
};

/// Best-available answer plus an advisory for the user.
#[derive(Debug, Clone, Serialize)]
pub struct DegradedResult {
    /// Deduplicated items, highest confidence first.
    pub items: Vec<MetadataItem>,
    pub level: DegradationLevel,
    pub message: String,
    /// Sources that contributed items, in first-seen order.
    pub sources: Vec<ProviderSource>,
    /// True unless this is a complete answer under normal conditions.
    pub is_partial: bool,
    /// True when the items came from the result cache, not a live provider.
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct PartialResultConfig {
    pub cache_capacity: u64,
    pub cache_ttl: Duration,
    /// Upper bound on items in a merged answer.
    pub max_items: usize,
}

impl Default for PartialResultConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1_000,
            cache_ttl: Duration::from_secs(3600),
            max_items: 20,
        }
    }
}

/// Turns partial provider results and the health picture into a [`DegradedResult`].
///
/// Successful results are remembered so a later search during an outage can
/// still show something.
#[derive(Clone)]
pub struct PartialResultHandler {
    health: Arc<HealthMonitor>,
    cache: Cache<String, SearchResult>,
    max_items: usize,
}

impl PartialResultHandler {
    pub fn new(health: Arc<HealthMonitor>, config: PartialResultConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            health,
            cache,
            max_items: config.max_items.max(1),
        }
    }

    pub fn degradation_level(&self) -> DegradationLevel {
        self.health.degradation_level()
    }

    pub async fn remember(&self, request: &SearchRequest, result: &SearchResult) {
        if result.has_results() {
            self.cache.insert(request.cache_key(), result.clone()).await;
        }
    }

    pub async fn cached(&self, request: &SearchRequest) -> Option<SearchResult> {
        self.cache.get(&request.cache_key()).await
    }

    /// Combine whatever was collected into one answer at the current level.
    pub fn merge_partial_results(&self, results: Vec<SearchResult>) -> DegradedResult {
        let level = self.health.degradation_level();
        let mut items: Vec<MetadataItem> = Vec::new();
        let mut sources: Vec<ProviderSource> = Vec::new();

        for result in results {
            if result.has_results() && !sources.contains(&result.source) {
                sources.push(result.source);
            }
            for item in result.items {
                let key = dedup_key(&item);
                match items.iter_mut().find(|existing| dedup_key(existing) == key) {
                    Some(existing) if item.confidence > existing.confidence => *existing = item,
                    Some(_) => {}
                    None => items.push(item),
                }
            }
        }

        items.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        items.truncate(self.max_items);

        let has_items = !items.is_empty();
        DegradedResult {
            items,
            level,
            message: advisory(level, has_items).to_string(),
            sources,
            is_partial: level != DegradationLevel::Normal || !has_items,
            from_cache: false,
        }
    }

    /// Present a search outcome, falling back to cached data when nothing fresh was found.
    pub async fn resolve(
        &self,
        request: &SearchRequest,
        outcome: &SearchOutcome,
    ) -> DegradedResult {
        if let Some(result) = outcome.result.as_ref().filter(|r| r.has_results()) {
            self.remember(request, result).await;
            return self.merge_partial_results(vec![result.clone()]);
        }

        match self.cached(request).await {
            Some(cached) => {
                tracing::info!(query = %request.query, "Serving cached metadata");
                let mut merged = self.merge_partial_results(vec![cached]);
                merged.is_partial = true;
                merged.from_cache = true;
                if merged.level == DegradationLevel::Normal {
                    merged.message =
                        "Live sources returned nothing; showing previously found results."
                            .to_string();
                }
                merged
            }
            None => self.merge_partial_results(Vec::new()),
        }
    }
}

fn dedup_key(item: &MetadataItem) -> (String, Option<u16>, MediaType) {
    (item.title.trim().to_lowercase(), item.year, item.media_type)
}

fn advisory(level: DegradationLevel, has_items: bool) -> &'static str {
    match (level, has_items) {
        (DegradationLevel::Normal, true) => "All metadata sources are available.",
        (DegradationLevel::Normal, false) => "No matching metadata was found.",
        (DegradationLevel::Degraded, true) => {
            "Some metadata sources are unavailable; results may be incomplete."
        }
        (DegradationLevel::Degraded, false) => {
            "No matching metadata was found. Some sources are unavailable, try again later."
        }
        (DegradationLevel::Critical, true) => {
            "Metadata sources are unavailable; showing partial results."
        }
        (DegradationLevel::Critical, false) => {
            "Metadata sources are currently unavailable. Please try again later."
        }
    }
}
