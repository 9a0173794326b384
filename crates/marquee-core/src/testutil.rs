//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{
    KeywordVariants, MediaType, MetadataItem, ProviderSource, SearchRequest, SearchResult,
};
use crate::retry::{RetryEvent, RetryItem, RetryReporter};
use crate::traits::{KeywordGenerator, Provider, TaskExecutor};

pub fn item(title: &str, confidence: f64) -> MetadataItem {
    MetadataItem {
        id: title.to_lowercase().replace(' ', "-"),
        title: title.to_string(),
        localized_title: None,
        year: None,
        media_type: MediaType::Movie,
        overview: None,
        poster_url: None,
        rating: None,
        confidence,
    }
}

pub fn result(source: ProviderSource, items: Vec<MetadataItem>) -> SearchResult {
    let total = items.len() as u32;
    SearchResult {
        source,
        items,
        page: 1,
        total_pages: 1,
        total_results: total,
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Mock provider with scripted responses.
///
/// Lookup order per call: a response registered for the exact query, then
/// the queued responses, then the fallback.
#[derive(Clone)]
pub struct MockProvider {
    name: String,
    source: ProviderSource,
    available: Arc<AtomicBool>,
    by_query: Arc<Mutex<HashMap<String, Result<SearchResult, AppError>>>>,
    responses: Arc<Mutex<Vec<Result<SearchResult, AppError>>>>,
    fallback: Result<SearchResult, AppError>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    fn with_fallback(name: &str, fallback: Result<SearchResult, AppError>) -> Self {
        Self {
            name: name.to_string(),
            source: ProviderSource::Tmdb,
            available: Arc::new(AtomicBool::new(true)),
            by_query: Arc::new(Mutex::new(HashMap::new())),
            responses: Arc::new(Mutex::new(Vec::new())),
            fallback,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always answers with one item titled `title`.
    pub fn found(name: &str, title: &str) -> Self {
        Self::with_fallback(name, Ok(result(ProviderSource::Tmdb, vec![item(title, 0.9)])))
    }

    /// Always answers with an empty page.
    pub fn empty(name: &str) -> Self {
        Self::with_fallback(name, Ok(SearchResult::empty(ProviderSource::Tmdb, 1)))
    }

    /// Always fails with `error`.
    pub fn failing(name: &str, error: AppError) -> Self {
        Self::with_fallback(name, Err(error))
    }

    pub fn with_source(mut self, source: ProviderSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_query(self, query: &str, response: Result<SearchResult, AppError>) -> Self {
        self.by_query
            .lock()
            .unwrap()
            .insert(query.to_string(), response);
        self
    }

    pub fn with_responses(self, responses: Vec<Result<SearchResult, AppError>>) -> Self {
        *self.responses.lock().unwrap() = responses;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Queries this provider was called with, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> ProviderSource {
        self.source
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResult, AppError> {
        self.calls.lock().unwrap().push(request.query.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.by_query.lock().unwrap().get(&request.query).cloned();
        let response = scripted.unwrap_or_else(|| {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                self.fallback.clone()
            } else {
                responses.remove(0)
            }
        });

        response.map(|mut r| {
            r.source = self.source;
            r
        })
    }
}

// ---------------------------------------------------------------------------
// MockKeywordGenerator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockKeywordGenerator {
    response: Result<KeywordVariants, AppError>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockKeywordGenerator {
    pub fn new(alternatives: &[&str], localized: &[&str]) -> Self {
        Self {
            response: Ok(KeywordVariants {
                original: String::new(),
                alternatives: alternatives.iter().map(|s| s.to_string()).collect(),
                localized: localized.iter().map(|s| s.to_string()).collect(),
            }),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            response: Err(error),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl KeywordGenerator for MockKeywordGenerator {
    async fn generate_keywords(&self, title: &str) -> Result<KeywordVariants, AppError> {
        self.calls.lock().unwrap().push(title.to_string());
        self.response.clone().map(|mut v| {
            v.original = title.to_string();
            v
        })
    }
}

// ---------------------------------------------------------------------------
// MockExecutor
// ---------------------------------------------------------------------------

/// Mock executor that records the task ids it ran.
#[derive(Clone)]
pub struct MockExecutor {
    error: Option<AppError>,
    /// When set, only these task ids fail.
    failing_ids: Option<Vec<String>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockExecutor {
    pub fn always_ok() -> Self {
        Self {
            error: None,
            failing_ids: None,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always_fail(error: AppError) -> Self {
        Self {
            error: Some(error),
            ..Self::always_ok()
        }
    }

    pub fn failing_for(task_ids: &[&str], error: AppError) -> Self {
        Self {
            error: Some(error),
            failing_ids: Some(task_ids.iter().map(|s| s.to_string()).collect()),
            ..Self::always_ok()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl TaskExecutor for MockExecutor {
    async fn execute(&self, _cancel: &CancellationToken, item: &RetryItem) -> Result<(), AppError> {
        self.calls.lock().unwrap().push(item.task_id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let applies = self
            .failing_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(&item.task_id));
        match &self.error {
            Some(e) if applies => Err(e.clone()),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records event names for assertions.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == name).count()
    }
}

impl RetryReporter for MockReporter {
    fn report(&self, event: RetryEvent<'_>) {
        let name = match event {
            RetryEvent::Started => "Started",
            RetryEvent::Tick { .. } => "Tick",
            RetryEvent::Queued { .. } => "Queued",
            RetryEvent::Duplicate { .. } => "Duplicate",
            RetryEvent::Succeeded { .. } => "Succeeded",
            RetryEvent::Failed { .. } => "Failed",
            RetryEvent::Exhausted { .. } => "Exhausted",
            RetryEvent::Dropped { .. } => "Dropped",
            RetryEvent::Cancelled { .. } => "Cancelled",
            RetryEvent::Cleared { .. } => "Cleared",
            RetryEvent::Stopped => "Stopped",
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}
