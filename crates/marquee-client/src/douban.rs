//! Douban movie search via the public subject-suggest endpoint.
//!
//! No credentials are needed. Strong for Chinese titles, which makes it a
//! natural target for localized keyword variants.

use std::time::Duration;

use async_trait::async_trait;
use marquee_core::error::AppError;
use marquee_core::models::{MediaType, MetadataItem, ProviderSource, SearchRequest, SearchResult};
use marquee_core::traits::Provider;
use reqwest::Client;
use serde::Deserialize;

use crate::http::{self, DEFAULT_TIMEOUT};
use crate::score::{best_confidence, parse_year};

const DOUBAN_BASE_URL: &str = "https://movie.douban.com";

/// Douban rejects obviously non-browser agents.
const DOUBAN_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/124.0 Safari/537.36"
);

#[derive(Debug, Deserialize)]
struct Suggestion {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    sub_title: String,
    #[serde(default)]
    year: String,
    #[serde(default, rename = "type")]
    kind: String,
    /// Episode count; non-empty only for series.
    #[serde(default)]
    episode: String,
    #[serde(default)]
    img: String,
}

#[derive(Clone)]
pub struct DoubanProvider {
    client: Client,
    base_url: String,
    enabled: bool,
    timeout_secs: u64,
}

impl DoubanProvider {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: http::build_client(timeout, DOUBAN_USER_AGENT)?,
            base_url: DOUBAN_BASE_URL.to_string(),
            enabled: true,
            timeout_secs: timeout.as_secs(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, AppError> {
        self.base_url = http::normalize_base_url(base_url)?;
        Ok(self)
    }

    /// A disabled provider reports itself unavailable.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

fn to_search_result(suggestions: Vec<Suggestion>, request: &SearchRequest) -> SearchResult {
    let mut items: Vec<MetadataItem> = suggestions
        .into_iter()
        .filter(|s| s.kind == "movie" && !s.id.is_empty() && !s.title.trim().is_empty())
        .filter(|s| {
            let is_series = !s.episode.trim().is_empty();
            match request.media_type {
                MediaType::Movie => !is_series,
                MediaType::Tv => is_series,
            }
        })
        .map(|s| {
            let year = parse_year(Some(s.year.as_str()));
            let sub_title = Some(s.sub_title.trim().to_string()).filter(|t| !t.is_empty());
            let names = std::iter::once(s.title.as_str()).chain(sub_title.as_deref());
            let confidence = best_confidence(&request.query, names, request.year, year);

            // Douban's primary title is the Chinese one; the sub-title is
            // usually the original or English name.
            let (title, localized_title) = match sub_title {
                Some(sub) => (sub, Some(s.title)),
                None => (s.title, None),
            };

            MetadataItem {
                id: s.id,
                title,
                localized_title,
                year,
                media_type: request.media_type,
                overview: None,
                poster_url: Some(s.img).filter(|u| !u.is_empty()),
                rating: None,
                confidence,
            }
        })
        .collect();

    items.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total = items.len() as u32;
    SearchResult {
        source: ProviderSource::Douban,
        items,
        page: 1,
        total_pages: u32::from(total > 0),
        total_results: total,
    }
}

#[async_trait]
impl Provider for DoubanProvider {
    fn name(&self) -> &str {
        "douban"
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Douban
    }

    fn is_available(&self) -> bool {
        self.enabled
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResult, AppError> {
        // The suggest endpoint has a single page.
        if request.page > 1 {
            return Ok(SearchResult::empty(ProviderSource::Douban, request.page));
        }

        tracing::debug!(query = %request.query, "Douban search");

        let response = self
            .client
            .get(format!("{}/j/subject_suggest", self.base_url))
            .query(&[("q", request.query.as_str())])
            .send()
            .await
            .map_err(|e| http::map_send_error(e, self.timeout_secs))?;
        let response = http::check_status("douban", response).await?;

        let suggestions: Vec<Suggestion> = response
            .json()
            .await
            .map_err(|e| http::decode_error("douban", e, self.timeout_secs))?;

        Ok(to_search_result(suggestions, request))
    }
}
