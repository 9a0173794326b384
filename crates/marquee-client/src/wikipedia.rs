//! Wikipedia search through the MediaWiki API.
//!
//! Last-resort source: article titles such as `Heat (1995 film)` are split
//! into title, year and kind. The wiki language follows the request language.

use std::time::Duration;

use async_trait::async_trait;
use marquee_core::error::AppError;
use marquee_core::models::{MediaType, MetadataItem, ProviderSource, SearchRequest, SearchResult};
use marquee_core::traits::Provider;
use reqwest::Client;
use serde::Deserialize;

use crate::http::{self, DEFAULT_TIMEOUT, USER_AGENT};
use crate::score::confidence;

const PAGE_SIZE: u32 = 10;

#[derive(Debug, Deserialize)]
struct WikiResponse {
    #[serde(default)]
    query: Option<WikiQuery>,
}

#[derive(Debug, Deserialize)]
struct WikiQuery {
    #[serde(default)]
    searchinfo: Option<SearchInfo>,
    #[serde(default)]
    search: Vec<WikiHit>,
}

#[derive(Debug, Deserialize)]
struct SearchInfo {
    #[serde(default)]
    totalhits: u32,
}

#[derive(Debug, Deserialize)]
struct WikiHit {
    pageid: u64,
    title: String,
    #[serde(default)]
    snippet: String,
}

#[derive(Clone)]
pub struct WikipediaProvider {
    client: Client,
    /// Fixed endpoint; when unset the per-language host is used.
    endpoint: Option<String>,
    timeout_secs: u64,
}

impl WikipediaProvider {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: http::build_client(timeout, USER_AGENT)?,
            endpoint: None,
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Send every request to `endpoint` (the full `api.php` URL).
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, AppError> {
        self.endpoint = Some(http::normalize_base_url(endpoint)?);
        Ok(self)
    }

    fn endpoint_for(&self, language: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://{}.wikipedia.org/w/api.php", wiki_language(language)),
        }
    }
}

/// `"zh-CN"` -> `"zh"`. Anything that is not a plain language code falls back to English.
fn wiki_language(language: &str) -> String {
    let code = language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_lowercase();
    if (2..=3).contains(&code.len()) && code.chars().all(|c| c.is_ascii_lowercase()) {
        code
    } else {
        "en".to_string()
    }
}

fn search_terms(request: &SearchRequest) -> String {
    let kind = match request.media_type {
        MediaType::Movie => "film",
        MediaType::Tv => "television series",
    };
    match request.year {
        Some(year) => format!("{} {} {}", request.query, year, kind),
        None => format!("{} {}", request.query, kind),
    }
}

/// Split `Heat (1995 film)` into `("Heat", Some(1995), Some(Movie))`.
fn parse_article_title(title: &str) -> (String, Option<u16>, Option<MediaType>) {
    let Some((name, rest)) = title.rsplit_once(" (") else {
        return (title.trim().to_string(), None, None);
    };
    let Some(qualifier) = rest.strip_suffix(')') else {
        return (title.trim().to_string(), None, None);
    };

    let qualifier = qualifier.to_lowercase();
    let kind = if qualifier.contains("film") || qualifier.contains("movie") {
        Some(MediaType::Movie)
    } else if qualifier.contains("tv") || qualifier.contains("series") {
        Some(MediaType::Tv)
    } else {
        None
    };
    let year = qualifier
        .split_whitespace()
        .next()
        .filter(|w| w.len() == 4)
        .and_then(|w| w.parse::<u16>().ok());

    if kind.is_none() && year.is_none() {
        // Not a media qualifier, e.g. "Paris (disambiguation)".
        return (title.trim().to_string(), None, None);
    }
    (name.trim().to_string(), year, kind)
}

/// Drop the `<span class="searchmatch">` markup MediaWiki puts in snippets.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn to_search_result(response: WikiResponse, request: &SearchRequest) -> SearchResult {
    let Some(query) = response.query else {
        return SearchResult::empty(ProviderSource::Wikipedia, request.page);
    };

    let mut items: Vec<MetadataItem> = query
        .search
        .into_iter()
        .filter_map(|hit| {
            let (title, year, kind) = parse_article_title(&hit.title);
            if kind.is_some_and(|k| k != request.media_type) || title.is_empty() {
                return None;
            }
            // Articles without a media qualifier are weaker evidence.
            let penalty = if kind.is_none() { 0.1 } else { 0.0 };
            let score = (confidence(&request.query, &title, request.year, year) - penalty).max(0.0);
            let overview = strip_tags(&hit.snippet);

            Some(MetadataItem {
                id: hit.pageid.to_string(),
                title,
                localized_title: None,
                year,
                media_type: request.media_type,
                overview: Some(overview).filter(|o| !o.is_empty()),
                poster_url: None,
                rating: None,
                confidence: score,
            })
        })
        .collect();

    items.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total = query.searchinfo.map(|i| i.totalhits).unwrap_or_default();
    SearchResult {
        source: ProviderSource::Wikipedia,
        items,
        page: request.page,
        total_pages: total.div_ceil(PAGE_SIZE),
        total_results: total,
    }
}

#[async_trait]
impl Provider for WikipediaProvider {
    fn name(&self) -> &str {
        "wikipedia"
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Wikipedia
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResult, AppError> {
        let endpoint = self.endpoint_for(&request.language);
        let terms = search_terms(request);
        let limit = PAGE_SIZE.to_string();
        let offset = (request.page.saturating_sub(1) * PAGE_SIZE).to_string();

        tracing::debug!(query = %request.query, %endpoint, "Wikipedia search");

        let response = self
            .client
            .get(&endpoint)
            .query(&[
                ("action", "query"),
                ("list", "search"),
                ("format", "json"),
                ("srsearch", terms.as_str()),
                ("srlimit", limit.as_str()),
                ("sroffset", offset.as_str()),
            ])
            .send()
            .await
            .map_err(|e| http::map_send_error(e, self.timeout_secs))?;
        let response = http::check_status("wikipedia", response).await?;

        let body: WikiResponse = response
            .json()
            .await
            .map_err(|e| http::decode_error("wikipedia", e, self.timeout_secs))?;

        Ok(to_search_result(body, request))
    }
}
