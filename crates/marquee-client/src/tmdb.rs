//! TMDb (The Movie Database) v3 search.

use std::time::Duration;

use async_trait::async_trait;
use marquee_core::error::AppError;
use marquee_core::models::{MediaType, MetadataItem, ProviderSource, SearchRequest, SearchResult};
use marquee_core::traits::Provider;
use reqwest::Client;
use serde::Deserialize;

use crate::http::{self, DEFAULT_TIMEOUT, USER_AGENT};
use crate::score::{best_confidence, parse_year};

const TMDB_BASE_URL: &str = "https://api.themoviedb.org/3";
const TMDB_IMAGE_BASE: &str = "https://image.tmdb.org/t/p/w500";

#[derive(Clone)]
enum Credential {
    /// v3 API key, sent as a query parameter.
    ApiKey(String),
    /// v4 read access token, sent as a bearer header.
    Bearer(String),
}

impl Credential {
    fn detect(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else if raw.starts_with("eyJ") {
            Some(Credential::Bearer(raw.to_string()))
        } else {
            Some(Credential::ApiKey(raw.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TmdbSearchResponse {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    total_results: u32,
    #[serde(default)]
    results: Vec<TmdbResult>,
}

/// Movie and TV results share one shape; movies use `title`, TV uses `name`.
#[derive(Debug, Deserialize)]
struct TmdbResult {
    id: u64,
    title: Option<String>,
    name: Option<String>,
    original_title: Option<String>,
    original_name: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
    overview: Option<String>,
    poster_path: Option<String>,
    vote_average: Option<f64>,
}

/// TMDb metadata provider.
///
/// Unavailable (and skipped by the orchestrator) until a credential is set.
#[derive(Clone)]
pub struct TmdbProvider {
    client: Client,
    base_url: String,
    credential: Option<Credential>,
    timeout_secs: u64,
}

impl TmdbProvider {
    /// `api_key` may be a v3 key or a v4 read access token.
    pub fn new(api_key: Option<&str>) -> Result<Self, AppError> {
        Self::with_timeout(api_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(api_key: Option<&str>, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: http::build_client(timeout, USER_AGENT)?,
            base_url: TMDB_BASE_URL.to_string(),
            credential: api_key.and_then(Credential::detect),
            timeout_secs: timeout.as_secs(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, AppError> {
        self.base_url = http::normalize_base_url(base_url)?;
        Ok(self)
    }
}

fn search_path(media_type: MediaType) -> &'static str {
    match media_type {
        MediaType::Movie => "/search/movie",
        MediaType::Tv => "/search/tv",
    }
}

fn to_search_result(response: TmdbSearchResponse, request: &SearchRequest) -> SearchResult {
    let mut items: Vec<MetadataItem> = response
        .results
        .into_iter()
        .filter_map(|r| {
            let (localized, original, date) = match request.media_type {
                MediaType::Movie => (r.title, r.original_title, r.release_date),
                MediaType::Tv => (r.name, r.original_name, r.first_air_date),
            };
            let localized = localized.filter(|t| !t.trim().is_empty());
            let title = original.filter(|t| !t.trim().is_empty()).or_else(|| localized.clone())?;
            let year = parse_year(date.as_deref());

            let names = std::iter::once(title.as_str()).chain(localized.as_deref());
            let confidence = best_confidence(&request.query, names, request.year, year);

            Some(MetadataItem {
                id: r.id.to_string(),
                localized_title: localized.filter(|l| *l != title),
                title,
                year,
                media_type: request.media_type,
                overview: r.overview.filter(|o| !o.trim().is_empty()),
                poster_url: r.poster_path.map(|p| format!("{TMDB_IMAGE_BASE}{p}")),
                rating: r.vote_average,
                confidence,
            })
        })
        .collect();

    items.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    SearchResult {
        source: ProviderSource::Tmdb,
        items,
        page: response.page.max(1),
        total_pages: response.total_pages,
        total_results: response.total_results,
    }
}

#[async_trait]
impl Provider for TmdbProvider {
    fn name(&self) -> &str {
        "tmdb"
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Tmdb
    }

    fn is_available(&self) -> bool {
        self.credential.is_some()
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResult, AppError> {
        let credential = self
            .credential
            .as_ref()
            .ok_or_else(|| AppError::ConfigError("TMDB_API_KEY not set".into()))?;

        let page = request.page.to_string();
        let year = request.year.map(|y| y.to_string());
        let mut params: Vec<(&str, &str)> = vec![
            ("query", request.query.as_str()),
            ("page", page.as_str()),
            ("language", request.language.as_str()),
            ("include_adult", "false"),
        ];
        if let Some(year) = &year {
            let key = match request.media_type {
                MediaType::Movie => "year",
                MediaType::Tv => "first_air_date_year",
            };
            params.push((key, year.as_str()));
        }

        let url = format!("{}{}", self.base_url, search_path(request.media_type));
        let mut builder = self.client.get(&url);
        match credential {
            Credential::ApiKey(key) => params.push(("api_key", key.as_str())),
            Credential::Bearer(token) => builder = builder.bearer_auth(token),
        }

        tracing::debug!(query = %request.query, media_type = %request.media_type, "TMDb search");

        let response = builder
            .query(&params)
            .send()
            .await
            .map_err(|e| http::map_send_error(e, self.timeout_secs))?;
        let response = http::check_status("tmdb", response).await?;

        let body: TmdbSearchResponse = response
            .json()
            .await
            .map_err(|e| http::decode_error("tmdb", e, self.timeout_secs))?;

        Ok(to_search_result(body, request))
    }
}
