use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Kind of media a search targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Tv => "tv",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "movie" | "film" => Ok(MediaType::Movie),
            "tv" | "series" | "show" => Ok(MediaType::Tv),
            _ => Err(format!("Unknown media type: {}", s)),
        }
    }
}

/// A metadata search issued by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub media_type: MediaType,
    pub year: Option<u16>,
    pub page: u32,
    pub language: String,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            query: query.into(),
            media_type,
            year: None,
            page: 1,
            language: "en-US".to_string(),
        }
    }

    pub fn with_year(mut self, year: u16) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Same request with a different query text (used for keyword variants).
    pub fn with_query(&self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..self.clone()
        }
    }

    /// Rejects requests no provider could serve.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.query.trim().is_empty() {
            return Err(AppError::InvalidRequest("query must not be empty".into()));
        }
        if self.page == 0 {
            return Err(AppError::InvalidRequest("page numbers start at 1".into()));
        }
        Ok(())
    }

    /// Normalized key identifying equivalent requests.
    pub fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.media_type,
            self.query.trim().to_lowercase(),
            self.year.map(|y| y.to_string()).unwrap_or_default(),
            self.page,
            self.language.to_lowercase()
        )
    }
}

/// One metadata match returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    /// Provider-specific identifier.
    pub id: String,
    pub title: String,
    /// Title in the request language, when the provider offers one.
    pub localized_title: Option<String>,
    pub year: Option<u16>,
    pub media_type: MediaType,
    pub overview: Option<String>,
    pub poster_url: Option<String>,
    /// Community rating, 0.0 - 10.0.
    pub rating: Option<f64>,
    /// How well this item matches the query, 0.0 - 1.0.
    pub confidence: f64,
}

/// Closed set of provider variants the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSource {
    Tmdb,
    Douban,
    Wikipedia,
}

impl ProviderSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderSource::Tmdb => "tmdb",
            ProviderSource::Douban => "douban",
            ProviderSource::Wikipedia => "wikipedia",
        }
    }
}

impl fmt::Display for ProviderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tmdb" => Ok(ProviderSource::Tmdb),
            "douban" => Ok(ProviderSource::Douban),
            "wikipedia" | "wiki" => Ok(ProviderSource::Wikipedia),
            _ => Err(format!("Unknown provider source: {}", s)),
        }
    }
}

/// A page of matches from a single provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub source: ProviderSource,
    pub items: Vec<MetadataItem>,
    pub page: u32,
    pub total_pages: u32,
    pub total_results: u32,
}

impl SearchResult {
    pub fn empty(source: ProviderSource, page: u32) -> Self {
        Self {
            source,
            items: Vec::new(),
            page,
            total_pages: 0,
            total_results: 0,
        }
    }

    pub fn has_results(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn best_confidence(&self) -> Option<f64> {
        self.items
            .iter()
            .map(|i| i.confidence)
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }
}

/// Whether a provider can currently be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Available,
    Unavailable,
    CircuitOpen,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderStatus::Available => "available",
            ProviderStatus::Unavailable => "unavailable",
            ProviderStatus::CircuitOpen => "circuit_open",
        };
        write!(f, "{s}")
    }
}

/// Alternate spellings and names for a title.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordVariants {
    pub original: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub localized: Vec<String>,
}

impl KeywordVariants {
    pub fn new(original: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            ..Default::default()
        }
    }

    /// Distinct variants in priority order (alternatives, then localized),
    /// excluding the original title, at most `limit` of them.
    pub fn variants(&self, limit: usize) -> Vec<String> {
        let mut seen = vec![self.original.trim().to_lowercase()];
        let mut out = Vec::new();
        for candidate in self.alternatives.iter().chain(self.localized.iter()) {
            let trimmed = candidate.trim();
            if trimmed.is_empty() {
                continue;
            }
            let key = trimmed.to_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            out.push(trimmed.to_string());
            if out.len() >= limit {
                break;
            }
        }
        out
    }
}

/// Which loop of the fallback chain produced an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchPhase {
    Primary,
    Keyword,
}

/// What happened to a provider during one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    /// The provider was actually called.
    Called,
    /// The breaker refused the call.
    CircuitOpen,
    /// The provider reported itself unavailable (e.g. missing credentials).
    Unavailable,
}

/// One entry in the fallback audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub provider: String,
    pub success: bool,
    pub error: Option<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub kind: AttemptKind,
    pub phase: SearchPhase,
    pub query: String,
}

/// Ordered record of every provider attempt for one search, in call order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackStatus {
    pub attempts: Vec<Attempt>,
    pub cancelled: bool,
    /// Number of full provider loops executed (primary + keyword variants).
    pub phases_run: u32,
}

impl FallbackStatus {
    pub fn push(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    /// True when no attempt produced a usable result.
    pub fn all_failed(&self) -> bool {
        !self.attempts.iter().any(|a| a.success)
    }

    pub fn successful_provider(&self) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.success)
            .map(|a| a.provider.as_str())
    }

    pub fn circuit_open_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.kind == AttemptKind::CircuitOpen)
            .count()
    }
}

/// What a search produced: a result (first success wins) and the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub result: Option<SearchResult>,
    pub status: FallbackStatus,
}

impl SearchOutcome {
    pub fn found(&self) -> bool {
        self.result.as_ref().is_some_and(SearchResult::has_results)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
