use std::time::Duration;

use marquee_core::error::AppError;
use marquee_core::models::KeywordVariants;
use marquee_core::traits::KeywordGenerator;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::http;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SYSTEM_PROMPT: &str = "You help find films and TV series in metadata databases. \
Given a title that returned no results, suggest alternate spellings, common alternate titles, \
and the official localized titles in other languages (especially Chinese, Japanese and English). \
Respond ONLY with a JSON object of the form {\"alternatives\": [..], \"localized\": [..]}. \
Use at most five entries per list and do not repeat the input title.";

/// OpenAI-compatible chat client that proposes alternate search titles.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
/// - Local servers exposing `/chat/completions`
#[derive(Clone)]
pub struct OpenAiKeywordGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
}

impl OpenAiKeywordGenerator {
    pub fn new(api_key: &str, model: Option<&str>) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        api_key: &str,
        model: Option<&str>,
        base_url: &str,
    ) -> Result<Self, AppError> {
        Self::build(
            api_key,
            model.unwrap_or(DEFAULT_MODEL),
            base_url,
            DEFAULT_LLM_TIMEOUT,
        )
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.api_key, &self.model, &self.base_url, timeout)
            .map(|g| g.with_system_prompt(self.system_prompt))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        if api_key.trim().is_empty() {
            return Err(AppError::ConfigError("LLM API key is empty".into()));
        }

        Ok(Self {
            client: http::build_client(timeout, http::USER_AGENT)?,
            base_url: http::normalize_base_url(base_url)?,
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct KeywordPayload {
    #[serde(default)]
    alternatives: Vec<String>,
    #[serde(default)]
    localized: Vec<String>,
}

/// Parse the model's reply, tolerating a Markdown code fence around the JSON.
fn parse_keywords(title: &str, content: &str) -> Result<KeywordVariants, AppError> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let payload: KeywordPayload = serde_json::from_str(json).map_err(|e| {
        AppError::SerializationError(format!("LLM returned invalid JSON: {e}. Raw: {content}"))
    })?;

    Ok(KeywordVariants {
        original: title.to_string(),
        alternatives: payload.alternatives,
        localized: payload.localized,
    })
}

impl KeywordGenerator for OpenAiKeywordGenerator {
    async fn generate_keywords(&self, title: &str) -> Result<KeywordVariants, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let user = format!("Title: {title}");

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &self.system_prompt,
                },
                Message {
                    role: "user",
                    content: &user,
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
            temperature: 0.2,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| http::map_send_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(http::status_error("llm", status, &message));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| http::decode_error("llm", e, self.timeout_secs))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| AppError::ProviderError {
                provider: "llm".into(),
                message: "Empty response from LLM".into(),
                status_code: 200,
                retryable: false,
            })?;

        let keywords = parse_keywords(title, content)?;
        tracing::debug!(
            %title,
            alternatives = keywords.alternatives.len(),
            localized = keywords.localized.len(),
            "Generated keyword variants"
        );
        Ok(keywords)
    }
}
