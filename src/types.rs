use serde::{Deserialize, Serialize};

use crate::events::StreamEvent;

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const MAX_ITERATIONS_LIMIT: u32 = 20;

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ResearchRequest {
    /// The research question to investigate
    pub query: String,
    /// Upper bound on search rounds (1-20, default 10)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            query: query.into(),
            max_iterations,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.query.trim().is_empty() {
            return Err("query must not be empty".to_string());
        }
        if !(1..=MAX_ITERATIONS_LIMIT).contains(&self.max_iterations) {
            return Err(format!(
                "max_iterations must be between 1 and {}",
                MAX_ITERATIONS_LIMIT
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResearchResponse {
    pub id: String,
    pub report: String,
    pub logs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

/// A search query generated for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub iteration: u32,
}

/// One search result as returned by a WebSearcher.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// A newly discovered URL together with the query that found it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: String,
    pub source_query: String,
}

/// Text pulled out of one page. `text == None` means nothing was retrievable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    pub text: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl PageContent {
    pub fn absent(url: &str) -> Self {
        Self {
            url: url.to_string(),
            text: None,
            language: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    pub url: String,
    pub useful: bool,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFragment {
    pub url: String,
    pub snippet: String,
    pub iteration: u32,
}

/// Final output of a completed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchReport {
    pub id: String,
    pub query: String,
    pub body: String,
    pub iterations: u32,
    pub fragments: Vec<ContextFragment>,
    pub events: Vec<StreamEvent>,
}

impl ResearchReport {
    /// Human-readable process log, one line per event.
    pub fn logs(&self) -> Vec<String> {
        self.events.iter().map(StreamEvent::log_line).collect()
    }
}

// SearXNG API types
#[derive(Debug, Deserialize)]
pub struct SearxngResponse {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub number_of_results: f64,
    #[serde(default)]
    pub results: Vec<SearxngResult>,
}

#[derive(Debug, Deserialize)]
pub struct SearxngResult {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

// SerpAPI types
#[derive(Debug, Deserialize)]
pub struct SerpApiResponse {
    #[serde(default)]
    pub organic_results: Vec<SerpApiResult>,
}

#[derive(Debug, Deserialize)]
pub struct SerpApiResult {
    pub link: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

// Bing Web Search types
#[derive(Debug, Deserialize)]
pub struct BingResponse {
    #[serde(rename = "webPages", default)]
    pub web_pages: Option<BingWebPages>,
}

#[derive(Debug, Deserialize)]
pub struct BingWebPages {
    #[serde(default)]
    pub value: Vec<BingWebPage>,
}

#[derive(Debug, Deserialize)]
pub struct BingWebPage {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub snippet: String,
}

// Chat completion types (OpenAI-compatible, Anthropic, Ollama)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AnthropicRequest<'a> {
    pub model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicResponse {
    #[serde(default)]
    pub content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OllamaChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub options: OllamaOptions,
}

#[derive(Debug, Serialize)]
pub struct OllamaOptions {
    pub temperature: f32,
    pub num_predict: u32,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChatResponse {
    pub message: Option<ChatMessage>,
}
