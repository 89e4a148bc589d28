//! Capability interfaces the research engine depends on, and their wiring.
//!
//! The engine only ever sees `Arc<dyn TextGenerator>`, `Arc<dyn WebSearcher>`
//! and `Arc<dyn ContentExtractor>`. Which backend sits behind each is decided
//! once per session by [`Providers::from_settings`].

use crate::config::{ExtractorKind, LlmProviderKind, SearchProviderKind, Settings};
use crate::error::{ConfigError, ProviderError};
use crate::llm::{AnthropicGenerator, OllamaGenerator, OpenAiCompatibleGenerator};
use crate::scrape::{JinaReaderExtractor, NativeExtractor};
use crate::search::{BingSearcher, DuckDuckGoSearcher, SearxngSearcher, SerpApiSearcher};
use crate::types::{PageContent, SearchHit};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

/// Per-call generation options. `None` falls back to the backend's defaults.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionOptions {
    pub fn with_system(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait WebSearcher: Send + Sync {
    fn name(&self) -> &str;

    /// Ordered results for `query`. No results is `Ok(vec![])`, not an error.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ProviderError>;
}

#[async_trait]
pub trait ContentExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Unreachable or unreadable pages come back as `PageContent { text: None }`.
    async fn extract(&self, url: &str) -> Result<PageContent, ProviderError>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared HTTP plumbing handed to every backend.
#[derive(Clone)]
pub struct Backends {
    pub http_client: reqwest::Client,
    // Caches for performance
    pub search_cache: moka::future::Cache<String, Vec<SearchHit>>, // key: provider + query
    pub page_cache: moka::future::Cache<String, PageContent>,       // key: url
    // Concurrency control for external calls
    pub outbound_limit: Arc<Semaphore>,
}

/// Outbound client shared by all backends.
///
/// Only connecting is bounded here; whole-call limits come from
/// [`with_timeout`] so `CALL_TIMEOUT_SECS` is the single knob.
pub fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}

impl Backends {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            search_cache: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(60 * 10))
                .build(),
            page_cache: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(60 * 30))
                .build(),
            outbound_limit: Arc::new(Semaphore::new(32)),
        }
    }
}

/// The resolved backend trio for one session.
#[derive(Clone)]
pub struct Providers {
    pub generator: Arc<dyn TextGenerator>,
    pub searcher: Arc<dyn WebSearcher>,
    pub extractor: Arc<dyn ContentExtractor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub generator: String,
    pub searcher: String,
    pub extractor: String,
}

impl Providers {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        searcher: Arc<dyn WebSearcher>,
        extractor: Arc<dyn ContentExtractor>,
    ) -> Self {
        Self {
            generator,
            searcher,
            extractor,
        }
    }

    pub fn from_settings(settings: &Settings, backends: &Backends) -> Result<Self, ConfigError> {
        let llm = &settings.llm;
        let client = backends.http_client.clone();
        let generator: Arc<dyn TextGenerator> = match llm.provider {
            LlmProviderKind::OpenRouter => Arc::new(OpenAiCompatibleGenerator::openrouter(
                client.clone(),
                require(&llm.openrouter_api_key, "OPENROUTER_API_KEY")?,
                &llm.openrouter_model,
                llm.temperature,
                llm.max_tokens,
            )),
            LlmProviderKind::OpenAi => Arc::new(OpenAiCompatibleGenerator::openai(
                client.clone(),
                require(&llm.openai_api_key, "OPENAI_API_KEY")?,
                &llm.openai_model,
                llm.temperature,
                llm.max_tokens,
            )),
            LlmProviderKind::Anthropic => Arc::new(AnthropicGenerator::new(
                client.clone(),
                require(&llm.anthropic_api_key, "ANTHROPIC_API_KEY")?,
                &llm.anthropic_model,
                llm.temperature,
                llm.max_tokens,
            )),
            LlmProviderKind::Ollama => Arc::new(OllamaGenerator::new(
                client.clone(),
                &llm.ollama_host,
                &llm.ollama_model,
                llm.temperature,
                llm.max_tokens,
            )),
        };

        let search = &settings.search;
        let ddg = || -> Arc<dyn WebSearcher> {
            Arc::new(DuckDuckGoSearcher::new(backends.clone(), search.results_per_query))
        };
        let searcher: Arc<dyn WebSearcher> = match search.provider {
            SearchProviderKind::Searxng => Arc::new(SearxngSearcher::new(
                backends.clone(),
                &search.searxng_url,
                &search.searxng_engines,
            )),
            SearchProviderKind::SerpApi => match &search.serpapi_api_key {
                Some(key) => Arc::new(SerpApiSearcher::new(
                    backends.clone(),
                    key.clone(),
                    search.results_per_query,
                )),
                None => {
                    warn!("SerpAPI selected but no API key provided, falling back to DuckDuckGo");
                    ddg()
                }
            },
            SearchProviderKind::Bing => match &search.bing_api_key {
                Some(key) => Arc::new(BingSearcher::new(
                    backends.clone(),
                    key.clone(),
                    search.results_per_query,
                )),
                None => {
                    warn!("Bing selected but no API key provided, falling back to DuckDuckGo");
                    ddg()
                }
            },
            SearchProviderKind::DuckDuckGo => ddg(),
        };

        let extractor: Arc<dyn ContentExtractor> = match settings.extractor.kind {
            ExtractorKind::Native => Arc::new(NativeExtractor::new(backends.clone())),
            ExtractorKind::Jina => Arc::new(JinaReaderExtractor::new(
                backends.clone(),
                settings.extractor.jina_api_key.clone(),
            )),
        };

        Ok(Self::new(generator, searcher, extractor))
    }

    pub fn summary(&self) -> ProviderSummary {
        ProviderSummary {
            generator: self.generator.name().to_string(),
            searcher: self.searcher.name().to_string(),
            extractor: self.extractor.name().to_string(),
        }
    }
}

fn require(value: &Option<String>, key: &str) -> Result<String, ConfigError> {
    value.clone().ok_or_else(|| ConfigError::Missing {
        key: key.to_string(),
    })
}

/// Bound one external call. Elapsing counts as a `ProviderError::Timeout`.
pub async fn with_timeout<T, F>(provider: &str, limit: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            provider: provider.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

/// Retry transient backend failures with exponential backoff; permanent
/// failures (auth, bad request, malformed body) return immediately.
pub(crate) async fn retry_transient<T, F, Fut>(
    max_elapsed: Duration,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    retry(
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(max_elapsed))
            .build(),
        || {
            let attempt = operation();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
    )
    .await
}
