//! Process configuration.
//!
//! Settings are resolved once, up front, from environment variables (after an
//! optional `.env` file) and handed to whatever needs them. Nothing below the
//! binaries reads the environment.

use crate::error::ConfigError;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    OpenRouter,
    OpenAi,
    Anthropic,
    Ollama,
}

impl FromStr for LlmProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openrouter" => Ok(Self::OpenRouter),
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unsupported LLM provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProviderKind {
    Searxng,
    SerpApi,
    Bing,
    DuckDuckGo,
}

impl FromStr for SearchProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "searxng" => Ok(Self::Searxng),
            "serpapi" => Ok(Self::SerpApi),
            "bing" => Ok(Self::Bing),
            "ddg" | "duckduckgo" => Ok(Self::DuckDuckGo),
            other => Err(format!("unsupported search provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    Native,
    Jina,
}

impl FromStr for ExtractorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "jina" => Ok(Self::Jina),
            other => Err(format!("unsupported extractor '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProviderKind,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub ollama_host: String,
    pub ollama_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmSettings {
    pub fn model(&self) -> &str {
        match self.provider {
            LlmProviderKind::OpenRouter => &self.openrouter_model,
            LlmProviderKind::OpenAi => &self.openai_model,
            LlmProviderKind::Anthropic => &self.anthropic_model,
            LlmProviderKind::Ollama => &self.ollama_model,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub provider: SearchProviderKind,
    pub searxng_url: String,
    pub searxng_engines: String,
    pub serpapi_api_key: Option<String>,
    pub bing_api_key: Option<String>,
    pub results_per_query: u32,
}

#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub kind: ExtractorKind,
    pub jina_api_key: Option<String>,
}

/// Tunables of the research loop itself.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub queries_per_round: usize,
    pub min_parsed_queries: usize,
    pub page_concurrency: usize,
    pub call_timeout: Duration,
    pub max_page_chars: usize,
    pub judge_sufficiency: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            queries_per_round: 4,
            min_parsed_queries: 2,
            page_concurrency: 4,
            call_timeout: Duration::from_secs(60),
            max_page_chars: 20_000,
            judge_sufficiency: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub output_dir: String,
    pub llm: LlmSettings,
    pub search: SearchSettings,
    pub extractor: ExtractorSettings,
    pub engine: EngineSettings,
}

impl Settings {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let llm = LlmSettings {
            provider: parse_or(&get, "LLM_PROVIDER", LlmProviderKind::OpenRouter)?,
            openrouter_api_key: get("OPENROUTER_API_KEY"),
            openrouter_model: text("OPENROUTER_MODEL", "anthropic/claude-3.5-haiku"),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: text("OPENAI_MODEL", "gpt-3.5-turbo"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            anthropic_model: text("ANTHROPIC_MODEL", "claude-3-haiku-20240307"),
            ollama_host: text("OLLAMA_HOST", "http://localhost:11434"),
            ollama_model: text("OLLAMA_MODEL", "llama2"),
            temperature: parse_or(&get, "LLM_TEMPERATURE", 0.3)?,
            max_tokens: parse_or(&get, "LLM_MAX_TOKENS", 1000)?,
        };

        let search = SearchSettings {
            provider: parse_or(&get, "SEARCH_PROVIDER", SearchProviderKind::Searxng)?,
            searxng_url: text("SEARXNG_URL", "http://localhost:8888"),
            searxng_engines: text("SEARXNG_ENGINES", "duckduckgo,google,bing"),
            serpapi_api_key: get("SERPAPI_API_KEY"),
            bing_api_key: get("BING_API_KEY"),
            results_per_query: parse_or(&get, "RESULTS_PER_QUERY", 10)?,
        };

        let extractor = ExtractorSettings {
            kind: parse_or(&get, "EXTRACTOR", ExtractorKind::Native)?,
            jina_api_key: get("JINA_API_KEY"),
        };

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            queries_per_round: parse_or(&get, "QUERIES_PER_ROUND", defaults.queries_per_round)?,
            min_parsed_queries: parse_or(&get, "MIN_PARSED_QUERIES", defaults.min_parsed_queries)?,
            page_concurrency: parse_or(&get, "PAGE_CONCURRENCY", defaults.page_concurrency)?,
            call_timeout: Duration::from_secs(parse_or(
                &get,
                "CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )?),
            max_page_chars: parse_or(&get, "MAX_PAGE_CHARS", defaults.max_page_chars)?,
            judge_sufficiency: parse_or(&get, "JUDGE_SUFFICIENCY", defaults.judge_sufficiency)?,
        };

        let settings = Self {
            bind_addr: text("BIND_ADDR", "0.0.0.0:5000"),
            output_dir: text("RESEARCH_OUTPUT_DIR", "research_outputs"),
            llm,
            search,
            extractor,
            engine,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("QUERIES_PER_ROUND", self.engine.queries_per_round),
            ("PAGE_CONCURRENCY", self.engine.page_concurrency),
            ("MAX_PAGE_CHARS", self.engine.max_page_chars),
            ("RESULTS_PER_QUERY", self.search.results_per_query as usize),
            ("CALL_TIMEOUT_SECS", self.engine.call_timeout.as_secs() as usize),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.engine.min_parsed_queries > self.engine.queries_per_round {
            return Err(ConfigError::Invalid {
                key: "MIN_PARSED_QUERIES".to_string(),
                message: format!(
                    "must not exceed QUERIES_PER_ROUND ({})",
                    self.engine.queries_per_round
                ),
            });
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}
