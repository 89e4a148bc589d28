//! TextGenerator backends.
//!
//! - OpenAI-compatible chat completions (OpenRouter, OpenAI)
//! - Anthropic Messages API
//! - Ollama `/api/chat`

use crate::error::ProviderError;
use crate::providers::{retry_transient, CompletionOptions, TextGenerator};
use crate::types::*;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const RETRY_WINDOW: Duration = Duration::from_secs(8);

/// Send a prepared request and decode the JSON body, classifying failures.
async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: RequestBuilder,
) -> Result<T, ProviderError> {
    let resp = request
        .send()
        .await
        .map_err(|e| ProviderError::request(provider, e))?;
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| ProviderError::request(provider, e))?;
    debug!("{} raw response: {}", provider, text);
    if !status.is_success() {
        return Err(ProviderError::from_status(provider, status, &text));
    }
    serde_json::from_str(&text).map_err(|e| ProviderError::invalid(provider, e.to_string()))
}

fn non_empty(provider: &str, content: Option<String>) -> Result<String, ProviderError> {
    match content {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(ProviderError::invalid(provider, "empty completion")),
    }
}

fn chat_messages(prompt: &str, options: &CompletionOptions) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &options.system {
        messages.push(ChatMessage::system(system.clone()));
    }
    messages.push(ChatMessage::user(prompt));
    messages
}

/// Chat-completions client for OpenAI and API-compatible gateways.
pub struct OpenAiCompatibleGenerator {
    name: &'static str,
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    extra_headers: Vec<(&'static str, String)>,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatibleGenerator {
    pub fn openrouter(
        client: Client,
        api_key: String,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            name: "openrouter",
            client,
            endpoint: OPENROUTER_URL.to_string(),
            api_key,
            model: model.to_string(),
            extra_headers: vec![
                ("HTTP-Referer", "https://github.com/deep-research/deep-research".to_string()),
                ("X-Title", "Deep Research API".to_string()),
            ],
            temperature,
            max_tokens,
        }
    }

    pub fn openai(
        client: Client,
        api_key: String,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            name: "openai",
            client,
            endpoint: OPENAI_URL.to_string(),
            api_key,
            model: model.to_string(),
            extra_headers: Vec::new(),
            temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    fn name(&self) -> &str {
        self.name
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        info!("Calling {} with model {}", self.name, self.model);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: chat_messages(prompt, options),
            temperature: options.temperature.unwrap_or(self.temperature),
            max_tokens: options.max_tokens.unwrap_or(self.max_tokens),
        };
        let parsed: ChatCompletionResponse = retry_transient(RETRY_WINDOW, || {
            let mut request = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body);
            for (header, value) in &self.extra_headers {
                request = request.header(*header, value);
            }
            send_json(self.name, request)
        })
        .await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content);
        non_empty(self.name, content)
    }
}

/// Anthropic Messages API client. The system prompt travels in its own field.
pub struct AnthropicGenerator {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl AnthropicGenerator {
    pub fn new(
        client: Client,
        api_key: String,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            client,
            endpoint: ANTHROPIC_URL.to_string(),
            api_key,
            model: model.to_string(),
            temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl TextGenerator for AnthropicGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        info!("Calling anthropic with model {}", self.model);
        let body = AnthropicRequest {
            model: &self.model,
            system: options.system.as_deref(),
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: options.max_tokens.unwrap_or(self.max_tokens),
            temperature: options.temperature.unwrap_or(self.temperature),
        };
        let parsed: AnthropicResponse = retry_transient(RETRY_WINDOW, || {
            let request = self
                .client
                .post(&self.endpoint)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body);
            send_json("anthropic", request)
        })
        .await?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        non_empty("anthropic", Some(text))
    }
}

/// Local Ollama server, non-streaming chat endpoint.
pub struct OllamaGenerator {
    client: Client,
    url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OllamaGenerator {
    pub fn new(client: Client, host: &str, model: &str, temperature: f32, max_tokens: u32) -> Self {
        Self {
            client,
            url: format!("{}/api/chat", host.trim_end_matches('/')),
            model: model.to_string(),
            temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl TextGenerator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        info!("Calling ollama with model {}", self.model);
        let body = OllamaChatRequest {
            model: &self.model,
            messages: chat_messages(prompt, options),
            stream: false,
            options: OllamaOptions {
                temperature: options.temperature.unwrap_or(self.temperature),
                num_predict: options.max_tokens.unwrap_or(self.max_tokens),
            },
        };
        let parsed: OllamaChatResponse = retry_transient(RETRY_WINDOW, || {
            send_json("ollama", self.client.post(&self.url).json(&body))
        })
        .await?;
        non_empty("ollama", parsed.message.map(|m| m.content))
    }
}
