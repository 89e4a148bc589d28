use crate::error::ProviderError;
use crate::providers::{retry_transient, Backends, ContentExtractor};
use crate::rust_scraper::{
    clean_text, count_words, detect_language, extract_with_chain, ExtractionStrategy, FetchedPage,
    RustScraper,
};
use crate::types::PageContent;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

const JINA_READER_URL: &str = "https://r.jina.ai/";
const FETCH_RETRY_WINDOW: Duration = Duration::from_secs(6);

fn parse_page_url(url: &str) -> Option<Url> {
    let parsed = Url::parse(url).ok()?;
    matches!(parsed.scheme(), "http" | "https").then_some(parsed)
}

async fn cached_page(backends: &Backends, key: &str) -> Option<PageContent> {
    let cached = backends.page_cache.get(key).await?;
    if cached.text.as_deref().map_or(true, |t| t.trim().is_empty()) {
        // Invalidate poor/empty cache entries and recompute
        backends.page_cache.invalidate(key).await;
        return None;
    }
    Some(cached)
}

fn page_from_text(url: &str, text: String) -> PageContent {
    let language = detect_language(&text);
    PageContent {
        url: url.to_string(),
        text: Some(text),
        language,
    }
}

/// Fetches the page itself and runs the local extraction strategy chain.
pub struct NativeExtractor {
    backends: Backends,
    scraper: RustScraper,
    chain: Vec<ExtractionStrategy>,
}

impl NativeExtractor {
    pub fn new(backends: Backends) -> Self {
        let scraper = RustScraper::new(backends.http_client.clone());
        Self {
            backends,
            scraper,
            chain: ExtractionStrategy::CHAIN.to_vec(),
        }
    }

    /// Turn a fetched response into text, or `None` when nothing usable is in it.
    async fn text_of(&self, page: FetchedPage) -> Option<String> {
        if !page.is_success() {
            warn!("{} answered HTTP {}", page.url, page.status_code);
            return None;
        }
        if page.is_plain_text() {
            let text = clean_text(&page.body);
            return (count_words(&text) > 0).then_some(text);
        }
        if !page.is_html() {
            warn!("{} has unsupported content type {}", page.url, page.content_type);
            return None;
        }
        let chain = self.chain.clone();
        // HTML parsing is CPU-bound and the parsed trees are not Send.
        let extracted = tokio::task::spawn_blocking(move || {
            extract_with_chain(&page.body, &page.url, &chain)
        })
        .await;
        match extracted {
            Ok(Some((strategy, text))) => {
                info!("{} strategy extracted {} words", strategy.name(), count_words(&text));
                Some(text)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("extraction task failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl ContentExtractor for NativeExtractor {
    fn name(&self) -> &str {
        "native"
    }

    async fn extract(&self, url: &str) -> Result<PageContent, ProviderError> {
        info!("Extracting URL: {}", url);
        let Some(parsed) = parse_page_url(url) else {
            warn!("Invalid URL, must be http(s): {}", url);
            return Ok(PageContent::absent(url));
        };
        if let Some(cached) = cached_page(&self.backends, url).await {
            return Ok(cached);
        }

        let fetched = {
            // Concurrency control
            let _permit = self
                .backends
                .outbound_limit
                .acquire()
                .await
                .map_err(|e| ProviderError::request("native", e))?;
            retry_transient(FETCH_RETRY_WINDOW, || self.scraper.fetch(&parsed)).await
        };
        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                warn!("Failed to fetch {}: {}", url, e);
                return Ok(PageContent::absent(url));
            }
        };

        match self.text_of(page).await {
            Some(text) => {
                let content = page_from_text(url, text);
                self.backends
                    .page_cache
                    .insert(url.to_string(), content.clone())
                    .await;
                Ok(content)
            }
            None => {
                info!("No readable text at {}", url);
                Ok(PageContent::absent(url))
            }
        }
    }
}

/// Delegates extraction to the Jina reader service.
pub struct JinaReaderExtractor {
    backends: Backends,
    api_key: Option<String>,
}

impl JinaReaderExtractor {
    pub fn new(backends: Backends, api_key: Option<String>) -> Self {
        Self { backends, api_key }
    }

    async fn read(&self, url: &str) -> Result<Option<String>, ProviderError> {
        let mut request = self
            .backends
            .http_client
            .get(format!("{}{}", JINA_READER_URL, url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| ProviderError::request("jina", e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::request("jina", e))?;
        if status.is_success() {
            let text = clean_text(&body);
            return Ok((count_words(&text) > 0).then_some(text));
        }
        match ProviderError::from_status("jina", status, &body) {
            // The service itself is refusing us: a provider problem, not a page problem.
            err @ (ProviderError::Auth { .. } | ProviderError::RateLimited { .. }) => Err(err),
            err if err.is_transient() => Err(err),
            err => {
                warn!("Jina fetch error for {}: {}", url, err);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ContentExtractor for JinaReaderExtractor {
    fn name(&self) -> &str {
        "jina"
    }

    async fn extract(&self, url: &str) -> Result<PageContent, ProviderError> {
        info!("Fetching webpage content via Jina reader: {}", url);
        if parse_page_url(url).is_none() {
            warn!("Invalid URL, must be http(s): {}", url);
            return Ok(PageContent::absent(url));
        }
        if let Some(cached) = cached_page(&self.backends, url).await {
            return Ok(cached);
        }

        let _permit = self
            .backends
            .outbound_limit
            .acquire()
            .await
            .map_err(|e| ProviderError::request("jina", e))?;
        let text = match retry_transient(FETCH_RETRY_WINDOW, || self.read(url)).await {
            Ok(text) => text,
            Err(e @ (ProviderError::Auth { .. } | ProviderError::RateLimited { .. })) => {
                return Err(e)
            }
            Err(e) => {
                warn!("Jina reader failed for {}: {}", url, e);
                None
            }
        };

        match text {
            Some(text) => {
                let content = page_from_text(url, text);
                self.backends
                    .page_cache
                    .insert(url.to_string(), content.clone())
                    .await;
                Ok(content)
            }
            None => Ok(PageContent::absent(url)),
        }
    }
}
