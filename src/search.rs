use crate::error::ProviderError;
use crate::providers::{retry_transient, Backends, WebSearcher};
use crate::types::*;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const SERPAPI_URL: &str = "https://serpapi.com/search";
const BING_URL: &str = "https://api.bing.microsoft.com/v7.0/search";
const DUCKDUCKGO_URL: &str = "https://html.duckduckgo.com/html/";
const RETRY_WINDOW: Duration = Duration::from_secs(4);
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Cache lookup, outbound permit and URL dedup shared by every searcher.
async fn cached_search<F, Fut>(
    backends: &Backends,
    provider: &str,
    query: &str,
    fetch: F,
) -> Result<Vec<SearchHit>, ProviderError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<SearchHit>, ProviderError>>,
{
    info!("Searching {} for: {}", provider, query);
    let cache_key = format!("{}|q={}", provider, query);
    // Cache hit fast-path
    if let Some(cached) = backends.search_cache.get(&cache_key).await {
        debug!("search cache hit for query");
        return Ok(cached);
    }

    // Acquire rate limiter permit
    let _permit = backends
        .outbound_limit
        .acquire()
        .await
        .map_err(|e| ProviderError::request(provider, e))?;

    let mut seen = HashSet::new();
    let results: Vec<SearchHit> = fetch()
        .await?
        .into_iter()
        .filter(|hit| !hit.url.is_empty() && seen.insert(hit.url.clone()))
        .collect();

    info!("{} returned {} results", provider, results.len());
    backends.search_cache.insert(cache_key, results.clone()).await;
    Ok(results)
}

async fn get_json<T: DeserializeOwned>(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, ProviderError> {
    let resp = request
        .send()
        .await
        .map_err(|e| ProviderError::request(provider, e))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(provider, status, &text));
    }
    resp.json::<T>()
        .await
        .map_err(|e| ProviderError::invalid(provider, e.to_string()))
}

/// Federated search through a SearXNG instance's JSON API.
pub struct SearxngSearcher {
    backends: Backends,
    base_url: String,
    engines: String,
}

impl SearxngSearcher {
    pub fn new(backends: Backends, base_url: &str, engines: &str) -> Self {
        Self {
            backends,
            base_url: base_url.trim_end_matches('/').to_string(),
            engines: engines.to_string(),
        }
    }

    fn params(&self, query: &str) -> Vec<(&'static str, String)> {
        vec![
            ("q", query.to_string()),
            ("format", "json".into()),
            ("engines", self.engines.clone()),
            ("categories", "general".into()),
            ("language", "en".into()),
            ("safesearch", "0".into()),
            ("pageno", "1".into()),
        ]
    }
}

#[async_trait]
impl WebSearcher for SearxngSearcher {
    fn name(&self) -> &str {
        "searxng"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ProviderError> {
        let search_url = format!("{}/search", self.base_url);
        debug!("Search URL: {}", search_url);
        let params = self.params(query);
        cached_search(&self.backends, self.name(), query, || async {
            let response: SearxngResponse = retry_transient(RETRY_WINDOW, || {
                get_json(
                    "searxng",
                    self.backends
                        .http_client
                        .get(&search_url)
                        .query(&params)
                        .header("User-Agent", "deep-research/0.1")
                        .header("Accept", "application/json"),
                )
            })
            .await?;
            Ok(response
                .results
                .into_iter()
                .map(|r| SearchHit {
                    url: r.url,
                    title: r.title,
                    snippet: r.content,
                })
                .collect())
        })
        .await
    }
}

/// Google results through SerpAPI.
pub struct SerpApiSearcher {
    backends: Backends,
    api_key: String,
    num_results: u32,
}

impl SerpApiSearcher {
    pub fn new(backends: Backends, api_key: String, num_results: u32) -> Self {
        Self {
            backends,
            api_key,
            num_results,
        }
    }
}

#[async_trait]
impl WebSearcher for SerpApiSearcher {
    fn name(&self) -> &str {
        "serpapi"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ProviderError> {
        cached_search(&self.backends, self.name(), query, || async {
            let num = self.num_results.to_string();
            let response: SerpApiResponse = retry_transient(RETRY_WINDOW, || {
                get_json(
                    "serpapi",
                    self.backends.http_client.get(SERPAPI_URL).query(&[
                        ("api_key", self.api_key.as_str()),
                        ("q", query),
                        ("num", num.as_str()),
                    ]),
                )
            })
            .await?;
            Ok(response
                .organic_results
                .into_iter()
                .filter_map(|r| {
                    r.link.map(|url| SearchHit {
                        url,
                        title: r.title,
                        snippet: r.snippet,
                    })
                })
                .collect())
        })
        .await
    }
}

/// Bing Web Search v7.
pub struct BingSearcher {
    backends: Backends,
    api_key: String,
    count: u32,
}

impl BingSearcher {
    pub fn new(backends: Backends, api_key: String, count: u32) -> Self {
        Self {
            backends,
            api_key,
            count,
        }
    }
}

#[async_trait]
impl WebSearcher for BingSearcher {
    fn name(&self) -> &str {
        "bing"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ProviderError> {
        cached_search(&self.backends, self.name(), query, || async {
            let count = self.count.to_string();
            let response: BingResponse = retry_transient(RETRY_WINDOW, || {
                get_json(
                    "bing",
                    self.backends
                        .http_client
                        .get(BING_URL)
                        .header("Ocp-Apim-Subscription-Key", &self.api_key)
                        .query(&[
                            ("q", query),
                            ("count", count.as_str()),
                            ("responseFilter", "Webpages"),
                        ]),
                )
            })
            .await?;
            Ok(response
                .web_pages
                .map(|pages| pages.value)
                .unwrap_or_default()
                .into_iter()
                .map(|page| SearchHit {
                    url: page.url,
                    title: page.name,
                    snippet: page.snippet,
                })
                .collect())
        })
        .await
    }
}

/// Keyless search by scraping DuckDuckGo's HTML endpoint.
pub struct DuckDuckGoSearcher {
    backends: Backends,
    limit: usize,
}

impl DuckDuckGoSearcher {
    pub fn new(backends: Backends, limit: u32) -> Self {
        Self {
            backends,
            limit: limit as usize,
        }
    }
}

#[async_trait]
impl WebSearcher for DuckDuckGoSearcher {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ProviderError> {
        cached_search(&self.backends, self.name(), query, || async {
            let html = retry_transient(RETRY_WINDOW, || async {
                let resp = self
                    .backends
                    .http_client
                    .post(DUCKDUCKGO_URL)
                    .header("User-Agent", BROWSER_USER_AGENT)
                    .form(&[("q", query), ("s", "0"), ("dc", "0"), ("kl", "us-en"), ("kp", "1")])
                    .send()
                    .await
                    .map_err(|e| ProviderError::request("duckduckgo", e))?;
                let status = resp.status();
                let text = resp
                    .text()
                    .await
                    .map_err(|e| ProviderError::request("duckduckgo", e))?;
                if !status.is_success() {
                    return Err(ProviderError::from_status("duckduckgo", status, &text));
                }
                Ok(text)
            })
            .await?;
            Ok(parse_duckduckgo_html(&html, self.limit))
        })
        .await
    }
}

/// Pull organic results out of a DuckDuckGo HTML results page.
pub fn parse_duckduckgo_html(html: &str, limit: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(html);
    let (Ok(result_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse("div.result"),
        Selector::parse("a.result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    let mut hits = Vec::new();
    for result in document.select(&result_sel) {
        if result.value().classes().any(|c| c == "result--ad") {
            continue;
        }
        let Some(link) = result.select(&link_sel).next() else {
            continue;
        };
        let Some(url) = link.value().attr("href").and_then(resolve_duckduckgo_href) else {
            continue;
        };
        let title = link.text().collect::<String>().trim().to_string();
        let snippet = result
            .select(&snippet_sel)
            .next()
            .map(|s| s.text().collect::<String>().trim().to_string())
            .unwrap_or_default();
        hits.push(SearchHit {
            url,
            title,
            snippet,
        });
        if hits.len() >= limit {
            break;
        }
    }
    hits
}

/// DuckDuckGo wraps targets in `//duckduckgo.com/l/?uddg=<target>` redirects.
fn resolve_duckduckgo_href(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else if href.starts_with('/') {
        return None;
    } else if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("https://{}", href)
    };
    let parsed = Url::parse(&absolute).ok()?;
    if parsed.host_str().map_or(false, |h| h.ends_with("duckduckgo.com")) {
        return parsed
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned());
    }
    Some(absolute)
}
