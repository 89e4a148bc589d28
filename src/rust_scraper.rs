use crate::error::ProviderError;
use anyhow::{anyhow, Result};
use rand::Rng;
use readability::extractor;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use select::document::Document;
use select::predicate::Name;
use std::sync::OnceLock;
use tracing::{debug, info};
use url::Url;
use whatlang::{detect, Lang};

/// User agents for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:89.0) Gecko/20100101 Firefox/89.0",
];

/// Raw response for one page, before any text extraction.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: Url,
    pub status_code: u16,
    pub content_type: String,
    pub body: String,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_html(&self) -> bool {
        let ct = self.content_type.to_ascii_lowercase();
        ct.contains("text/html") || ct.contains("application/xhtml")
    }

    pub fn is_plain_text(&self) -> bool {
        let ct = self.content_type.to_ascii_lowercase();
        ct.contains("text/plain") || ct.contains("text/markdown")
    }
}

/// Browser-like page fetcher
pub struct RustScraper {
    client: Client,
}

impl RustScraper {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a random User-Agent string
    fn get_random_user_agent(&self) -> &'static str {
        let mut rng = rand::thread_rng();
        let index = rng.gen_range(0..USER_AGENTS.len());
        USER_AGENTS[index]
    }

    pub async fn fetch(&self, url: &Url) -> Result<FetchedPage, ProviderError> {
        info!("Fetching page: {}", url);
        let user_agent = self.get_random_user_agent();
        let response = self
            .client
            .get(url.as_str())
            .header("User-Agent", user_agent)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.5")
            .header("DNT", "1")
            .header("Upgrade-Insecure-Requests", "1")
            .send()
            .await
            .map_err(|e| ProviderError::request("native", e))?;

        let status_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();
        let final_url = response.url().clone();

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::request("native", e))?;

        Ok(FetchedPage {
            url: final_url,
            status_code,
            content_type,
            body,
        })
    }
}

/// Text extraction strategies, tried in order until one yields text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// Article body via the readability algorithm, rendered with html2text.
    Readability,
    /// The whole `<body>` rendered with html2text.
    HtmlToText,
    /// Every visible text node, scripts and styles skipped.
    VisibleText,
}

impl ExtractionStrategy {
    pub const CHAIN: [ExtractionStrategy; 3] = [
        ExtractionStrategy::Readability,
        ExtractionStrategy::HtmlToText,
        ExtractionStrategy::VisibleText,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExtractionStrategy::Readability => "readability",
            ExtractionStrategy::HtmlToText => "html2text",
            ExtractionStrategy::VisibleText => "visible-text",
        }
    }

    pub fn apply(&self, html: &str, base_url: &Url) -> Result<String> {
        match self {
            ExtractionStrategy::Readability => {
                let product = extractor::extract(&mut html.as_bytes(), base_url)
                    .map_err(|e| anyhow!("readability failed: {}", e))?;
                Ok(html2text::from_read(product.content.as_bytes(), 80))
            }
            ExtractionStrategy::HtmlToText => {
                let document = Document::from(html);
                let body = document
                    .find(Name("body"))
                    .next()
                    .map(|n| n.html())
                    .ok_or_else(|| anyhow!("document has no <body>"))?;
                Ok(html2text::from_read(body.as_bytes(), 80))
            }
            ExtractionStrategy::VisibleText => {
                let document = Html::parse_document(html);
                let body_selector =
                    Selector::parse("body").map_err(|e| anyhow!("bad selector: {:?}", e))?;
                let mut text_parts = Vec::new();
                if let Some(body) = document.select(&body_selector).next() {
                    extract_text_recursive(&body, &mut text_parts);
                }
                Ok(text_parts.join(" "))
            }
        }
    }
}

/// Run `chain` over `html`: a strategy that errors or yields only whitespace
/// hands over to the next one. `None` once every strategy is exhausted.
pub fn extract_with_chain(
    html: &str,
    base_url: &Url,
    chain: &[ExtractionStrategy],
) -> Option<(ExtractionStrategy, String)> {
    for strategy in chain {
        match strategy.apply(html, base_url) {
            Ok(raw) => {
                let text = clean_text(&raw);
                if count_words(&text) > 0 {
                    debug!("{} extracted {} words", strategy.name(), count_words(&text));
                    return Some((*strategy, text));
                }
                debug!("{} produced no text, trying next strategy", strategy.name());
            }
            Err(e) => debug!("{} failed: {}, trying next strategy", strategy.name(), e),
        }
    }
    None
}

/// Recursively extract text from elements
fn extract_text_recursive(element: &ElementRef, text_parts: &mut Vec<String>) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            let tag_name = child_element.value().name();
            // Skip script and style elements
            if tag_name == "script" || tag_name == "style" || tag_name == "noscript" {
                continue;
            }
            extract_text_recursive(&child_element, text_parts);
        } else if let Some(text_node) = child.value().as_text() {
            text_parts.push(text_node.text.to_string());
        }
    }
}

fn whitespace_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t\r\f\v]+").expect("valid regex"))
}

fn blank_line_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n(?:[ \t]*\n)+").expect("valid regex"))
}

/// Collapse horizontal whitespace and blank-line runs, keeping paragraph breaks.
pub fn clean_text(text: &str) -> String {
    let collapsed = whitespace_runs().replace_all(text, " ");
    let lines: Vec<&str> = collapsed.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    blank_line_runs()
        .replace_all(&joined, "\n\n")
        .trim()
        .to_string()
}

/// Count words in text
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Content-based language guess, ISO 639-1 where common.
pub fn detect_language(text: &str) -> Option<String> {
    let info = detect(text)?;
    let code = match info.lang() {
        Lang::Eng => "en".to_string(),
        Lang::Spa => "es".to_string(),
        Lang::Fra => "fr".to_string(),
        Lang::Deu => "de".to_string(),
        Lang::Ita => "it".to_string(),
        Lang::Por => "pt".to_string(),
        Lang::Rus => "ru".to_string(),
        Lang::Jpn => "ja".to_string(),
        Lang::Kor => "ko".to_string(),
        Lang::Cmn => "zh".to_string(),
        other => format!("{:?}", other).to_lowercase(),
    };
    Some(code)
}
