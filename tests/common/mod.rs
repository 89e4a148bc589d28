//! Scripted in-memory providers for driving the engine without a network.
#![allow(dead_code)]

use async_trait::async_trait;
use deep_research::providers::CompletionOptions;
use deep_research::{
    ContentExtractor, EngineSettings, PageContent, ProviderError, Providers, SearchHit,
    TextGenerator, WebSearcher,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type QueryScript = Box<dyn Fn(u32) -> Result<String, ProviderError> + Send + Sync>;
type SearchScript = Box<dyn Fn(&str) -> Result<Vec<SearchHit>, ProviderError> + Send + Sync>;
type PageScriptFn = Box<dyn Fn(&str) -> PageScript + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Queries,
    Judge,
    Extract,
    Report,
    Sufficiency,
}

pub fn classify(prompt: &str) -> PromptKind {
    if prompt.contains("Generate exactly") {
        PromptKind::Queries
    } else if prompt.contains("Is this content relevant") {
        PromptKind::Judge
    } else if prompt.contains("Extract all information") {
        PromptKind::Extract
    } else if prompt.contains("Previous Searches:") {
        PromptKind::Sufficiency
    } else {
        PromptKind::Report
    }
}

fn section<'a>(prompt: &'a str, start: &str, end: &str) -> &'a str {
    let Some(from) = prompt.find(start).map(|i| i + start.len()) else {
        return "";
    };
    let rest = &prompt[from..];
    rest.find(end).map_or(rest, |to| &rest[..to]).trim()
}

/// Generator that answers by prompt type.
///
/// Pages whose text contains `USEFUL` are judged relevant; snippets echo the
/// page text; the report echoes the numbered sources it was given.
pub struct ScriptedGenerator {
    queries: QueryScript,
    report: Option<ProviderError>,
    sufficiency: String,
    query_calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            queries: Box::new(|round| {
                Ok(format!(
                    "Here are the queries:\n1. topic aspect {round}a\n2. topic aspect {round}b"
                ))
            }),
            report: None,
            sufficiency: "continue".to_string(),
            query_calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_queries(
        mut self,
        script: impl Fn(u32) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.queries = Box::new(script);
        self
    }

    pub fn failing_report(mut self, err: ProviderError) -> Self {
        self.report = Some(err);
        self
    }

    pub fn with_sufficiency(mut self, answer: &str) -> Self {
        self.sufficiency = answer.to_string();
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn prompts_of(&self, kind: PromptKind) -> Vec<String> {
        self.prompts()
            .into_iter()
            .filter(|p| classify(p) == kind)
            .collect()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match classify(prompt) {
            PromptKind::Queries => {
                let round = self.query_calls.fetch_add(1, Ordering::SeqCst) + 1;
                (self.queries)(round)
            }
            PromptKind::Judge => {
                let content = section(prompt, "Content:\n", "\n\nIs this content relevant");
                Ok(if content.contains("USEFUL") { "Yes" } else { "No" }.to_string())
            }
            PromptKind::Extract => {
                let content = section(prompt, "Content:\n", "\n\nExtract all information");
                Ok(format!("Relevant: {}", content))
            }
            PromptKind::Sufficiency => Ok(self.sufficiency.clone()),
            PromptKind::Report => match &self.report {
                Some(err) => Err(err.clone()),
                None if prompt.contains("No relevant sources were found") => {
                    Ok("No sufficient information found for this query.".to_string())
                }
                None => Ok(format!(
                    "# Report\n\n{}\n",
                    section(prompt, "Contexts:\n", "\n\nWrite a complete")
                )),
            },
        }
    }
}

pub fn hit(url: &str) -> SearchHit {
    SearchHit {
        url: url.to_string(),
        title: format!("Title of {}", url),
        snippet: String::new(),
    }
}

pub fn slug(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

pub struct ScriptedSearcher {
    script: SearchScript,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSearcher {
    /// One distinct URL per query.
    pub fn per_query() -> Self {
        Self::new(|query| Ok(vec![hit(&format!("https://site.test/{}", slug(query)))]))
    }

    pub fn new(
        script: impl Fn(&str) -> Result<Vec<SearchHit>, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebSearcher for ScriptedSearcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ProviderError> {
        self.calls.lock().unwrap().push(query.to_string());
        tokio::task::yield_now().await;
        (self.script)(query)
    }
}

#[derive(Debug, Clone)]
pub enum PageScript {
    Text(String),
    Absent,
    Fail,
    Panic,
    /// Never resolves.
    Hang,
    Delay(Duration, String),
}

pub struct ScriptedExtractor {
    script: PageScriptFn,
    calls: Mutex<Vec<String>>,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

/// Decrements the in-flight count however the call ends.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedExtractor {
    /// Every page is useful and mentions its own URL.
    pub fn all_useful() -> Self {
        Self::new(|url| PageScript::Text(format!("USEFUL facts from {}", url)))
    }

    pub fn new(script: impl Fn(&str) -> PageScript + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Most `extract` calls that were ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentExtractor for ScriptedExtractor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn extract(&self, url: &str) -> Result<PageContent, ProviderError> {
        self.calls.lock().unwrap().push(url.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(self.in_flight.clone());
        let script = (self.script)(url);
        tokio::task::yield_now().await;
        match script {
            PageScript::Text(text) => Ok(PageContent {
                url: url.to_string(),
                text: Some(text),
                language: Some("en".to_string()),
            }),
            PageScript::Absent => Ok(PageContent::absent(url)),
            PageScript::Fail => Err(ProviderError::request("scripted", "connection reset")),
            PageScript::Panic => panic!("extractor blew up on {}", url),
            PageScript::Hang => std::future::pending().await,
            PageScript::Delay(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(PageContent {
                    url: url.to_string(),
                    text: Some(text),
                    language: None,
                })
            }
        }
    }
}

pub struct Harness {
    pub generator: Arc<ScriptedGenerator>,
    pub searcher: Arc<ScriptedSearcher>,
    pub extractor: Arc<ScriptedExtractor>,
}

impl Harness {
    pub fn new(
        generator: ScriptedGenerator,
        searcher: ScriptedSearcher,
        extractor: ScriptedExtractor,
    ) -> Self {
        Self {
            generator: Arc::new(generator),
            searcher: Arc::new(searcher),
            extractor: Arc::new(extractor),
        }
    }

    pub fn providers(&self) -> Providers {
        Providers::new(
            self.generator.clone(),
            self.searcher.clone(),
            self.extractor.clone(),
        )
    }
}

pub fn engine_settings() -> EngineSettings {
    EngineSettings {
        call_timeout: Duration::from_secs(5),
        ..EngineSettings::default()
    }
}
