pub mod api;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod llm;
pub mod pages;
pub mod providers;
pub mod queries;
pub mod rust_scraper;
pub mod scrape;
pub mod search;
pub mod session;
pub mod stdio_service;
pub mod store;
pub mod synthesis;
pub mod types;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use config::{EngineSettings, Settings};
pub use engine::ResearchEngine;
pub use error::{ConfigError, GenerationParseError, ProviderError, ResearchError, StoreError};
pub use events::{EventSink, ReplayOutcome, SessionReplay, StreamEvent};
pub use providers::{Backends, ContentExtractor, Providers, TextGenerator, WebSearcher};
pub use store::ReportStore;
pub use types::*;

/// Process-wide state shared by the HTTP and stdio adapters.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub backends: Backends,
    pub store: ReportStore,
    // Fixed providers instead of resolving them from settings per session
    providers_override: Option<Providers>,
}

impl AppState {
    pub fn new(settings: Settings, http_client: reqwest::Client) -> Self {
        let store = ReportStore::new(&settings.output_dir);
        Self {
            settings: Arc::new(settings),
            backends: Backends::new(http_client),
            store,
            providers_override: None,
        }
    }

    pub fn with_providers(mut self, providers: Providers) -> Self {
        self.providers_override = Some(providers);
        self
    }

    /// Providers for a new session, resolved from the current settings.
    pub fn providers(&self) -> Result<Providers, ConfigError> {
        match &self.providers_override {
            Some(providers) => Ok(providers.clone()),
            None => Providers::from_settings(&self.settings, &self.backends),
        }
    }

    pub fn engine(&self) -> Result<ResearchEngine, ConfigError> {
        Ok(ResearchEngine::new(
            self.providers()?,
            self.settings.engine.clone(),
        ))
    }

    /// Run a session and persist its report. A failed save is only logged.
    pub async fn run_session(
        &self,
        engine: &ResearchEngine,
        request: &ResearchRequest,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ResearchReport, ResearchError> {
        let report = engine.run(request, events, cancel).await?;
        if let Err(e) = self.store.save(&report).await {
            warn!("Failed to save research output: {}", e);
        }
        Ok(report)
    }
}
