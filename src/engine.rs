//! The iteration controller.
//!
//! ```text
//! Initializing -> Running(k) -> Deciding -> Running(k+1) | Synthesizing -> Complete
//!                      \                                        \
//!                       +-> Failed (round 1 generation)          +-> Failed (synthesis)
//! ```
//!
//! Rounds never overlap. Within a round, searches and page pipelines fan out,
//! but every outcome is folded into the session by this task alone.

use crate::config::EngineSettings;
use crate::dispatch::SearchDispatcher;
use crate::error::ResearchError;
use crate::events::{EventSink, StreamEvent};
use crate::pages::PageProcessor;
use crate::providers::Providers;
use crate::queries::QueryGenerator;
use crate::session::ResearchSession;
use crate::synthesis::ReportSynthesizer;
use crate::types::{ResearchReport, ResearchRequest};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct ResearchEngine {
    providers: Providers,
    settings: EngineSettings,
}

impl ResearchEngine {
    pub fn new(providers: Providers, settings: EngineSettings) -> Self {
        Self {
            providers,
            settings,
        }
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one session to its terminal event.
    ///
    /// Every return path records exactly one terminal event on `events`:
    /// `complete` on success, `error` otherwise (with `cancelled` set when
    /// `cancel` fired). Cancelling drops all in-flight searches and page
    /// pipelines at their next suspension point.
    pub async fn run(
        &self,
        request: &ResearchRequest,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ResearchReport, ResearchError> {
        if let Err(message) = request.validate() {
            events.emit(StreamEvent::error(format!("Invalid request: {}", message)));
            return Err(ResearchError::InvalidRequest(message));
        }

        let mut session = ResearchSession::new(request);
        info!(session = %session.id, max_iterations = session.max_iterations, "Starting research for: {}", session.query);
        events.emit(StreamEvent::Start {
            message: format!("Starting research for: {}", session.query),
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResearchError::Cancelled),
            result = self.drive(&mut session, events) => result,
        };

        match outcome {
            Ok(body) => {
                session.mark_complete();
                info!(session = %session.id, status = ?session.status(), iterations = session.iteration(), sources = session.fragments().len(), "Research complete");
                events.emit(StreamEvent::Complete {
                    message: "Research complete".to_string(),
                    report: body.clone(),
                    logs: events.log_lines(),
                });
                Ok(ResearchReport {
                    id: session.id.clone(),
                    query: session.query.clone(),
                    body,
                    iterations: session.iteration(),
                    fragments: session.into_fragments(),
                    events: events.snapshot(),
                })
            }
            Err(ResearchError::Cancelled) => {
                session.mark_failed();
                warn!(session = %session.id, status = ?session.status(), iteration = session.iteration(), "Research cancelled");
                events.emit(StreamEvent::cancelled("Research cancelled"));
                Err(ResearchError::Cancelled)
            }
            Err(e) => {
                session.mark_failed();
                error!(session = %session.id, status = ?session.status(), iteration = session.iteration(), "Research failed: {}", e);
                events.emit(StreamEvent::error(format!("Research failed: {}", e)));
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut ResearchSession,
        events: &EventSink,
    ) -> Result<String, ResearchError> {
        let generator = self.providers.generator.as_ref();
        let dispatcher =
            SearchDispatcher::new(self.providers.searcher.as_ref(), self.settings.call_timeout);
        let processor = PageProcessor::new(
            generator,
            self.providers.extractor.as_ref(),
            &self.settings,
        );
        let synthesizer = ReportSynthesizer::new(generator, self.settings.call_timeout);

        loop {
            let k = session.begin_iteration();
            events.emit(StreamEvent::Iteration {
                message: format!("=== Iteration {} ===", k),
                iteration: k,
            });

            let queries = self.plan(session, events).await?;
            session.record_queries(&queries);
            events.emit(StreamEvent::Queries {
                message: format!("Search queries: {}", queries.join(", ")),
                queries: queries.clone(),
            });

            let links = dispatcher.dispatch(&queries, session, events).await;
            for link in &links {
                session.mark_seen(&link.url);
            }
            let added = processor.process_round(links, session, events).await;
            info!(session = %session.id, iteration = k, added, seen = session.seen_count(), "round finished");
            events.emit(StreamEvent::progress(if added > 0 {
                format!("Added {} new contexts.", added)
            } else {
                "No useful contexts found in this iteration.".to_string()
            }));

            if let Some(reason) = self.stop_reason(session, added, &synthesizer, events).await {
                info!(session = %session.id, iteration = k, "{}", reason);
                events.emit(StreamEvent::progress(reason));
                break;
            }
        }

        events.emit(StreamEvent::progress(format!(
            "Generating final report from {} sources...",
            session.fragments().len()
        )));
        synthesizer
            .synthesize(&session.query, session.fragments())
            .await
            .map_err(ResearchError::Synthesis)
    }

    /// Queries for the current round. Only a failed first round is fatal;
    /// later rounds fall back to the original question.
    async fn plan(
        &self,
        session: &ResearchSession,
        events: &EventSink,
    ) -> Result<Vec<String>, ResearchError> {
        let generator = QueryGenerator::new(self.providers.generator.as_ref(), &self.settings);
        match generator.generate(session).await {
            Ok(batch) => {
                if let Some(e) = batch.parse_error {
                    events.emit(StreamEvent::warning(format!(
                        "{}; continuing with {} query(s)",
                        e,
                        batch.queries.len()
                    )));
                }
                Ok(batch.queries)
            }
            Err(e) if session.iteration() <= 1 => Err(ResearchError::QueryGeneration(e)),
            Err(e) => {
                events.emit(StreamEvent::warning(format!(
                    "Query generation failed: {}; falling back to the original query",
                    e
                )));
                Ok(vec![session.query.clone()])
            }
        }
    }

    /// Deciding. The hard cap wins, then diminishing returns, then the
    /// optional model judgement.
    async fn stop_reason(
        &self,
        session: &ResearchSession,
        added: usize,
        synthesizer: &ReportSynthesizer<'_>,
        events: &EventSink,
    ) -> Option<String> {
        if !session.has_rounds_left() {
            return Some(format!(
                "Reached maximum iterations ({}).",
                session.max_iterations
            ));
        }
        if added == 0 {
            return Some("No new useful information found; stopping early.".to_string());
        }
        if !self.settings.judge_sufficiency {
            return None;
        }
        match synthesizer
            .is_sufficient(&session.query, &session.prior_query_texts(), session.fragments())
            .await
        {
            Ok(true) => Some("Enough information gathered.".to_string()),
            Ok(false) => None,
            Err(e) => {
                events.emit(StreamEvent::warning(format!(
                    "Sufficiency check failed: {}",
                    e
                )));
                None
            }
        }
    }
}
