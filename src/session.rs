//! Per-session research state, owned by the iteration controller.

use crate::types::{ContextFragment, RelevanceVerdict, ResearchRequest, SearchQuery};
use serde::Serialize;
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Complete,
    Failed,
}

/// Everything one research run has accumulated so far.
///
/// Invariants kept here rather than by callers:
/// - the iteration index only grows and never passes `max_iterations`;
/// - a URL enters the seen set once and is never removed;
/// - a fragment is only accepted for a seen URL with a useful verdict.
#[derive(Debug)]
pub struct ResearchSession {
    pub id: String,
    pub query: String,
    pub max_iterations: u32,
    iteration: u32,
    queries: Vec<SearchQuery>,
    seen_urls: HashSet<String>,
    useful_urls: HashSet<String>,
    fragments: Vec<ContextFragment>,
    status: SessionStatus,
}

impl ResearchSession {
    pub fn new(request: &ResearchRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: request.query.trim().to_string(),
            max_iterations: request.max_iterations,
            iteration: 0,
            queries: Vec::new(),
            seen_urls: HashSet::new(),
            useful_urls: HashSet::new(),
            fragments: Vec::new(),
            status: SessionStatus::Running,
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn has_rounds_left(&self) -> bool {
        self.iteration < self.max_iterations
    }

    /// Advance to the next round and return its 1-based index.
    pub fn begin_iteration(&mut self) -> u32 {
        debug_assert!(self.has_rounds_left(), "iteration cap exceeded");
        self.iteration = (self.iteration + 1).min(self.max_iterations);
        self.iteration
    }

    pub fn record_queries(&mut self, texts: &[String]) {
        let iteration = self.iteration;
        self.queries.extend(texts.iter().map(|text| SearchQuery {
            text: text.clone(),
            iteration,
        }));
    }

    pub fn queries(&self) -> &[SearchQuery] {
        &self.queries
    }

    pub fn prior_query_texts(&self) -> Vec<String> {
        self.queries.iter().map(|q| q.text.clone()).collect()
    }

    pub fn has_seen(&self, url: &str) -> bool {
        self.seen_urls.contains(url)
    }

    /// Returns `false` when the URL was already seen.
    pub fn mark_seen(&mut self, url: &str) -> bool {
        self.seen_urls.insert(url.to_string())
    }

    pub fn seen_count(&self) -> usize {
        self.seen_urls.len()
    }

    pub fn record_verdict(&mut self, verdict: &RelevanceVerdict) {
        if verdict.useful && self.seen_urls.contains(&verdict.url) {
            self.useful_urls.insert(verdict.url.clone());
        }
    }

    /// Append a fragment; refused unless its URL was seen and judged useful.
    pub fn add_fragment(&mut self, fragment: ContextFragment) -> bool {
        if !self.useful_urls.contains(&fragment.url) {
            warn!(url = %fragment.url, "refusing context fragment without a useful verdict");
            return false;
        }
        self.fragments.push(fragment);
        true
    }

    pub fn fragments(&self) -> &[ContextFragment] {
        &self.fragments
    }

    pub fn into_fragments(self) -> Vec<ContextFragment> {
        self.fragments
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn mark_complete(&mut self) {
        self.status = SessionStatus::Complete;
    }

    pub fn mark_failed(&mut self) {
        self.status = SessionStatus::Failed;
    }
}
