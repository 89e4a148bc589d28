//! Search dispatch: one concurrent search per query, merged into new links.

use crate::events::{EventSink, StreamEvent};
use crate::providers::{with_timeout, WebSearcher};
use crate::session::ResearchSession;
use crate::types::{Link, SearchHit};
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

const TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "msclkid", "mc_cid", "mc_eid", "ref", "ref_src", "igshid", "yclid", "_ga",
];

fn is_tracking_param(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name.as_str())
}

/// Canonical form used for dedup: http(s) only, no fragment, no tracking
/// parameters, no trailing slash on a non-root path.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);

    if url.query().is_some() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !is_tracking_param(k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Some(url.to_string())
}

/// Merge per-query results in query order. The first query to surface a URL
/// owns it; URLs already seen by the session are dropped.
pub fn merge_links(results: Vec<(String, Vec<SearchHit>)>, session: &ResearchSession) -> Vec<Link> {
    let mut batch = HashSet::new();
    let mut links = Vec::new();
    for (query, hits) in results {
        for hit in hits {
            let Some(url) = normalize_url(&hit.url) else {
                continue;
            };
            if session.has_seen(&url) || !batch.insert(url.clone()) {
                continue;
            }
            links.push(Link {
                url,
                source_query: query.clone(),
            });
        }
    }
    links
}

pub struct SearchDispatcher<'a> {
    searcher: &'a dyn WebSearcher,
    call_timeout: Duration,
}

impl<'a> SearchDispatcher<'a> {
    pub fn new(searcher: &'a dyn WebSearcher, call_timeout: Duration) -> Self {
        Self {
            searcher,
            call_timeout,
        }
    }

    /// Run every query at once and wait for all of them. A failed query
    /// contributes no links and a warning; it never fails the round.
    pub async fn dispatch(
        &self,
        queries: &[String],
        session: &ResearchSession,
        events: &EventSink,
    ) -> Vec<Link> {
        let searches = queries.iter().map(|query| async move {
            let outcome = with_timeout(
                self.searcher.name(),
                self.call_timeout,
                self.searcher.search(query),
            )
            .await;
            (query, outcome)
        });

        let mut results = Vec::with_capacity(queries.len());
        for (query, outcome) in join_all(searches).await {
            match outcome {
                Ok(hits) => {
                    info!(query = %query, hits = hits.len(), "search finished");
                    results.push((query.clone(), hits));
                }
                Err(e) => {
                    warn!(query = %query, "search failed: {}", e);
                    events.emit(StreamEvent::warning(format!(
                        "Search failed for query '{}': {}",
                        query, e
                    )));
                }
            }
        }

        let links = merge_links(results, session);
        events.emit(StreamEvent::Links {
            message: format!("Found {} unique links.", links.len()),
            count: links.len(),
        });
        links
    }
}
