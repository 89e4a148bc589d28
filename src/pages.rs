//! Page processing: extract, judge, and distil every newly discovered URL.
//!
//! Each URL runs its own three-step pipeline. Pipelines share nothing but
//! the event sink; the controller applies their outcomes to the session one
//! at a time as they finish, so the session itself needs no lock.

use crate::config::EngineSettings;
use crate::error::GenerationParseError;
use crate::events::{EventSink, StreamEvent};
use crate::providers::{with_timeout, CompletionOptions, ContentExtractor, TextGenerator};
use crate::session::ResearchSession;
use crate::types::{ContextFragment, Link, RelevanceVerdict};
use futures::{stream, FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use tracing::{debug, info, warn};

/// Page text offered to the relevance judge.
const JUDGE_PAGE_CHARS: usize = 2000;
/// Length of the preview carried by a `context` event.
const PREVIEW_CHARS: usize = 200;

const JUDGE_SYSTEM: &str = "You are a content relevance evaluator. Be direct.";
const EXTRACT_SYSTEM: &str = "You are an expert information extractor.";

/// What one URL's pipeline produced.
#[derive(Debug)]
pub enum PageOutcome {
    /// No text, or the extractor failed. Already reported as a warning.
    Skipped,
    Judged {
        verdict: RelevanceVerdict,
        fragment: Option<ContextFragment>,
    },
}

/// Cut `text` to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Strict yes/no reading of a relevance answer.
///
/// Only a leading "yes" with no competing "no" on the same line counts as
/// useful. Anything that is neither a clear yes nor a clear no is an error,
/// which callers treat as not useful.
pub fn parse_verdict(raw: &str) -> Result<bool, GenerationParseError> {
    let unreadable = || GenerationParseError {
        what: "relevance verdict",
        partial: Vec::new(),
    };
    let first_line = raw
        .lines()
        .map(|line| {
            line.trim()
                .trim_matches(|c: char| matches!(c, '*' | '`' | '"' | '\'' | '#' | '_'))
                .trim()
        })
        .find(|line| !line.is_empty())
        .ok_or_else(unreadable)?
        .to_lowercase();

    let words: Vec<&str> = first_line
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let words = match words.as_slice() {
        ["answer", rest @ ..] | ["verdict", rest @ ..] => rest,
        all => all,
    };

    match words.first() {
        Some(&"yes") if words.iter().skip(1).any(|w| *w == "no") => Err(unreadable()),
        Some(&"yes") => Ok(true),
        Some(&"no") => Ok(false),
        _ => Err(unreadable()),
    }
}

pub fn judge_prompt(query: &str, page_text: &str) -> String {
    format!(
        "Topic: {}\n\nContent:\n{}\n\nIs this content relevant to the topic? Answer with exactly 'Yes' or 'No'.",
        query,
        truncate_chars(page_text, JUDGE_PAGE_CHARS)
    )
}

pub fn extract_prompt(query: &str, source_query: &str, page_text: &str, max_chars: usize) -> String {
    format!(
        "Query: {}\nSearch Query: {}\n\nContent:\n{}\n\n\
         Extract all information relevant to answering the user's query. \
         Return only the relevant context as plain text without commentary.",
        query,
        source_query,
        truncate_chars(page_text, max_chars)
    )
}

pub struct PageProcessor<'a> {
    generator: &'a dyn TextGenerator,
    extractor: &'a dyn ContentExtractor,
    settings: &'a EngineSettings,
}

impl<'a> PageProcessor<'a> {
    pub fn new(
        generator: &'a dyn TextGenerator,
        extractor: &'a dyn ContentExtractor,
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            generator,
            extractor,
            settings,
        }
    }

    /// Process a round's links with bounded fan-out and fold each outcome
    /// into the session. Returns how many fragments were added.
    ///
    /// Links must already be marked seen.
    pub async fn process_round(
        &self,
        links: Vec<Link>,
        session: &mut ResearchSession,
        events: &EventSink,
    ) -> usize {
        let query = session.query.clone();
        let iteration = session.iteration();
        let query = query.as_str();

        let mut outcomes = stream::iter(links)
            .map(|link| {
                let url = link.url.clone();
                AssertUnwindSafe(self.process_one(link, query, iteration, events))
                    .catch_unwind()
                    .map(move |result| (url, result))
            })
            .buffer_unordered(self.settings.page_concurrency.max(1));

        let mut added = 0;
        while let Some((url, result)) = outcomes.next().await {
            match result {
                Ok(PageOutcome::Judged { verdict, fragment }) => {
                    session.record_verdict(&verdict);
                    let Some(fragment) = fragment else { continue };
                    let preview = truncate_chars(&fragment.snippet, PREVIEW_CHARS).to_string();
                    if session.add_fragment(fragment) {
                        added += 1;
                        events.emit(StreamEvent::Context {
                            message: preview,
                            url,
                        });
                    }
                }
                Ok(PageOutcome::Skipped) => {}
                Err(_) => {
                    warn!(url = %url, "page pipeline panicked");
                    events.emit(StreamEvent::warning(format!(
                        "Processing failed unexpectedly for {}",
                        url
                    )));
                }
            }
        }
        added
    }

    /// Extract, judge and (when useful) distil one page.
    pub async fn process_one(
        &self,
        link: Link,
        query: &str,
        iteration: u32,
        events: &EventSink,
    ) -> PageOutcome {
        let Link { url, source_query } = link;
        events.emit(StreamEvent::Processing {
            message: format!("Processing link: {}", url),
            url: url.clone(),
        });

        let page = with_timeout(
            self.extractor.name(),
            self.settings.call_timeout,
            self.extractor.extract(&url),
        )
        .await;
        let text = match page {
            Ok(page) => match page.text.filter(|t| !t.trim().is_empty()) {
                Some(text) => {
                    debug!(url = %url, language = ?page.language, chars = text.len(), "page extracted");
                    text
                }
                None => {
                    events.emit(StreamEvent::warning(format!(
                        "No content extracted from {}",
                        url
                    )));
                    return PageOutcome::Skipped;
                }
            },
            Err(e) => {
                warn!(url = %url, "extraction failed: {}", e);
                events.emit(StreamEvent::warning(format!(
                    "Failed to extract {}: {}",
                    url, e
                )));
                return PageOutcome::Skipped;
            }
        };

        let verdict = self.judge(&url, query, &text, events).await;
        events.emit(StreamEvent::Evaluation {
            message: format!(
                "Page usefulness for {}: {}",
                url,
                if verdict.useful { "Yes" } else { "No" }
            ),
            url: url.clone(),
            useful: verdict.useful,
        });
        if !verdict.useful {
            return PageOutcome::Judged {
                verdict,
                fragment: None,
            };
        }

        let fragment = self
            .distil(&url, query, &source_query, &text, events)
            .await
            .map(|snippet| ContextFragment {
                url: url.clone(),
                snippet,
                iteration,
            });
        PageOutcome::Judged { verdict, fragment }
    }

    async fn judge(&self, url: &str, query: &str, text: &str, events: &EventSink) -> RelevanceVerdict {
        let answer = with_timeout(
            self.generator.name(),
            self.settings.call_timeout,
            self.generator.complete(
                &judge_prompt(query, text),
                &CompletionOptions::with_system(JUDGE_SYSTEM),
            ),
        )
        .await;

        let (useful, rationale) = match answer {
            Ok(answer) => match parse_verdict(&answer) {
                Ok(useful) => (useful, answer.trim().to_string()),
                Err(e) => {
                    info!(url = %url, "{}, treating page as not useful: {:?}", e, answer);
                    (false, answer.trim().to_string())
                }
            },
            Err(e) => {
                events.emit(StreamEvent::warning(format!(
                    "Relevance check failed for {}: {}",
                    url, e
                )));
                (false, e.to_string())
            }
        };
        RelevanceVerdict {
            url: url.to_string(),
            useful,
            rationale,
        }
    }

    async fn distil(
        &self,
        url: &str,
        query: &str,
        source_query: &str,
        text: &str,
        events: &EventSink,
    ) -> Option<String> {
        let answer = with_timeout(
            self.generator.name(),
            self.settings.call_timeout,
            self.generator.complete(
                &extract_prompt(query, source_query, text, self.settings.max_page_chars),
                &CompletionOptions::with_system(EXTRACT_SYSTEM),
            ),
        )
        .await;
        match answer {
            Ok(snippet) if !snippet.trim().is_empty() => Some(snippet.trim().to_string()),
            Ok(_) => {
                events.emit(StreamEvent::warning(format!(
                    "No relevant context extracted from {}",
                    url
                )));
                None
            }
            Err(e) => {
                events.emit(StreamEvent::warning(format!(
                    "Context extraction failed for {}: {}",
                    url, e
                )));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_answers() {
        assert!(parse_verdict("Yes").unwrap());
        assert!(parse_verdict("yes.").unwrap());
        assert!(parse_verdict("**Yes**, it covers the topic directly.").unwrap());
        assert!(parse_verdict("Answer: Yes").unwrap());
        assert!(!parse_verdict("No").unwrap());
        assert!(!parse_verdict("\n  no - unrelated product page").unwrap());
    }

    #[test]
    fn ambiguous_answers_fail_closed() {
        assert!(parse_verdict("Yes and no").is_err());
        assert!(parse_verdict("Maybe").is_err());
        assert!(parse_verdict("The content is relevant, yes").is_err());
        assert!(parse_verdict("Nope").is_err());
        assert!(parse_verdict("").is_err());
        assert!(parse_verdict("yesterday's news").is_err());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 50), "short");
    }

    #[test]
    fn prompts_carry_both_queries_and_bounded_text() {
        let text = "~".repeat(5000);
        let judge = judge_prompt("benefits of meditation", &text);
        assert!(judge.contains("Topic: benefits of meditation"));
        assert!(judge.matches('~').count() <= JUDGE_PAGE_CHARS);

        let extract = extract_prompt("benefits of meditation", "meditation sleep", &text, 100);
        assert!(extract.contains("Search Query: meditation sleep"));
        assert!(extract.matches('~').count() <= 100);
    }
}
