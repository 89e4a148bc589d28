//! Final report synthesis, plus the optional "enough information" judge.

use crate::error::ProviderError;
use crate::providers::{with_timeout, CompletionOptions, TextGenerator};
use crate::types::ContextFragment;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

const REPORT_SYSTEM: &str = "You are an expert report writer.";
const PLANNER_SYSTEM: &str = "You are a research planner. Be concise and direct.";
const DONE_MARKER: &str = "<done>";

fn excess_blank_lines() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("valid regex"))
}

/// Whitespace-only cleanup of model output: line endings, outer blank space,
/// and runs of more than one blank line.
pub fn normalize_report(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    excess_blank_lines()
        .replace_all(unified.trim(), "\n\n")
        .into_owned()
}

/// Numbered source list, one block per fragment.
pub fn format_sources(fragments: &[ContextFragment]) -> String {
    fragments
        .iter()
        .enumerate()
        .map(|(i, f)| format!("[{}] {}\n{}", i + 1, f.url, f.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn report_prompt(query: &str, fragments: &[ContextFragment]) -> String {
    if fragments.is_empty() {
        return format!(
            "Query: {}\n\nNo relevant sources were found during research.\n\n\
             Write a short report stating that no sufficient information was found to answer \
             the query, and suggest how the question could be refined.",
            query
        );
    }
    format!(
        "Query: {}\n\nContexts:\n{}\n\n\
         Write a complete, well-structured, and detailed report that addresses the query \
         thoroughly. Include all useful insights without commentary, and cite sources by \
         their [number].",
        query,
        format_sources(fragments)
    )
}

pub struct ReportSynthesizer<'a> {
    generator: &'a dyn TextGenerator,
    call_timeout: Duration,
}

impl<'a> ReportSynthesizer<'a> {
    pub fn new(generator: &'a dyn TextGenerator, call_timeout: Duration) -> Self {
        Self {
            generator,
            call_timeout,
        }
    }

    pub async fn synthesize(
        &self,
        query: &str,
        fragments: &[ContextFragment],
    ) -> Result<String, ProviderError> {
        info!(sources = fragments.len(), "Generating final report");
        let raw = with_timeout(
            self.generator.name(),
            self.call_timeout,
            self.generator.complete(
                &report_prompt(query, fragments),
                &CompletionOptions::with_system(REPORT_SYSTEM),
            ),
        )
        .await?;
        let report = normalize_report(&raw);
        if report.is_empty() {
            return Err(ProviderError::invalid(
                self.generator.name(),
                "empty report",
            ));
        }
        Ok(report)
    }

    /// Ask whether the gathered material already answers the query.
    /// `Ok(true)` means stop researching.
    pub async fn is_sufficient(
        &self,
        query: &str,
        prior_queries: &[String],
        fragments: &[ContextFragment],
    ) -> Result<bool, ProviderError> {
        let prompt = format!(
            "Topic: {}\nPrevious Searches: {:?}\n\nCurrent Information:\n{}\n\n\
             If the information above is enough to write a thorough report, reply with exactly \
             '{}'. Otherwise reply 'continue'.",
            query,
            prior_queries,
            format_sources(fragments),
            DONE_MARKER
        );
        let answer = with_timeout(
            self.generator.name(),
            self.call_timeout,
            self.generator
                .complete(&prompt, &CompletionOptions::with_system(PLANNER_SYSTEM)),
        )
        .await?;
        Ok(answer.to_lowercase().contains(DONE_MARKER))
    }
}
