//! Search query generation.
//!
//! One generator call per round. The model's free-text answer is treated as
//! untrusted input: numbered lists, bullets, bare lines and Python/JSON style
//! string lists are all accepted, and anything unusable degrades to a smaller
//! batch or to the original question instead of failing the round.

use crate::config::EngineSettings;
use crate::error::{GenerationParseError, ProviderError};
use crate::providers::{with_timeout, CompletionOptions, TextGenerator};
use crate::session::ResearchSession;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, info};

const SYSTEM_PROMPT: &str =
    "You are a research planner who writes precise web search queries. Respond with ONLY the queries, one per line, no other text.";

/// Per-fragment cap when feeding accumulated context back into planning.
const CONTEXT_SNIPPET_CHARS: usize = 1500;

/// A round's query batch plus the parse problem it was salvaged from, if any.
#[derive(Debug, Clone)]
pub struct QueryBatch {
    pub queries: Vec<String>,
    pub parse_error: Option<GenerationParseError>,
}

pub struct QueryGenerator<'a> {
    generator: &'a dyn TextGenerator,
    settings: &'a EngineSettings,
}

impl<'a> QueryGenerator<'a> {
    pub fn new(generator: &'a dyn TextGenerator, settings: &'a EngineSettings) -> Self {
        Self {
            generator,
            settings,
        }
    }

    /// Ask the model for the next batch. Only the model call itself can fail;
    /// unparseable output falls back to whatever parsed, then to the question.
    pub async fn generate(&self, session: &ResearchSession) -> Result<QueryBatch, ProviderError> {
        let prompt = build_prompt(session, self.settings.queries_per_round);
        info!(iteration = session.iteration(), "Generating search queries for: {}", session.query);
        let raw = with_timeout(
            self.generator.name(),
            self.settings.call_timeout,
            self.generator
                .complete(&prompt, &CompletionOptions::with_system(SYSTEM_PROMPT)),
        )
        .await?;
        debug!("query generator output: {}", raw);

        let prior = session.prior_query_texts();
        let batch = match parse_queries(
            &raw,
            &prior,
            self.settings.queries_per_round,
            self.settings.min_parsed_queries,
        ) {
            Ok(queries) => QueryBatch {
                queries,
                parse_error: None,
            },
            Err(err) => {
                let queries = if err.partial.is_empty() {
                    vec![session.query.clone()]
                } else {
                    err.partial.clone()
                };
                QueryBatch {
                    queries,
                    parse_error: Some(err),
                }
            }
        };
        Ok(batch)
    }
}

pub fn build_prompt(session: &ResearchSession, count: usize) -> String {
    let mut prompt = format!(
        "Generate exactly {count} distinct web search queries for researching the topic below.\n\
         Each query should target a different aspect of the topic.\n\
         Write one query per line with no commentary.\n\n\
         Topic: {topic}\n",
        count = count,
        topic = session.query,
    );

    let prior = session.prior_query_texts();
    if !prior.is_empty() {
        prompt.push_str("\nQueries already searched (do NOT repeat them):\n");
        for q in &prior {
            prompt.push_str("- ");
            prompt.push_str(q);
            prompt.push('\n');
        }
    }

    let fragments = session.fragments();
    if !fragments.is_empty() {
        prompt.push_str(
            "\nInformation gathered so far. Focus the new queries on aspects this does not yet cover:\n",
        );
        for fragment in fragments {
            let snippet: String = fragment.snippet.chars().take(CONTEXT_SNIPPET_CHARS).collect();
            prompt.push_str(&format!("\nSource: {}\n{}\n", fragment.url, snippet));
        }
    }
    prompt
}

fn quoted_item() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'"#).expect("valid regex")
    })
}

fn list_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[-*•+]+|\(?\d{1,2}[.):]|#{1,6}|>)\s*").expect("valid regex")
    })
}

/// Parse a model answer into at most `max` fresh queries.
///
/// Fails with [`GenerationParseError`] when fewer than `min` survive; the
/// error still carries the survivors.
pub fn parse_queries(
    raw: &str,
    prior: &[String],
    max: usize,
    min: usize,
) -> Result<Vec<String>, GenerationParseError> {
    let text: String = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");

    // A list literal only wins when it is the whole answer or finds more
    // items than reading line by line; brackets inside ordinary lines
    // ("[2024] ...") must not be mistaken for one.
    let lines: Vec<String> = text.lines().filter_map(clean_line).collect();
    let bracketed = bracketed_list(&text);
    let trimmed = text.trim();
    let whole_literal = trimmed.starts_with('[') && trimmed.ends_with(']');
    let candidates = if !bracketed.is_empty()
        && (whole_literal || bracketed.len() >= lines.len())
    {
        bracketed
    } else {
        lines
    };

    let mut seen: HashSet<String> = prior.iter().map(|q| q.to_lowercase()).collect();
    let queries: Vec<String> = candidates
        .into_iter()
        .filter(|q| seen.insert(q.to_lowercase()))
        .take(max)
        .collect();

    if queries.len() < min.max(1) {
        return Err(GenerationParseError {
            what: "search queries",
            partial: queries,
        });
    }
    Ok(queries)
}

/// `['a', "b"]` style answers.
fn bracketed_list(text: &str) -> Vec<String> {
    let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }
    quoted_item()
        .captures_iter(&text[start + 1..end])
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().replace("\\\"", "\"").replace("\\'", "'").trim().to_string())
        .filter(|q| !q.is_empty())
        .collect()
}

fn clean_line(line: &str) -> Option<String> {
    let mut item = line.trim();
    item = list_marker().find(item).map_or(item, |m| &item[m.end()..]);
    let item = item
        .trim()
        .trim_matches(|c| c == '*' || c == '`')
        .trim_end_matches(',')
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    // "Here are four queries:" style preambles
    if item.is_empty() || item.ends_with(':') {
        return None;
    }
    Some(item.to_string())
}
