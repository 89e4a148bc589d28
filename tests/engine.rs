mod common;

use common::*;
use deep_research::{
    EngineSettings, EventSink, ProviderError, ReplayOutcome, ResearchEngine, ResearchError,
    ResearchReport, ResearchRequest, SessionReplay, StreamEvent,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

async fn run(
    harness: &Harness,
    settings: EngineSettings,
    query: &str,
    max_iterations: u32,
) -> (Result<ResearchReport, ResearchError>, Vec<StreamEvent>) {
    let engine = ResearchEngine::new(harness.providers(), settings);
    let events = EventSink::new();
    let result = engine
        .run(
            &ResearchRequest::new(query, max_iterations),
            &events,
            &CancellationToken::new(),
        )
        .await;
    (result, events.snapshot())
}

fn count(events: &[StreamEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}

fn links_counts(events: &[StreamEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Links { count, .. } => Some(*count),
            _ => None,
        })
        .collect()
}

fn assert_single_terminal(events: &[StreamEvent]) {
    let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1, "exactly one terminal event");
    assert!(events.last().unwrap().is_terminal(), "terminal event comes last");
}

/// Five results, two readable and relevant, three unreadable.
fn meditation_harness() -> Harness {
    let urls = [
        "https://health.test/meditation-stress",
        "https://sleep.test/meditation",
        "https://blog.test/broken",
        "https://paywall.test/article",
        "https://video.test/watch",
    ];
    Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::new(move |_| Ok(urls.iter().map(|u| hit(u)).collect())),
        ScriptedExtractor::new(|url| match url {
            "https://health.test/meditation-stress" => {
                PageScript::Text("USEFUL meditation lowers cortisol levels".into())
            }
            "https://sleep.test/meditation" => {
                PageScript::Text("USEFUL meditation improves sleep quality".into())
            }
            _ => PageScript::Absent,
        }),
    )
}

#[tokio::test]
async fn page_pipelines_never_exceed_the_concurrency_limit() {
    let urls: Vec<String> = (1..=6).map(|i| format!("https://many.test/{}", i)).collect();
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::new(move |_| Ok(urls.iter().map(|u| hit(u)).collect())),
        ScriptedExtractor::new(|url| {
            PageScript::Delay(Duration::from_millis(50), format!("USEFUL page {}", url))
        }),
    );
    let settings = EngineSettings {
        page_concurrency: 2,
        ..engine_settings()
    };

    let (result, _events) = run(&harness, settings, "benefits of meditation", 1).await;
    let report = assert_ok!(result);

    assert_eq!(harness.extractor.calls().len(), 6);
    assert_eq!(report.fragments.len(), 6);
    let peak = harness.extractor.peak_in_flight();
    assert!(peak <= 2, "at most 2 pages in flight, saw {}", peak);
    assert_eq!(peak, 2, "the limit is actually used");
}

#[tokio::test]
async fn scenario_a_two_useful_pages_reach_the_report() {
    let harness = meditation_harness();
    let (result, events) = run(&harness, engine_settings(), "benefits of meditation", 1).await;
    let report = assert_ok!(result);

    assert_eq!(report.iterations, 1);
    assert_eq!(report.fragments.len(), 2);
    assert!(report.body.contains("meditation lowers cortisol levels"));
    assert!(report.body.contains("meditation improves sleep quality"));

    // Both fragments were handed to the synthesizer.
    let report_prompts = harness.generator.prompts_of(PromptKind::Report);
    assert_eq!(report_prompts.len(), 1);
    for fragment in &report.fragments {
        assert!(report_prompts[0].contains(&fragment.url));
    }

    assert_eq!(links_counts(&events), vec![5]);
    assert_eq!(count(&events, "processing"), 5);
    assert_eq!(count(&events, "evaluation"), 2);
    assert_eq!(count(&events, "context"), 2);
    assert_eq!(count(&events, "warning"), 3);
    assert_eq!(events.first().unwrap().kind(), "start");
    assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
    assert_single_terminal(&events);
}

#[tokio::test]
async fn scenario_b_all_searches_failing_still_synthesizes() {
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::new(|_| {
            Err(ProviderError::RateLimited {
                provider: "scripted".into(),
            })
        }),
        ScriptedExtractor::all_useful(),
    );
    let (result, events) = run(&harness, engine_settings(), "benefits of meditation", 1).await;
    let report = assert_ok!(result, "empty knowledge base still completes");

    assert_eq!(links_counts(&events), vec![0]);
    assert_eq!(count(&events, "warning"), 2, "one warning per failed query");
    assert!(report.fragments.is_empty());
    assert_eq!(report.body, "No sufficient information found for this query.");
    assert_eq!(harness.generator.prompts_of(PromptKind::Report).len(), 1);
    assert!(harness.extractor.calls().is_empty());
    assert_single_terminal(&events);
}

#[tokio::test]
async fn scenario_c_one_failing_page_does_not_disturb_the_others() {
    let urls: Vec<String> = (1..=5).map(|i| format!("https://p{}.test/page", i)).collect();
    let search_urls = urls.clone();
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::new(move |_| Ok(search_urls.iter().map(|u| hit(u)).collect())),
        ScriptedExtractor::new(|url| {
            if url == "https://p3.test/page" {
                PageScript::Panic
            } else {
                PageScript::Delay(Duration::from_millis(20), format!("USEFUL notes at {}", url))
            }
        }),
    );
    let (result, events) = run(&harness, engine_settings(), "benefits of meditation", 1).await;
    let report = result.expect("a failing page never aborts the session");

    assert_eq!(report.fragments.len(), 4);
    assert!(report
        .fragments
        .iter()
        .all(|f| f.url != "https://p3.test/page"));

    let replay = SessionReplay::from_events(&events);
    assert!(replay.seen_urls.contains(&"https://p3.test/page".to_string()));
    assert_eq!(replay.seen_urls.len(), 5);
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::Warning { message } if message.contains("https://p3.test/page")
    )));
    assert_single_terminal(&events);
}

#[tokio::test]
async fn scenario_c_provider_error_on_one_page_is_a_warning() {
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::new(|_| {
            Ok(vec![hit("https://ok.test/a"), hit("https://down.test/b")])
        }),
        ScriptedExtractor::new(|url| {
            if url.contains("down") {
                PageScript::Fail
            } else {
                PageScript::Text("USEFUL".into())
            }
        }),
    );
    let (result, events) = run(&harness, engine_settings(), "q", 1).await;
    assert_eq!(result.unwrap().fragments.len(), 1);
    assert_eq!(count(&events, "warning"), 1);
}

#[tokio::test]
async fn scenario_d_stops_when_a_round_adds_nothing() {
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::new(|query| {
            Ok(if query.contains("1a") || query.contains("1b") {
                vec![hit("https://a.test/1"), hit("https://a.test/2")]
            } else {
                // already seen, plus one irrelevant page
                vec![hit("https://a.test/1/"), hit("https://junk.test/x")]
            })
        }),
        ScriptedExtractor::new(|url| {
            if url.starts_with("https://junk.test") {
                PageScript::Text("unrelated advertising copy".into())
            } else {
                PageScript::Text(format!("USEFUL {}", url))
            }
        }),
    );
    let (result, events) = run(&harness, engine_settings(), "benefits of meditation", 5).await;
    let report = result.unwrap();

    assert_eq!(report.iterations, 2);
    assert_eq!(count(&events, "iteration"), 2);
    assert_eq!(report.fragments.len(), 2);
    assert_eq!(harness.generator.prompts_of(PromptKind::Queries).len(), 2);
    assert_eq!(links_counts(&events), vec![2, 1]);
}

#[tokio::test]
async fn iteration_count_never_exceeds_the_cap() {
    for max in [1, 2, 3] {
        let harness = Harness::new(
            ScriptedGenerator::new(),
            ScriptedSearcher::per_query(),
            ScriptedExtractor::all_useful(),
        );
        let (result, events) = run(&harness, engine_settings(), "topic", max).await;
        let report = result.unwrap();
        assert_eq!(report.iterations, max, "every round adds context, so the cap stops it");
        assert_eq!(SessionReplay::from_events(&events).iterations, max);
        assert!(events.iter().all(|e| match e {
            StreamEvent::Iteration { iteration, .. } => *iteration <= max,
            _ => true,
        }));
    }
}

#[tokio::test]
async fn urls_are_processed_once_across_rounds() {
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::new(|query| {
            Ok(vec![
                hit("https://shared.test/common?utm_source=newsletter"),
                hit("https://shared.test/common/"),
                hit("https://shared.test/common#section"),
                hit(&format!("https://site.test/{}", slug(query))),
            ])
        }),
        ScriptedExtractor::all_useful(),
    );
    let (result, events) = run(&harness, engine_settings(), "topic", 3).await;
    let report = result.unwrap();
    assert_eq!(report.iterations, 3);

    let replay = SessionReplay::from_events(&events);
    let unique: HashSet<_> = replay.seen_urls.iter().collect();
    assert_eq!(unique.len(), replay.seen_urls.len(), "no URL processed twice");
    assert_eq!(
        replay
            .seen_urls
            .iter()
            .filter(|u| u.as_str() == "https://shared.test/common")
            .count(),
        1
    );
    assert_eq!(harness.extractor.calls().len(), replay.seen_urls.len());
}

#[tokio::test]
async fn fragments_only_exist_for_useful_verdicts() {
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::per_query(),
        ScriptedExtractor::new(|url| {
            if url.ends_with('a') {
                PageScript::Text(format!("USEFUL {}", url))
            } else {
                PageScript::Text("nothing relevant here".into())
            }
        }),
    );
    let (result, events) = run(&harness, engine_settings(), "topic", 2).await;
    let report = result.unwrap();
    let replay = SessionReplay::from_events(&events);

    assert!(!report.fragments.is_empty());
    for fragment in &report.fragments {
        assert!(replay.useful_urls.contains(&fragment.url));
    }
    for url in &replay.context_urls {
        assert!(replay.useful_urls.contains(url));
    }
}

#[tokio::test]
async fn event_log_replays_to_the_same_report() {
    let harness = meditation_harness();
    let (result, events) = run(&harness, engine_settings(), "benefits of meditation", 2).await;
    let report = result.unwrap();

    assert_eq!(report.events, events);
    let replay = SessionReplay::from_events(&report.events);
    assert_eq!(replay.report(), Some(report.body.as_str()));
    assert_eq!(replay.iterations, report.iterations);
    let fragment_urls: Vec<_> = report.fragments.iter().map(|f| f.url.clone()).collect();
    assert_eq!(replay.context_urls, fragment_urls);

    // The wire form carries everything needed, too.
    let wire = serde_json::to_string(&report.events).unwrap();
    let decoded: Vec<StreamEvent> = serde_json::from_str(&wire).unwrap();
    assert_eq!(SessionReplay::from_events(&decoded), replay);
}

#[tokio::test]
async fn per_url_events_keep_their_step_order() {
    let harness = meditation_harness();
    let (_, events) = run(&harness, engine_settings(), "benefits of meditation", 1).await;
    for url in ["https://health.test/meditation-stress", "https://sleep.test/meditation"] {
        let kinds: Vec<_> = events
            .iter()
            .filter(|e| match e {
                StreamEvent::Processing { url: u, .. }
                | StreamEvent::Evaluation { url: u, .. }
                | StreamEvent::Context { url: u, .. } => u == url,
                _ => false,
            })
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec!["processing", "evaluation", "context"]);
    }
}

#[tokio::test]
async fn context_events_carry_a_short_preview() {
    let long_text = format!("USEFUL {}", "detail ".repeat(200));
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::new(|_| Ok(vec![hit("https://long.test/")])),
        ScriptedExtractor::new(move |_| PageScript::Text(long_text.clone())),
    );
    let (result, events) = run(&harness, engine_settings(), "topic", 1).await;
    let report = result.unwrap();
    let preview = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::Context { message, .. } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(preview.chars().count() <= 200);
    assert!(report.fragments[0].snippet.len() > preview.len());
}

#[tokio::test]
async fn later_rounds_see_prior_queries_and_context() {
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::per_query(),
        ScriptedExtractor::all_useful(),
    );
    let (result, _) = run(&harness, engine_settings(), "topic", 2).await;
    result.unwrap();

    let planning = harness.generator.prompts_of(PromptKind::Queries);
    assert_eq!(planning.len(), 2);
    assert!(!planning[0].contains("already searched"));
    assert!(planning[1].contains("- topic aspect 1a"));
    assert!(planning[1].contains("USEFUL facts from https://site.test/topic-aspect-1a"));

    let extraction = harness.generator.prompts_of(PromptKind::Extract);
    assert!(extraction
        .iter()
        .any(|p| p.contains("Search Query: topic aspect 1a")));
}

#[tokio::test]
async fn first_round_generation_failure_is_fatal() {
    let harness = Harness::new(
        ScriptedGenerator::new().with_queries(|_| {
            Err(ProviderError::Auth {
                provider: "scripted".into(),
            })
        }),
        ScriptedSearcher::per_query(),
        ScriptedExtractor::all_useful(),
    );
    let (result, events) = run(&harness, engine_settings(), "topic", 3).await;
    assert!(matches!(result, Err(ResearchError::QueryGeneration(_))));
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error { cancelled: false, .. })
    ));
    assert_eq!(count(&events, "complete"), 0);
    assert!(harness.searcher.calls().is_empty());
    assert_single_terminal(&events);
}

#[tokio::test]
async fn later_generation_failure_falls_back_to_the_question() {
    let harness = Harness::new(
        ScriptedGenerator::new().with_queries(|round| {
            if round == 1 {
                Ok("1. first angle\n2. second angle".into())
            } else {
                Err(ProviderError::Timeout {
                    provider: "scripted".into(),
                    secs: 60,
                })
            }
        }),
        ScriptedSearcher::per_query(),
        ScriptedExtractor::all_useful(),
    );
    let (result, events) = run(&harness, engine_settings(), "benefits of meditation", 2).await;
    result.unwrap();

    let replay = SessionReplay::from_events(&events);
    assert_eq!(replay.queries[1], vec!["benefits of meditation".to_string()]);
    assert!(count(&events, "warning") >= 1);
}

#[tokio::test]
async fn unparseable_queries_degrade_to_the_question() {
    let harness = Harness::new(
        ScriptedGenerator::new().with_queries(|_| Ok("Sure:\n\n".into())),
        ScriptedSearcher::per_query(),
        ScriptedExtractor::all_useful(),
    );
    let (result, events) = run(&harness, engine_settings(), "benefits of meditation", 1).await;
    result.unwrap();
    let replay = SessionReplay::from_events(&events);
    assert_eq!(replay.queries, vec![vec!["benefits of meditation".to_string()]]);
    assert_eq!(count(&events, "warning"), 1);
}

#[tokio::test]
async fn synthesis_failure_fails_the_session() {
    let harness = Harness::new(
        ScriptedGenerator::new().failing_report(ProviderError::Status {
            provider: "scripted".into(),
            status: 503,
            body: "overloaded".into(),
        }),
        ScriptedSearcher::per_query(),
        ScriptedExtractor::all_useful(),
    );
    let (result, events) = run(&harness, engine_settings(), "topic", 1).await;
    let err = assert_err!(result);
    assert!(matches!(err, ResearchError::Synthesis(_)));
    let replay = SessionReplay::from_events(&events);
    assert!(matches!(
        replay.outcome,
        ReplayOutcome::Failed { cancelled: false, .. }
    ));
    assert_single_terminal(&events);
}

#[tokio::test]
async fn sufficiency_judge_can_stop_early() {
    let harness = Harness::new(
        ScriptedGenerator::new().with_sufficiency("<done>"),
        ScriptedSearcher::per_query(),
        ScriptedExtractor::all_useful(),
    );
    let settings = EngineSettings {
        judge_sufficiency: true,
        ..engine_settings()
    };
    let (result, _) = run(&harness, settings, "topic", 5).await;
    assert_eq!(result.unwrap().iterations, 1);
    assert_eq!(
        harness.generator.prompts_of(PromptKind::Sufficiency).len(),
        1
    );
}

#[tokio::test]
async fn sufficiency_judge_is_off_by_default() {
    let harness = Harness::new(
        ScriptedGenerator::new().with_sufficiency("<done>"),
        ScriptedSearcher::per_query(),
        ScriptedExtractor::all_useful(),
    );
    let (result, _) = run(&harness, engine_settings(), "topic", 2).await;
    assert_eq!(result.unwrap().iterations, 2);
    assert!(harness
        .generator
        .prompts_of(PromptKind::Sufficiency)
        .is_empty());
}

#[tokio::test]
async fn timed_out_extraction_is_treated_like_any_provider_error() {
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::new(|_| Ok(vec![hit("https://slow.test/"), hit("https://fast.test/")])),
        ScriptedExtractor::new(|url| {
            if url.contains("slow") {
                PageScript::Hang
            } else {
                PageScript::Text("USEFUL".into())
            }
        }),
    );
    let settings = EngineSettings {
        call_timeout: Duration::from_millis(100),
        ..engine_settings()
    };
    let (result, events) = run(&harness, settings, "topic", 1).await;
    assert_eq!(result.unwrap().fragments.len(), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::Warning { message } if message.contains("slow.test") && message.contains("timed out")
    )));
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_work() {
    let harness = meditation_harness();
    for request in [ResearchRequest::new("   ", 3), ResearchRequest::new("q", 0), ResearchRequest::new("q", 21)] {
        let engine = ResearchEngine::new(harness.providers(), engine_settings());
        let events = EventSink::new();
        let result = engine
            .run(&request, &events, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ResearchError::InvalidRequest(_))));
        assert_eq!(events.len(), 1);
        assert!(events.is_terminated());
    }
    assert!(harness.generator.prompts().is_empty());
}

#[tokio::test]
async fn cancellation_releases_in_flight_pages_and_ends_with_a_cancelled_error() {
    let harness = Harness::new(
        ScriptedGenerator::new(),
        ScriptedSearcher::per_query(),
        ScriptedExtractor::new(|_| PageScript::Hang),
    );
    let engine = ResearchEngine::new(harness.providers(), EngineSettings {
        call_timeout: Duration::from_secs(3600),
        ..engine_settings()
    });
    let (events, mut rx) = EventSink::with_subscriber();
    let cancel = CancellationToken::new();

    let task = {
        let events = events.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            engine
                .run(&ResearchRequest::new("topic", 3), &events, &cancel)
                .await
        })
    };

    // Wait until page pipelines are in flight.
    while let Some(event) = rx.recv().await {
        if event.kind() == "processing" {
            break;
        }
    }
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancellation is prompt")
        .unwrap();
    assert!(matches!(result, Err(ResearchError::Cancelled)));

    let log = events.snapshot();
    assert!(matches!(
        log.last(),
        Some(StreamEvent::Error { cancelled: true, .. })
    ));
    assert_single_terminal(&log);

    // The live stream closes right after the terminal event.
    let mut rest = Vec::new();
    while let Some(event) = rx.recv().await {
        rest.push(event);
    }
    assert!(rest.last().map_or(false, |e| e.is_terminal()));
}
