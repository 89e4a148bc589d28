//! Progress events and the ordered log they are appended to.
//!
//! Every stage of a session reports through one [`EventSink`]. Appends are
//! serialized behind a mutex, so concurrent page pipelines interleave but
//! never tear the log, and an optional live subscriber sees events in exactly
//! the order they were recorded. The first terminal event (`complete` or
//! `error`) closes the sink.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Start {
        message: String,
    },
    Progress {
        message: String,
    },
    Queries {
        message: String,
        queries: Vec<String>,
    },
    Iteration {
        message: String,
        iteration: u32,
    },
    Links {
        message: String,
        count: usize,
    },
    Processing {
        message: String,
        url: String,
    },
    Evaluation {
        message: String,
        url: String,
        useful: bool,
    },
    Context {
        message: String,
        url: String,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "is_false")]
        cancelled: bool,
    },
    Complete {
        message: String,
        report: String,
        logs: Vec<String>,
    },
}

impl StreamEvent {
    pub fn progress(message: impl Into<String>) -> Self {
        StreamEvent::Progress {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        StreamEvent::Warning {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            cancelled: false,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            cancelled: true,
        }
    }

    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Progress { .. } => "progress",
            StreamEvent::Queries { .. } => "queries",
            StreamEvent::Iteration { .. } => "iteration",
            StreamEvent::Links { .. } => "links",
            StreamEvent::Processing { .. } => "processing",
            StreamEvent::Evaluation { .. } => "evaluation",
            StreamEvent::Context { .. } => "context",
            StreamEvent::Warning { .. } => "warning",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Complete { .. } => "complete",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StreamEvent::Start { message }
            | StreamEvent::Progress { message }
            | StreamEvent::Queries { message, .. }
            | StreamEvent::Iteration { message, .. }
            | StreamEvent::Links { message, .. }
            | StreamEvent::Processing { message, .. }
            | StreamEvent::Evaluation { message, .. }
            | StreamEvent::Context { message, .. }
            | StreamEvent::Warning { message }
            | StreamEvent::Error { message, .. }
            | StreamEvent::Complete { message, .. } => message,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    pub fn log_line(&self) -> String {
        match self {
            StreamEvent::Warning { message } => format!("Warning: {}", message),
            StreamEvent::Error { message, .. } => format!("Error: {}", message),
            other => other.message().to_string(),
        }
    }
}

#[derive(Default)]
struct SinkState {
    log: Vec<StreamEvent>,
    subscriber: Option<mpsc::UnboundedSender<StreamEvent>>,
    terminated: bool,
}

/// Append-only, single-writer-at-a-time event log for one session.
#[derive(Clone, Default)]
pub struct EventSink {
    state: Arc<Mutex<SinkState>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink together with a live receiver of every event it records.
    pub fn with_subscriber() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let sink = Self::new();
        let rx = sink.subscribe();
        (sink, rx)
    }

    /// Attach a live subscriber. Events recorded so far are delivered first.
    /// Replaces any previous subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for event in &state.log {
            let _ = tx.send(event.clone());
        }
        if !state.terminated {
            state.subscriber = Some(tx);
        }
        rx
    }

    /// Record an event. Ignored once a terminal event has been recorded.
    pub fn emit(&self, event: StreamEvent) {
        let mut state = self.lock();
        if state.terminated {
            debug!(kind = event.kind(), "dropping event emitted after terminal event");
            return;
        }
        let terminal = event.is_terminal();
        if let Some(tx) = &state.subscriber {
            if tx.send(event.clone()).is_err() {
                state.subscriber = None;
            }
        }
        state.log.push(event);
        if terminal {
            state.terminated = true;
            // Dropping the sender ends the subscriber's stream.
            state.subscriber = None;
        }
    }

    pub fn snapshot(&self) -> Vec<StreamEvent> {
        self.lock().log.clone()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.lock().log.iter().map(StreamEvent::log_line).collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    pub fn len(&self) -> usize {
        self.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    Unfinished,
    Complete { report: String },
    Failed { message: String, cancelled: bool },
}

/// Session facts rebuilt from nothing but its event log.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReplay {
    pub iterations: u32,
    pub queries: Vec<Vec<String>>,
    pub seen_urls: Vec<String>,
    pub useful_urls: Vec<String>,
    pub context_urls: Vec<String>,
    pub new_links: usize,
    pub warnings: usize,
    pub outcome: ReplayOutcome,
}

impl SessionReplay {
    pub fn from_events(events: &[StreamEvent]) -> Self {
        let mut replay = SessionReplay {
            iterations: 0,
            queries: Vec::new(),
            seen_urls: Vec::new(),
            useful_urls: Vec::new(),
            context_urls: Vec::new(),
            new_links: 0,
            warnings: 0,
            outcome: ReplayOutcome::Unfinished,
        };

        for event in events {
            match event {
                StreamEvent::Iteration { iteration, .. } => {
                    replay.iterations = replay.iterations.max(*iteration);
                }
                StreamEvent::Queries { queries, .. } => replay.queries.push(queries.clone()),
                StreamEvent::Links { count, .. } => replay.new_links += count,
                StreamEvent::Processing { url, .. } => replay.seen_urls.push(url.clone()),
                StreamEvent::Evaluation { url, useful, .. } if *useful => {
                    replay.useful_urls.push(url.clone())
                }
                StreamEvent::Context { url, .. } => replay.context_urls.push(url.clone()),
                StreamEvent::Warning { .. } => replay.warnings += 1,
                StreamEvent::Error { message, cancelled } => {
                    replay.outcome = ReplayOutcome::Failed {
                        message: message.clone(),
                        cancelled: *cancelled,
                    };
                    break;
                }
                StreamEvent::Complete { report, .. } => {
                    replay.outcome = ReplayOutcome::Complete {
                        report: report.clone(),
                    };
                    break;
                }
                _ => {}
            }
        }
        replay
    }

    pub fn report(&self) -> Option<&str> {
        match &self.outcome {
            ReplayOutcome::Complete { report } => Some(report),
            _ => None,
        }
    }
}
