//! Error types shared by the research engine, its providers and adapters.

use std::path::PathBuf;

/// A backend call (generation, search or extraction) that did not produce a result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider}: request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider}: HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider}: authentication failed")]
    Auth { provider: String },

    #[error("{provider}: rate limit exceeded")]
    RateLimited { provider: String },

    #[error("{provider}: timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    #[error("{provider}: invalid response: {message}")]
    InvalidResponse { provider: String, message: String },
}

impl ProviderError {
    /// Classify a non-success HTTP status the way every backend does.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 | 403 => ProviderError::Auth {
                provider: provider.to_string(),
            },
            429 => ProviderError::RateLimited {
                provider: provider.to_string(),
            },
            code => ProviderError::Status {
                provider: provider.to_string(),
                status: code,
                body: body.chars().take(500).collect(),
            },
        }
    }

    pub fn request(provider: &str, err: impl std::fmt::Display) -> Self {
        ProviderError::Request {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    pub fn invalid(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Network failures, rate limits and 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Request { .. } | ProviderError::RateLimited { .. } => true,
            ProviderError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Model output that did not have the expected shape.
///
/// Always recoverable: `partial` holds whatever could be salvaged.
#[derive(Debug, Clone, thiserror::Error)]
#[error("could not parse {what} from model output (salvaged {} item(s))", partial.len())]
pub struct GenerationParseError {
    pub what: &'static str,
    pub partial: Vec<String>,
}

/// Reasons a research session ends without a report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResearchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("query generation failed: {0}")]
    QueryGeneration(#[source] ProviderError),

    #[error("report synthesis failed: {0}")]
    Synthesis(#[source] ProviderError),

    #[error("research cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("missing required setting {key}")]
    Missing { key: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("report {0} not found")]
    NotFound(String),

    #[error("invalid report id: {0}")]
    InvalidId(String),

    #[error("report store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let auth = ProviderError::from_status("openai", reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(matches!(auth, ProviderError::Auth { .. }));
        assert!(!auth.is_transient());

        let limited =
            ProviderError::from_status("openai", reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(limited.is_transient());

        let server =
            ProviderError::from_status("bing", reqwest::StatusCode::BAD_GATEWAY, "upstream");
        assert!(server.is_transient());

        let client = ProviderError::from_status("bing", reqwest::StatusCode::BAD_REQUEST, "bad");
        assert!(!client.is_transient());
        assert_eq!(client.to_string(), "bing: HTTP 400: bad");
    }

    #[test]
    fn parse_error_reports_salvage() {
        let err = GenerationParseError {
            what: "search queries",
            partial: vec!["one".into()],
        };
        assert_eq!(
            err.to_string(),
            "could not parse search queries from model output (salvaged 1 item(s))"
        );
    }
}
