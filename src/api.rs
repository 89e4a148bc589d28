use crate::error::{ResearchError, StoreError};
use crate::events::{EventSink, StreamEvent};
use crate::types::*;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            logs: Vec::new(),
        }),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/api/health", get(health_check))
        .route("/api/research", post(research_handler))
        .route("/api/research/stream", post(research_stream_handler))
        .route("/api/reports", get(list_reports_handler))
        .route("/api/reports/:id", get(get_report_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let providers = match state.providers() {
        Ok(providers) => serde_json::to_value(providers.summary()).unwrap_or_default(),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };
    Json(serde_json::json!({
        "status": "healthy",
        "service": "deep-research",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": providers,
    }))
}

async fn research_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResearchRequest>,
) -> Result<Json<ResearchResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    info!("Processing research request: {}", request.query);

    let engine = state.engine().map_err(|e| {
        error!("Provider configuration error: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    let events = EventSink::new();
    let cancel = CancellationToken::new();

    match state
        .run_session(&engine, &request, &events, &cancel)
        .await
    {
        Ok(report) => Ok(Json(ResearchResponse {
            id: report.id.clone(),
            logs: report.logs(),
            report: report.body,
        })),
        Err(ResearchError::InvalidRequest(e)) => Err(api_error(StatusCode::BAD_REQUEST, e)),
        Err(e) => {
            error!("Research error: {}", e);
            Err((
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: e.to_string(),
                    logs: events.log_lines(),
                }),
            ))
        }
    }
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.kind())
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// Stream a session as server-sent events. The session runs on its own task
/// and is cancelled as soon as the client goes away.
async fn research_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResearchRequest>,
) -> Result<Response, ApiError> {
    request
        .validate()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    info!("Processing streamed research request: {}", request.query);

    let (events, rx) = EventSink::with_subscriber();
    let cancel = CancellationToken::new();
    match state.engine() {
        Ok(engine) => {
            let events = events.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = state.run_session(&engine, &request, &events, &cancel).await {
                    info!("Streamed research ended without a report: {}", e);
                }
            });
        }
        Err(e) => {
            error!("Provider configuration error: {}", e);
            events.emit(StreamEvent::error(format!("Configuration error: {}", e)));
        }
    }

    // Dropped together with the response stream when the client disconnects.
    let guard = cancel.drop_guard();
    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        Ok::<Event, Infallible>(to_sse(&event))
    });
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        StoreError::InvalidId(_) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        StoreError::Io { .. } => {
            error!("Report store error: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn list_reports_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ids = state.store.list().await.map_err(store_error)?;
    Ok(Json(serde_json::json!({ "reports": ids })))
}

async fn get_report_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let markdown = state.store.load(&id).await.map_err(store_error)?;
    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        markdown,
    ))
}
