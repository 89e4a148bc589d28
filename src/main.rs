use deep_research::{api, providers, AppState, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Configuration is resolved once and handed down explicitly
    let settings = Settings::from_env()?;

    info!("Starting Deep Research server");
    info!(
        "LLM provider: {:?} ({}), search provider: {:?}, extractor: {:?}",
        settings.llm.provider,
        settings.llm.model(),
        settings.search.provider,
        settings.extractor.kind
    );

    let http_client = providers::build_http_client()?;

    let bind_addr = settings.bind_addr.clone();
    let state = AppState::new(settings, http_client);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Deep Research server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
