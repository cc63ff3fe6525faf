//! Palaver Gateway - entry point.

use std::sync::Arc;

use palaver_context::ContextWindow;
use palaver_gateway::{build_routes, AppState, GatewayConfig};
use palaver_pipeline::{CompletionPipeline, PipelineConfig};
use palaver_resilience::CircuitBreaker;
use palaver_runtime::{CompletionClient, OpenAiClient};
use palaver_session::SessionOrchestrator;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "palaver_gateway=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Palaver Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::from_env()?;

    let client: Arc<dyn CompletionClient> = Arc::new(OpenAiClient::from_env());
    let breaker = Arc::new(CircuitBreaker::default());
    let pipeline = Arc::new(CompletionPipeline::new(
        client,
        breaker,
        PipelineConfig {
            model: config.model.clone(),
            ..PipelineConfig::default()
        },
    ));
    let orchestrator = Arc::new(SessionOrchestrator::new(
        pipeline,
        ContextWindow::new(config.token_budget, config.system_prompt.clone()),
    ));

    // Background idle sweep.
    let sweeper = Arc::clone(&orchestrator);
    let max_age = config.session_max_age;
    let mut ticker = tokio::time::interval(config.sweep_interval);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            let removed = sweeper.clear_older_than(max_age).await;
            if removed > 0 {
                tracing::debug!(removed, "sweep pass removed idle sessions");
            }
        }
    });

    let app = build_routes(AppState::new(orchestrator))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
