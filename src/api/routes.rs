//! Route table and server lifecycle.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{auth, control, inference, openai};
use crate::config::Config;
use crate::orchestrator::Orchestrator;

/// Shared application state.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Assemble the full router. Exposed separately from [`serve`] so tests can
/// drive the HTTP surface against an in-process orchestrator.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Inference payloads with long prompts can exceed the default 2MB body
    // limit; allow a generous margin.
    let body_limit = DefaultBodyLimit::max(50 * 1024 * 1024);

    let native = Router::new()
        .route("/api/generate", post(inference::generate))
        .route("/api/chat", post(inference::chat))
        .route("/api/embeddings", post(inference::embeddings))
        .route("/api/embed", post(inference::embed))
        .route("/api/tags", get(inference::tags))
        .route("/api/ps", get(inference::ps))
        .route("/api/version", get(inference::version))
        .route("/api/show", post(inference::show))
        // Model-store mutations target a single backend and are refused.
        .route("/api/pull", any(inference::unsupported))
        .route("/api/delete", any(inference::unsupported))
        .route("/api/copy", any(inference::unsupported))
        .route("/api/create", any(inference::unsupported))
        .route("/api/push", any(inference::unsupported))
        .route("/api/blobs/*rest", any(inference::unsupported));

    let openai_compat = Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/v1/models", get(openai::list_models))
        .route("/v1/models/:model", get(openai::get_model));

    let control_plane = Router::new()
        .nest("/api/orchestrator", control::router())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_control_token,
        ));

    Router::new()
        .route("/api/health", get(inference::health))
        .merge(native)
        .merge(openai_compat)
        .merge(control_plane)
        .layer(body_limit)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and run until interrupted.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);

    let orchestrator = Orchestrator::new(config);
    orchestrator.load_persistent_state().await;
    orchestrator.start_background_tasks();

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "fleetgate listening");

    let shutdown_orchestrator = Arc::clone(&orchestrator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_interrupt().await;
            shutdown_orchestrator.shutdown().await;
        })
        .await?;
    Ok(())
}

async fn wait_for_interrupt() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
