//! `apps/cloudgate`: the HTTP frontends (C9), config wiring, and process
//! entrypoint.
//!
//! Grounded on the donor's `apps/gproxy/src/main.rs` (bootstrap → engine →
//! router → `axum::serve`) and `gproxy-router/src/proxy.rs` (route table,
//! auth middleware, SSE response shaping).

mod accounts;
mod anthropic;
mod gemini;
mod oauth;
mod openai;
mod response;
mod state;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;

use cloudgate_common::GatewayConfigPatch;
use cloudgate_core::{AuthGuard, ClientProtocol, ProxyOrchestrator, TokenPool, UpstreamClient};

use crate::accounts::load_accounts_from_env;
use crate::oauth::GoogleOAuthRefresher;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("cloudgate=info".parse()?))
        .init();

    let config = GatewayConfigPatch::from_env().into_config();

    let store = Arc::new(load_accounts_from_env()?);
    let refresher = Arc::new(GoogleOAuthRefresher::from_env()?);
    let token_pool = Arc::new(TokenPool::new(store, refresher));
    let upstream = Arc::new(UpstreamClient::new(&config)?);
    let orchestrator = Arc::new(ProxyOrchestrator::new(token_pool, upstream, config.clone()));
    let auth = Arc::new(AuthGuard::new(config.api_key.clone()));

    let state = AppState { orchestrator, auth };
    let app = build_router(state);

    let bind = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "cloudgate listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        // OpenAI
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/responses", post(openai::responses))
        .route("/v1/images/generations", post(openai::image_generations))
        .route("/v1/images/edits", post(openai::image_edits))
        .route("/v1/audio/transcriptions", post(openai::audio_transcriptions))
        .route("/v1/models", get(openai::list_models))
        // Anthropic
        .route("/v1/messages", post(anthropic::messages))
        .route("/v1/messages/count_tokens", post(anthropic::count_tokens))
        // Gemini-native
        .route("/v1beta/models", get(gemini::list_models))
        .route("/v1beta/models/{*name}", get(gemini::get_model))
        .route("/v1beta/models/{*name}", post(gemini::dispatch))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

/// `spec.md` §4.8: a single shared bearer key checked across all three
/// surfaces, rendered in whichever protocol shape the path implies.
async fn require_auth(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let protocol = protocol_for_path(request.uri().path());
    if let Err(err) = state.auth.authenticate(request.headers(), protocol) {
        use axum::response::IntoResponse;
        return Ok(err.into_response());
    }
    Ok(next.run(request).await)
}

fn protocol_for_path(path: &str) -> ClientProtocol {
    if path.starts_with("/v1beta/") {
        ClientProtocol::Gemini
    } else if path == "/v1/messages" {
        ClientProtocol::Anthropic
    } else {
        ClientProtocol::OpenAi
    }
}
