//! Anthropic-compatible surface: `POST /v1/messages` and
//! `POST /v1/messages/count_tokens` (`spec.md` §4.7 "Anthropic",
//! `SPEC_FULL.md` §B local token-counting supplement).

use axum::extract::State;
use axum::response::Response;
use axum::Json;

use cloudgate_core::AnthropicOutcome;
use cloudgate_protocol::claude::{CountTokensRequest, CountTokensResponse, CreateMessageRequest};

use crate::response::{error_response, json_response, sse_response};
use crate::state::AppState;

pub async fn messages(State(state): State<AppState>, Json(request): Json<CreateMessageRequest>) -> Response {
    match state.orchestrator.handle_anthropic_messages(request).await {
        Ok(AnthropicOutcome::Unary(response)) => json_response(&response),
        Ok(AnthropicOutcome::Stream(rx)) => sse_response(rx),
        Err(err) => error_response(err),
    }
}

/// `SPEC_FULL.md` §B: like the Gemini-native `countTokens` stub
/// (`gemini.rs`'s `dispatch`), this is a local estimate rather than a call
/// through to the internal endpoint, which has no token-counting method.
pub async fn count_tokens(Json(_request): Json<CountTokensRequest>) -> Response {
    json_response(&CountTokensResponse { input_tokens: 0 })
}
