//! Gemini-native surface: model listing plus the combined
//! `{model}:generateContent` / `{model}:streamGenerateContent` /
//! `{model}/countTokens` dispatch (`spec.md` §4.7 "Gemini").
//!
//! Grounded on the donor's `split_provider_model_action`
//! (`gproxy-router/src/proxy.rs`), minus the provider-prefix segment this
//! gateway has no use for (one upstream family, not an N-provider registry).

use axum::extract::{Path, State};
use bytes::Bytes;
use axum::response::{IntoResponse, Response};

use cloudgate_protocol::gemini::{CountTokensResponse, GenerateContentRequestBody, GeminiModel, ListModelsResponse};
use cloudgate_transform::known_model_ids;

use crate::response::{json_response, sse_response};
use crate::state::AppState;

pub async fn list_models() -> Response {
    let models = known_model_ids().into_iter().map(model_entry).collect();
    json_response(&ListModelsResponse { models })
}

pub async fn get_model(Path(name): Path<String>) -> Response {
    let (model, _action) = parse_model_action(&name);
    match known_model_ids().into_iter().find(|id| *id == model) {
        Some(id) => json_response(&model_entry(id)),
        None => cloudgate_core::ProxyError::not_found(
            serde_json::json!({"error": {"code": 404, "message": format!("model {model} not found"), "status": "NOT_FOUND"}})
                .to_string(),
        )
        .into_response(),
    }
}

/// Dispatches on the `:action`/`/countTokens` suffix carried in the wildcard
/// path segment — this single route serves `generateContent`,
/// `streamGenerateContent`, and `countTokens` alike (`spec.md` §4.7 "combined
/// `POST /v1beta/models/{modelAction}`").
pub async fn dispatch(State(state): State<AppState>, Path(name): Path<String>, body: Bytes) -> Response {
    let (model, action) = parse_model_action(&name);

    match action.as_deref() {
        Some("generateContent") => {
            let request = match parse_body(&body) {
                Ok(request) => request,
                Err(err) => return err.into_response(),
            };
            match state.orchestrator.handle_gemini_generate_content(&model, request).await {
                Ok(response) => json_response(&response),
                Err(err) => err.into_response(),
            }
        }
        Some("streamGenerateContent") => {
            let request = match parse_body(&body) {
                Ok(request) => request,
                Err(err) => return err.into_response(),
            };
            match state
                .orchestrator
                .handle_gemini_stream_generate_content(&model, request)
                .await
            {
                Ok(rx) => sse_response(rx),
                Err(err) => err.into_response(),
            }
        }
        Some("countTokens") => {
            // `spec.md` §4.7: always returns `{totalTokens:0}` — token counting
            // against the internal endpoint is not implemented.
            json_response(&CountTokensResponse { total_tokens: 0 })
        }
        _ => cloudgate_core::ProxyError::not_found(
            serde_json::json!({"error": {"code": 404, "message": "unknown action", "status": "NOT_FOUND"}})
                .to_string(),
        )
        .into_response(),
    }
}

fn parse_body(body: &[u8]) -> Result<GenerateContentRequestBody, cloudgate_core::ProxyError> {
    serde_json::from_slice(body).map_err(|err| {
        cloudgate_core::ProxyError::bad_request(
            serde_json::json!({"error": {"code": 400, "message": format!("invalid request body: {err}"), "status": "INVALID_ARGUMENT"}})
                .to_string(),
        )
    })
}

fn model_entry(id: String) -> GeminiModel {
    GeminiModel {
        name: format!("models/{id}"),
        display_name: id.clone(),
        supported_generation_methods: vec![
            "generateContent".to_string(),
            "streamGenerateContent".to_string(),
            "countTokens".to_string(),
        ],
    }
}

/// Splits a `{model}:action` or `{model}/countTokens` wildcard segment.
/// Bare `model` names (the `GET` model-lookup path) come back with no action.
fn parse_model_action(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim_start_matches('/');
    let raw = raw.strip_prefix("models/").unwrap_or(raw);

    if let Some(idx) = raw.rfind(':') {
        return (raw[..idx].to_string(), Some(raw[idx + 1..].to_string()));
    }
    if let Some(model) = raw.strip_suffix("/countTokens") {
        return (model.to_string(), Some("countTokens".to_string()));
    }
    (raw.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_colon_action() {
        assert_eq!(
            parse_model_action("gemini-2.5-pro:generateContent"),
            ("gemini-2.5-pro".to_string(), Some("generateContent".to_string()))
        );
    }

    #[test]
    fn splits_count_tokens_suffix() {
        assert_eq!(
            parse_model_action("gemini-2.5-pro/countTokens"),
            ("gemini-2.5-pro".to_string(), Some("countTokens".to_string()))
        );
    }

    #[test]
    fn bare_model_has_no_action() {
        assert_eq!(parse_model_action("gemini-2.5-pro"), ("gemini-2.5-pro".to_string(), None));
    }

    #[test]
    fn strips_models_prefix() {
        assert_eq!(
            parse_model_action("models/gemini-2.5-pro:generateContent"),
            ("gemini-2.5-pro".to_string(), Some("generateContent".to_string()))
        );
    }
}
