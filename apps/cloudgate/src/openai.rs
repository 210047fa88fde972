//! OpenAI-compatible surface: Chat Completions, legacy Completions,
//! Responses, Images, Audio, and model listing (`spec.md` §4.7 "OpenAI").

use axum::extract::{Multipart, State};
use axum::response::Response;
use axum::Json;

use cloudgate_core::ChatOutcome;
use cloudgate_protocol::openai::{
    AudioTranscriptionRequest, ChatCompletionRequest, CompletionsRequest, CreateResponseRequest,
    ImageEditRequest, ImageGenerationRequest, ListModelsResponse, ModelObject,
};
use cloudgate_transform::known_model_ids;

use crate::response::{error_response, json_response, sse_response};
use crate::state::AppState;

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    match state.orchestrator.handle_chat_completions(request).await {
        Ok(ChatOutcome::Unary(response)) => json_response(&response),
        Ok(ChatOutcome::Stream(rx)) => sse_response(rx),
        Err(err) => error_response(err),
    }
}

pub async fn completions(
    State(state): State<AppState>,
    Json(request): Json<CompletionsRequest>,
) -> Response {
    match state.orchestrator.handle_completions(request).await {
        Ok(response) => json_response(&response),
        Err(err) => error_response(err),
    }
}

pub async fn responses(
    State(state): State<AppState>,
    Json(request): Json<CreateResponseRequest>,
) -> Response {
    match state.orchestrator.handle_responses(request).await {
        Ok(response) => json_response(&response),
        Err(err) => error_response(err),
    }
}

pub async fn image_generations(
    State(state): State<AppState>,
    Json(request): Json<ImageGenerationRequest>,
) -> Response {
    match state.orchestrator.handle_image_generation(request).await {
        Ok(response) => json_response(&response),
        Err(err) => error_response(err),
    }
}

/// `spec.md` §4.7: `multipart/form-data` with `image` (required), `mask`
/// (optional) file parts and `prompt`/`model` fields.
pub async fn image_edits(State(state): State<AppState>, multipart: Multipart) -> Response {
    match parse_image_edit_multipart(multipart).await {
        Ok(request) => match state.orchestrator.handle_image_edit(request).await {
            Ok(response) => json_response(&response),
            Err(err) => error_response(err),
        },
        Err(err) => error_response(err),
    }
}

/// `spec.md` §4.7: `multipart/form-data` with `file` (required audio part)
/// and `model`/`prompt` fields.
pub async fn audio_transcriptions(State(state): State<AppState>, multipart: Multipart) -> Response {
    match parse_audio_multipart(multipart).await {
        Ok(request) => match state.orchestrator.handle_audio_transcription(request).await {
            Ok(response) => json_response(&response),
            Err(err) => error_response(err),
        },
        Err(err) => error_response(err),
    }
}

pub async fn list_models() -> Response {
    let models = known_model_ids().into_iter().map(ModelObject::from_id).collect();
    json_response(&ListModelsResponse::new(models))
}

async fn parse_image_edit_multipart(
    mut multipart: Multipart,
) -> Result<ImageEditRequest, cloudgate_core::ProxyError> {
    let mut prompt = None;
    let mut model = None;
    let mut image = None;
    let mut image_mime_type = None;
    let mut mask = None;

    while let Some(field) = next_field(&mut multipart).await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "prompt" => prompt = Some(field_text(field).await?),
            "model" => model = Some(field_text(field).await?),
            "image" | "image[]" => {
                let mime = field.content_type().unwrap_or("image/png").to_string();
                image_mime_type = Some(mime);
                image = Some(field_bytes(field).await?);
            }
            "mask" => mask = Some(field_bytes(field).await?),
            _ => {}
        }
    }

    let prompt = prompt.ok_or_else(|| bad_request("missing prompt"))?;
    let image = image.ok_or_else(|| bad_request("missing image"))?;
    let image_mime_type = image_mime_type.unwrap_or_else(|| "image/png".to_string());

    Ok(ImageEditRequest {
        prompt,
        model,
        image,
        image_mime_type,
        mask,
    })
}

async fn parse_audio_multipart(
    mut multipart: Multipart,
) -> Result<AudioTranscriptionRequest, cloudgate_core::ProxyError> {
    let mut model = None;
    let mut prompt = None;
    let mut audio = None;
    let mut mime_type = None;

    while let Some(field) = next_field(&mut multipart).await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "model" => model = Some(field_text(field).await?),
            "prompt" => prompt = Some(field_text(field).await?),
            "file" => {
                mime_type = field.content_type().map(str::to_string);
                audio = Some(field_bytes(field).await?);
            }
            _ => {}
        }
    }

    let audio = audio.ok_or_else(|| bad_request("missing file"))?;
    // `spec.md` §4.7 "decodes base64 audio as `audio/mpeg` by default".
    let mime_type = mime_type.unwrap_or_else(|| "audio/mpeg".to_string());

    Ok(AudioTranscriptionRequest {
        model,
        audio,
        mime_type,
        prompt,
    })
}

async fn next_field(
    multipart: &mut Multipart,
) -> Result<Option<axum::extract::multipart::Field<'_>>, cloudgate_core::ProxyError> {
    multipart
        .next_field()
        .await
        .map_err(|err| bad_request(format!("invalid multipart body: {err}")))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, cloudgate_core::ProxyError> {
    field
        .text()
        .await
        .map_err(|err| bad_request(format!("invalid form field: {err}")))
}

async fn field_bytes(field: axum::extract::multipart::Field<'_>) -> Result<Vec<u8>, cloudgate_core::ProxyError> {
    field
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|err| bad_request(format!("invalid form field: {err}")))
}

fn bad_request(message: impl Into<String>) -> cloudgate_core::ProxyError {
    let body = serde_json::json!({
        "error": {
            "message": message.into(),
            "type": "invalid_request_error",
        }
    });
    cloudgate_core::ProxyError::bad_request(body.to_string())
}
