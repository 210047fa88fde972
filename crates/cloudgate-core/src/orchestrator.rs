//! C8: `ProxyOrchestrator` — the retry loop that ties `TokenPool` and
//! `UpstreamClient` together behind each of the three protocol surfaces
//! (`spec.md` §4.6 "ProxyOrchestrator").
//!
//! Grounded on the donor's handler/provider split (`gproxy-core`'s routing
//! plus `gproxy-provider-impl`'s per-provider request shaping), collapsed
//! here into a single orchestrator since this gateway serves one upstream
//! family instead of an N-provider registry.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use cloudgate_common::{now_unix_seconds, GatewayConfig};
use cloudgate_protocol::claude::{
    ContentBlockParam, CreateMessageRequest, CreateMessageResponse, MessageContent, MessageParam, MessageRole,
    Model, StreamEvent, StreamErrorPayload, TextBlockParam, CLAUDE_ANTHROPIC_BETA, QUOTA_DOWNGRADE_MODEL,
};
use cloudgate_protocol::gemini::{Candidate, Content, GenerateContentRequestBody, GenerateContentResponse};
use cloudgate_protocol::openai::{
    AudioTranscriptionRequest, AudioTranscriptionResponse, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChunkChoice, CompletionsRequest, CompletionsResponse, CreateResponseRequest,
    CreateResponseResponse, Delta, FinishReason, ImageEditRequest, ImageGenerationRequest, ImageGenerationResponse,
    Role,
};
use cloudgate_protocol::sse::{sse_json_frame, SSE_DONE};
use cloudgate_transform::{
    chunk_text_for_stream_fallback, claude_to_completions_response, claude_to_image_response,
    claude_to_internal_gemini, claude_to_openai, claude_to_responses_response, claude_to_transcription_response,
    completions_to_claude, gemini_to_internal_gemini, internal_gemini_to_claude, openai_to_claude,
    resolve_model_route, responses_to_claude, GeminiFrameDecoder, OpenAiStreamEmitter, StreamingState,
};
use cloudgate_protocol::gemini::InternalGenerateContentRequest;

/// Base image model used when a caller omits `model` on `/v1/images/*`
/// (`spec.md` §3 dynamic image-variant grid base id).
const DEFAULT_IMAGE_MODEL: &str = "gemini-3-pro-image";

use crate::account::Account;
use crate::auth_guard::ClientProtocol as Protocol;
use crate::classify::is_quota_exhausted_message;
use crate::error::{GatewayError, ProxyError};
use crate::token_pool::{SelectOptions, TokenPool};
use crate::upstream_client::UpstreamClient;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 250;

pub enum ChatOutcome {
    Unary(ChatCompletionResponse),
    Stream(mpsc::Receiver<Bytes>),
}

pub enum AnthropicOutcome {
    Unary(CreateMessageResponse),
    Stream(mpsc::Receiver<Bytes>),
}

pub enum GeminiOutcome {
    Unary(GenerateContentResponse),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Clone)]
pub struct ProxyOrchestrator {
    token_pool: Arc<TokenPool>,
    upstream: Arc<UpstreamClient>,
    config: Arc<ArcSwap<GatewayConfig>>,
}

impl ProxyOrchestrator {
    pub fn new(token_pool: Arc<TokenPool>, upstream: Arc<UpstreamClient>, config: GatewayConfig) -> Self {
        Self {
            token_pool,
            upstream,
            config: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn reload_config(&self, config: GatewayConfig) {
        self.config.store(Arc::new(config));
    }

    // ---- OpenAI surface -------------------------------------------------

    pub async fn handle_chat_completions(&self, request: ChatCompletionRequest) -> Result<ChatOutcome, ProxyError> {
        let config = self.config.load_full();
        let requested_model = request.model.clone();
        let mapped_model = resolve_model_route(&requested_model, &config.custom_mapping, &config.anthropic_mapping);
        let session_key = extract_openai_session_key(&request);
        let stream = request.stream;
        let claude_request = openai_to_claude(request);
        let template = claude_to_internal_gemini(
            claude_request,
            mapped_model.clone(),
            String::new(),
            String::new(),
            config.request_user_agent.clone(),
        );
        let request_type = request_type_for_model(&mapped_model).to_string();

        if !stream {
            let response = self
                .select_and_generate(Protocol::OpenAi, &mapped_model, &template, session_key, &request_type)
                .await
                .map_err(|err| to_proxy_error(&err, Protocol::OpenAi))?;
            let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
            let claude_response = internal_gemini_to_claude(response, Model::Custom(requested_model), id.clone());
            let openai_response = claude_to_openai(claude_response, id, now_unix_seconds());
            return Ok(ChatOutcome::Unary(openai_response));
        }

        let (tx, rx) = mpsc::channel(32);
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator
                .run_openai_stream(tx, mapped_model, template, session_key, request_type, requested_model)
                .await;
        });
        Ok(ChatOutcome::Stream(rx))
    }

    async fn run_openai_stream(
        &self,
        tx: mpsc::Sender<Bytes>,
        mapped_model: String,
        template: InternalGenerateContentRequest,
        session_key: Option<String>,
        request_type: String,
        requested_model: String,
    ) {
        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        let created = now_unix_seconds();
        let mut emitter = OpenAiStreamEmitter::new(id.clone(), requested_model.clone(), created);

        match self
            .select_and_stream(Protocol::OpenAi, &mapped_model, &template, session_key, &request_type)
            .await
        {
            Ok(body) => {
                let mut decoder = GeminiFrameDecoder::new();
                let mut stream = body.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let Ok(chunk) = chunk else { break };
                    for frame in decoder.push_bytes(&chunk) {
                        let Ok(frame) = frame else { continue };
                        for c in emitter.process_frame(&frame) {
                            if send_sse(&tx, &c).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                for frame in decoder.finish() {
                    let Ok(frame) = frame else { continue };
                    for c in emitter.process_frame(&frame) {
                        let _ = send_sse(&tx, &c).await;
                    }
                }
                for c in emitter.finish_if_empty() {
                    let _ = send_sse(&tx, &c).await;
                }
            }
            Err(_) => {
                // `spec.md` §4.6 "Stream fallback for `stream:true` OpenAI":
                // the streaming call threw before any body arrived. Fall back
                // to a unary call and emit it as synthetic 80-char deltas.
                if let Ok(response) = self
                    .select_and_generate(Protocol::OpenAi, &mapped_model, &template, None, &request_type)
                    .await
                {
                    let claude_response =
                        internal_gemini_to_claude(response, Model::Custom(requested_model.clone()), id.clone());
                    let text = claude_response.text();
                    for piece in chunk_text_for_stream_fallback(&text) {
                        let chunk = ChatCompletionChunk {
                            id: id.clone(),
                            object: "chat.completion.chunk".to_string(),
                            created,
                            model: requested_model.clone(),
                            choices: vec![ChunkChoice {
                                index: 0,
                                delta: Delta {
                                    role: Some(Role::Assistant),
                                    content: Some(piece),
                                    ..Default::default()
                                },
                                finish_reason: None,
                            }],
                        };
                        if send_sse(&tx, &chunk).await.is_err() {
                            return;
                        }
                    }
                    let finish = ChatCompletionChunk {
                        id: id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created,
                        model: requested_model.clone(),
                        choices: vec![ChunkChoice {
                            index: 0,
                            delta: Delta::default(),
                            finish_reason: Some(FinishReason::Stop),
                        }],
                    };
                    let _ = send_sse(&tx, &finish).await;
                }
            }
        }

        let _ = tx.send(Bytes::from_static(SSE_DONE.as_bytes())).await;
    }

    // ---- OpenAI completions / responses / images / audio surfaces ---------

    /// `spec.md` §4.7 `POST /v1/completions`: unary only, `text_completion` shape.
    pub async fn handle_completions(&self, request: CompletionsRequest) -> Result<CompletionsResponse, ProxyError> {
        let claude_request = completions_to_claude(request);
        let response = self.run_claude_unary(claude_request).await?;
        let id = format!("cmpl-{}", uuid::Uuid::new_v4());
        Ok(claude_to_completions_response(response, id, now_unix_seconds()))
    }

    /// `spec.md` §4.7 `POST /v1/responses`.
    pub async fn handle_responses(
        &self,
        request: CreateResponseRequest,
    ) -> Result<CreateResponseResponse, ProxyError> {
        let claude_request = responses_to_claude(request);
        let response = self.run_claude_unary(claude_request).await?;
        let id = format!("resp_{}", uuid::Uuid::new_v4());
        Ok(claude_to_responses_response(response, id, now_unix_seconds()))
    }

    /// `spec.md` §4.7 `POST /v1/images/generations`.
    pub async fn handle_image_generation(
        &self,
        request: ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse, ProxyError> {
        let model = request.model.unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());
        let claude_request = text_prompt_request(model, request.prompt);
        let response = self.run_claude_unary(claude_request).await?;
        Ok(claude_to_image_response(response, now_unix_seconds()))
    }

    /// `spec.md` §4.7 `POST /v1/images/edits`: the source image (and optional
    /// mask) ride along as `image` content blocks; the project-context
    /// fallback this endpoint calls out is the same inline retry
    /// `select_and_generate` already performs for every surface.
    pub async fn handle_image_edit(&self, request: ImageEditRequest) -> Result<ImageGenerationResponse, ProxyError> {
        let model = request.model.unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());
        let mut blocks = vec![ContentBlockParam::Text(TextBlockParam { text: request.prompt })];
        blocks.push(image_block(request.image_mime_type.clone(), &request.image));
        if let Some(mask) = &request.mask {
            blocks.push(image_block(request.image_mime_type, mask));
        }
        let claude_request = blocks_request(model, blocks);
        let response = self.run_claude_unary(claude_request).await?;
        Ok(claude_to_image_response(response, now_unix_seconds()))
    }

    /// `spec.md` §4.7 `POST /v1/audio/transcriptions`: the decoded audio
    /// rides as an `inlineData`-shaped image block reusing the same base64
    /// plumbing (Gemini's `Part.inlineData` is not modality-specific).
    pub async fn handle_audio_transcription(
        &self,
        request: AudioTranscriptionRequest,
    ) -> Result<AudioTranscriptionResponse, ProxyError> {
        let model = request.model.unwrap_or_else(|| "gemini-2.5-flash".to_string());
        let mut blocks = Vec::new();
        if let Some(prompt) = request.prompt {
            blocks.push(ContentBlockParam::Text(TextBlockParam { text: prompt }));
        }
        blocks.push(image_block(request.mime_type, &request.audio));
        let claude_request = blocks_request(model, blocks);
        let response = self.run_claude_unary(claude_request).await?;
        Ok(claude_to_transcription_response(response))
    }

    /// Shared unary path for the four surfaces above: resolve the model,
    /// build the internal template, and run it through the standard retry
    /// core with no session affinity (none of these carry a session key).
    async fn run_claude_unary(&self, request: CreateMessageRequest) -> Result<CreateMessageResponse, ProxyError> {
        let config = self.config.load_full();
        let requested_model = request.model.clone();
        let requested_model_str = requested_model.as_str();
        let mapped_model = resolve_model_route(&requested_model_str, &config.custom_mapping, &config.anthropic_mapping);
        let template = claude_to_internal_gemini(
            request,
            mapped_model.clone(),
            String::new(),
            String::new(),
            config.request_user_agent.clone(),
        );
        let request_type = request_type_for_model(&mapped_model).to_string();

        let response = self
            .select_and_generate(Protocol::OpenAi, &mapped_model, &template, None, &request_type)
            .await
            .map_err(|err| to_proxy_error(&err, Protocol::OpenAi))?;
        Ok(internal_gemini_to_claude(
            response,
            requested_model,
            format!("msg_{}", uuid::Uuid::new_v4()),
        ))
    }

    // ---- Anthropic surface ------------------------------------------------

    pub async fn handle_anthropic_messages(
        &self,
        request: CreateMessageRequest,
    ) -> Result<AnthropicOutcome, ProxyError> {
        let config = self.config.load_full();
        let requested_model = request.model.clone();
        let requested_model_str = requested_model.as_str();
        let mapped_model = resolve_model_route(
            &requested_model_str,
            &config.custom_mapping,
            &config.anthropic_mapping,
        );
        let session_key = extract_anthropic_session_key(&request);
        let stream = request.stream;
        let template = claude_to_internal_gemini(
            request,
            mapped_model.clone(),
            String::new(),
            String::new(),
            config.request_user_agent.clone(),
        );
        let request_type = request_type_for_model(&mapped_model).to_string();

        if !stream {
            let response = self
                .select_and_generate(Protocol::Anthropic, &mapped_model, &template, session_key, &request_type)
                .await
                .map_err(|err| to_proxy_error(&err, Protocol::Anthropic))?;
            let claude_response = internal_gemini_to_claude(
                response,
                requested_model,
                format!("msg_{}", uuid::Uuid::new_v4()),
            );
            return Ok(AnthropicOutcome::Unary(claude_response));
        }

        let (tx, rx) = mpsc::channel(32);
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator
                .run_anthropic_stream(tx, mapped_model, template, session_key, request_type, requested_model)
                .await;
        });
        Ok(AnthropicOutcome::Stream(rx))
    }

    async fn run_anthropic_stream(
        &self,
        tx: mpsc::Sender<Bytes>,
        mapped_model: String,
        template: InternalGenerateContentRequest,
        session_key: Option<String>,
        request_type: String,
        requested_model: Model,
    ) {
        let message_id = format!("msg_{}", uuid::Uuid::new_v4());
        let mut state = StreamingState::new(message_id, requested_model);

        match self
            .select_and_stream(Protocol::Anthropic, &mapped_model, &template, session_key, &request_type)
            .await
        {
            Ok(body) => {
                let mut decoder = GeminiFrameDecoder::new();
                let mut last_finish = None;
                let mut last_usage = None;
                let mut stream = body.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let Ok(chunk) = chunk else { break };
                    for frame in decoder.push_bytes(&chunk) {
                        if !emit_claude_frame(&mut state, frame, &tx, &mut last_finish, &mut last_usage).await {
                            return;
                        }
                    }
                }
                for frame in decoder.finish() {
                    if !emit_claude_frame(&mut state, frame, &tx, &mut last_finish, &mut last_usage).await {
                        return;
                    }
                }
                for event in state.finish(last_finish, last_usage) {
                    if send_anthropic_sse(&tx, &event).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let event = StreamEvent::Error {
                    error: StreamErrorPayload {
                        error_type: "overloaded_error".to_string(),
                        message: err.message(),
                    },
                };
                let _ = send_anthropic_sse(&tx, &event).await;
            }
        }
    }

    // ---- Gemini-native surface ---------------------------------------------

    pub async fn handle_gemini_generate_content(
        &self,
        model: &str,
        body: GenerateContentRequestBody,
    ) -> Result<GenerateContentResponse, ProxyError> {
        let config = self.config.load_full();
        let mapped_model = resolve_model_route(model, &config.custom_mapping, &config.anthropic_mapping);
        let template = gemini_to_internal_gemini(
            mapped_model.clone(),
            body,
            String::new(),
            String::new(),
            config.request_user_agent.clone(),
        );
        let request_type = request_type_for_model(&mapped_model);
        self.select_and_generate(Protocol::Gemini, &mapped_model, &template, None, request_type)
            .await
            .map_err(|err| to_proxy_error(&err, Protocol::Gemini))
    }

    pub async fn handle_gemini_stream_generate_content(
        &self,
        model: &str,
        body: GenerateContentRequestBody,
    ) -> Result<mpsc::Receiver<Bytes>, ProxyError> {
        let config = self.config.load_full();
        let mapped_model = resolve_model_route(model, &config.custom_mapping, &config.anthropic_mapping);
        let template = gemini_to_internal_gemini(
            mapped_model.clone(),
            body,
            String::new(),
            String::new(),
            config.request_user_agent.clone(),
        );
        let request_type = request_type_for_model(&mapped_model).to_string();

        let upstream_body = self
            .select_and_stream(Protocol::Gemini, &mapped_model, &template, None, &request_type)
            .await
            .map_err(|err| to_proxy_error(&err, Protocol::Gemini))?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut decoder = GeminiFrameDecoder::new();
            let mut stream = upstream_body.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                for frame in decoder.push_bytes(&chunk) {
                    let Ok(frame) = frame else { continue };
                    let Ok(encoded) = sse_json_frame(&frame) else { continue };
                    if tx.send(Bytes::from(encoded)).await.is_err() {
                        return;
                    }
                }
            }
            for frame in decoder.finish() {
                let Ok(frame) = frame else { continue };
                let Ok(encoded) = sse_json_frame(&frame) else { continue };
                if tx.send(Bytes::from(encoded)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    // ---- shared retry core --------------------------------------------------

    /// `spec.md` §4.6 retry loop: up to [`MAX_ATTEMPTS`] accounts, with the
    /// project-context and (Anthropic-only) quota-downgrade recoveries tried
    /// inline against the same account before the loop advances.
    async fn select_and_generate(
        &self,
        protocol: Protocol,
        model: &str,
        template: &InternalGenerateContentRequest,
        session_key: Option<String>,
        request_type: &str,
    ) -> Result<GenerateContentResponse, GatewayError> {
        let mut excluded: Vec<String> = Vec::new();
        let mut last_err = GatewayError::Fatal("no accounts configured".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            let opts = SelectOptions {
                session_key: session_key.clone(),
                exclude_account_ids: excluded.clone(),
            };
            let Some(account) = self.token_pool.select_next(&opts).await else {
                return Err(GatewayError::Fatal("no available accounts".to_string()));
            };

            match self.call_with_empty_fallback(&account, model, template, request_type).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if let GatewayError::ProjectContext(_) = &err {
                        match self.call_once(&account, model, template, request_type, Some("")).await {
                            Ok(response) => return Ok(response),
                            Err(inline_err) => {
                                last_err = inline_err;
                                excluded.push(account.id.clone());
                                self.sleep_backoff(attempt).await;
                                continue;
                            }
                        }
                    }

                    if protocol == Protocol::Anthropic && is_quota_exhausted_message(&err.message()) {
                        match self
                            .call_once(&account, QUOTA_DOWNGRADE_MODEL, template, request_type, None)
                            .await
                        {
                            Ok(response) => return Ok(response),
                            Err(inline_err) => {
                                last_err = inline_err;
                                excluded.push(account.id.clone());
                                self.sleep_backoff(attempt).await;
                                continue;
                            }
                        }
                    }

                    match &err {
                        GatewayError::RateLimited(_) => self.token_pool.mark_rate_limited(&account.id).await,
                        GatewayError::Forbidden(_) => self.token_pool.mark_forbidden(&account.id).await,
                        _ => {}
                    }

                    let retryable = err.is_retryable();
                    last_err = err;
                    excluded.push(account.id.clone());
                    if !retryable {
                        return Err(last_err);
                    }
                    self.sleep_backoff(attempt).await;
                }
            }
        }

        Err(last_err)
    }

    /// Streaming counterpart: account rotation on transient/rate-limited/
    /// forbidden errors, without the inline project-context/quota-downgrade
    /// recoveries (those rebuild the unary body; a half-open stream can't be
    /// cleanly replayed into them).
    async fn select_and_stream(
        &self,
        _protocol: Protocol,
        model: &str,
        template: &InternalGenerateContentRequest,
        session_key: Option<String>,
        request_type: &str,
    ) -> Result<wreq::Response, GatewayError> {
        let mut excluded: Vec<String> = Vec::new();
        let mut last_err = GatewayError::Fatal("no accounts configured".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            let opts = SelectOptions {
                session_key: session_key.clone(),
                exclude_account_ids: excluded.clone(),
            };
            let Some(account) = self.token_pool.select_next(&opts).await else {
                return Err(GatewayError::Fatal("no available accounts".to_string()));
            };

            let project = self.resolved_project_id(&account).await;
            let mut req = template.clone();
            req.model = model.to_string();
            req.project = project;
            req.request_id = uuid::Uuid::new_v4().to_string();
            let headers = request_headers(model, request_type);

            match self
                .upstream
                .stream_generate_content(&account.token.access_token, &req, &headers)
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    match &err {
                        GatewayError::RateLimited(_) => self.token_pool.mark_rate_limited(&account.id).await,
                        GatewayError::Forbidden(_) => self.token_pool.mark_forbidden(&account.id).await,
                        _ => {}
                    }
                    let retryable = err.is_retryable();
                    last_err = err;
                    excluded.push(account.id.clone());
                    if !retryable {
                        return Err(last_err);
                    }
                    self.sleep_backoff(attempt).await;
                }
            }
        }

        Err(last_err)
    }

    async fn call_with_empty_fallback(
        &self,
        account: &Account,
        model: &str,
        template: &InternalGenerateContentRequest,
        request_type: &str,
    ) -> Result<GenerateContentResponse, GatewayError> {
        let response = self.call_once(account, model, template, request_type, None).await?;
        if !response.candidates.is_empty() {
            return Ok(response);
        }

        tracing::warn!(account = %account.id, "empty unary response, retrying as a stream to accumulate parts");
        let streamed = self.call_stream_and_accumulate(account, model, template, request_type).await?;
        if streamed.candidates.is_empty() {
            return Err(GatewayError::EmptyResponseStream);
        }
        Ok(streamed)
    }

    async fn call_once(
        &self,
        account: &Account,
        model: &str,
        template: &InternalGenerateContentRequest,
        request_type: &str,
        project_override: Option<&str>,
    ) -> Result<GenerateContentResponse, GatewayError> {
        let project = match project_override {
            Some(p) => p.to_string(),
            None => self.resolved_project_id(account).await,
        };
        let mut req = template.clone();
        req.model = model.to_string();
        req.project = project;
        req.request_id = uuid::Uuid::new_v4().to_string();
        let headers = request_headers(model, request_type);

        let value = self
            .upstream
            .generate_content(&account.token.access_token, &req, &headers)
            .await?;
        parse_generate_content_response(value)
    }

    async fn call_stream_and_accumulate(
        &self,
        account: &Account,
        model: &str,
        template: &InternalGenerateContentRequest,
        request_type: &str,
    ) -> Result<GenerateContentResponse, GatewayError> {
        let project = self.resolved_project_id(account).await;
        let mut req = template.clone();
        req.model = model.to_string();
        req.project = project;
        req.request_id = uuid::Uuid::new_v4().to_string();
        let headers = request_headers(model, request_type);

        let resp = self
            .upstream
            .stream_generate_content(&account.token.access_token, &req, &headers)
            .await?;

        let mut decoder = GeminiFrameDecoder::new();
        let mut frames = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GatewayError::Transient(e.to_string()))?;
            frames.extend(decoder.push_bytes(&chunk).into_iter().filter_map(Result::ok));
        }
        frames.extend(decoder.finish().into_iter().filter_map(Result::ok));
        Ok(merge_frames(frames))
    }

    /// `SPEC_FULL.md` §B supplement: when an account's sanitized `project_id`
    /// is empty, probe the upstream for one instead of sending an empty
    /// project on every call.
    async fn resolved_project_id(&self, account: &Account) -> String {
        let sanitized = account.token.sanitized_project_id();
        if !sanitized.is_empty() {
            return sanitized;
        }
        match self.upstream.detect_project_id(&account.token.access_token).await {
            Ok(Some(project)) => project,
            _ => String::new(),
        }
    }

    async fn sleep_backoff(&self, attempt: u32) {
        tokio::time::sleep(calculate_retry_delay(attempt)).await;
    }
}

fn text_prompt_request(model: String, prompt: String) -> CreateMessageRequest {
    blocks_request(model, vec![ContentBlockParam::Text(TextBlockParam { text: prompt })])
}

fn blocks_request(model: String, blocks: Vec<ContentBlockParam>) -> CreateMessageRequest {
    CreateMessageRequest {
        model: Model::Custom(model),
        messages: vec![MessageParam {
            role: MessageRole::User,
            content: MessageContent::Blocks(blocks),
        }],
        system: None,
        max_tokens: 4096,
        temperature: None,
        top_p: None,
        top_k: None,
        stop_sequences: None,
        tools: None,
        tool_choice: None,
        thinking: None,
        stream: false,
        metadata: None,
    }
}

fn image_block(mime_type: String, bytes: &[u8]) -> ContentBlockParam {
    use base64::Engine;
    ContentBlockParam::Image(cloudgate_protocol::claude::ImageBlockParam {
        source: cloudgate_protocol::claude::ImageSource::Base64 {
            media_type: mime_type,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        },
    })
}

fn parse_generate_content_response(value: JsonValue) -> Result<GenerateContentResponse, GatewayError> {
    serde_json::from_value(value).map_err(|e| GatewayError::Fatal(e.to_string()))
}

/// `spec.md` §4.6 "calculateRetryDelay": exponential backoff with jitter.
fn calculate_retry_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_millis()) as u64
        % 100;
    Duration::from_millis(base + jitter)
}

/// Per-call upstream request headers: the `requesttype` classification
/// (`agent`/`image_gen`) the donor sends as a header rather than a body
/// field (`examples/dfft546-gproxy/crates/gproxy-provider-impl/src/providers/antigravity/mod.rs`),
/// plus (`spec.md` §4.6 "Model-specific headers") `anthropic-beta` for
/// Claude-family models regardless of which surface they arrived on. The
/// body's own `requestType` stays `"generate-content"` as `spec.md` §4.3
/// mandates and is never touched here.
fn request_headers(model: &str, request_type: &str) -> Vec<(String, String)> {
    let mut headers = vec![("requesttype".to_string(), request_type.to_string())];
    if model.to_ascii_lowercase().contains("claude") {
        headers.push(("anthropic-beta".to_string(), CLAUDE_ANTHROPIC_BETA.to_string()));
    }
    headers
}

/// Grounded on the `antigravity` provider's `request_type_for_model`: image
/// models are tagged `image_gen`, everything else `agent`.
fn request_type_for_model(model: &str) -> &'static str {
    if model.to_ascii_lowercase().contains("image") {
        "image_gen"
    } else {
        "agent"
    }
}

/// `spec.md` §4.6 "Session-key derivation": `openai:<...>` from
/// `session_id`/`sessionId`/`user`/`user_id`/`userId`, falling back to no
/// session key when none is present or non-string.
fn extract_openai_session_key(request: &ChatCompletionRequest) -> Option<String> {
    if let Some(session_id) = &request.session_id {
        return Some(format!("openai:{session_id}"));
    }
    if let Some(user) = &request.user {
        return Some(format!("openai:{user}"));
    }
    let extra = request.extra.as_ref()?;
    for key in ["session_id", "sessionId", "user_id", "userId"] {
        if let Some(value) = extra.get(key).and_then(|v| v.as_str()) {
            return Some(format!("openai:{value}"));
        }
    }
    None
}

/// `spec.md` §4.6 "Session-key derivation": `anthropic:<...>` from
/// `metadata.user_id`/`metadata.session_id`.
fn extract_anthropic_session_key(request: &CreateMessageRequest) -> Option<String> {
    let metadata = request.metadata.as_ref()?;
    if let Some(session_id) = &metadata.session_id {
        return Some(format!("anthropic:{session_id}"));
    }
    metadata.user_id.as_ref().map(|id| format!("anthropic:{id}"))
}

async fn send_sse<T: serde::Serialize>(tx: &mpsc::Sender<Bytes>, value: &T) -> Result<(), ()> {
    match sse_json_frame(value) {
        Ok(frame) => tx.send(Bytes::from(frame)).await.map_err(|_| ()),
        Err(_) => Err(()),
    }
}

async fn send_anthropic_sse(tx: &mpsc::Sender<Bytes>, event: &StreamEvent) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    let frame = format!("event: {}\ndata: {}\n\n", event.event_name(), json);
    tx.send(Bytes::from(frame)).await.map_err(|_| ())
}

/// `spec.md` §4.5: a single malformed frame emits a recoverable error event
/// and resets, rather than tearing down the whole stream.
async fn emit_claude_frame(
    state: &mut StreamingState,
    frame: cloudgate_transform::DecodedFrame,
    tx: &mpsc::Sender<Bytes>,
    last_finish: &mut Option<cloudgate_protocol::gemini::FinishReason>,
    last_usage: &mut Option<cloudgate_protocol::gemini::UsageMetadata>,
) -> bool {
    let frame = match frame {
        Ok(frame) => frame,
        Err(()) => {
            let event = state.recover_from_parse_error();
            return send_anthropic_sse(tx, &event).await.is_ok();
        }
    };
    let Some(candidate) = frame.candidates.first() else {
        return true;
    };
    if let Some(usage) = &frame.usage_metadata {
        *last_usage = Some(usage.clone());
    }
    if candidate.finish_reason.is_some() {
        *last_finish = candidate.finish_reason;
    }

    let mut processor = state.processor();
    for part in &candidate.content.parts {
        for event in processor.process(part) {
            if send_anthropic_sse(tx, &event).await.is_err() {
                return false;
            }
        }
    }
    true
}

/// Concatenates every decoded frame's first candidate into one response
/// (`spec.md` §4.6 "empty-response-stream fallback" accumulation step).
fn merge_frames(frames: Vec<GenerateContentResponse>) -> GenerateContentResponse {
    let mut merged_parts = Vec::new();
    let mut finish_reason = None;
    let mut usage_metadata = None;
    let mut model_version = None;
    let mut response_id = None;

    for frame in frames {
        if let Some(candidate) = frame.candidates.into_iter().next() {
            merged_parts.extend(candidate.content.parts);
            if candidate.finish_reason.is_some() {
                finish_reason = candidate.finish_reason;
            }
        }
        if frame.usage_metadata.is_some() {
            usage_metadata = frame.usage_metadata;
        }
        if frame.model_version.is_some() {
            model_version = frame.model_version;
        }
        if frame.response_id.is_some() {
            response_id = frame.response_id;
        }
    }

    if merged_parts.is_empty() {
        return GenerateContentResponse::empty();
    }

    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content {
                parts: merged_parts,
                role: None,
            },
            finish_reason,
            token_count: None,
            index: Some(0),
        }],
        usage_metadata,
        model_version,
        response_id,
    }
}

/// `spec.md` §4.7: render the final exhausted error in the client's own
/// protocol shape.
fn to_proxy_error(err: &GatewayError, protocol: Protocol) -> ProxyError {
    let status = crate::classify::error_to_http_status(&err.message());
    let body = match protocol {
        Protocol::OpenAi => serde_json::json!({
            "error": {
                "message": err.message(),
                "type": "upstream_error",
                "param": JsonValue::Null,
                "code": JsonValue::Null,
            }
        }),
        Protocol::Anthropic => serde_json::json!({
            "type": "error",
            "error": {
                "type": "api_error",
                "message": err.message(),
            }
        }),
        Protocol::Gemini => serde_json::json!({
            "error": {
                "code": status,
                "message": err.message(),
                "status": "UNAVAILABLE",
            }
        }),
    };
    ProxyError::new(status, body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_session_key_prefers_explicit_session_id() {
        let request = ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: Vec::new(),
            stream: false,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            user: Some("user-1".to_string()),
            session_id: Some("sess-1".to_string()),
            extra: None,
        };
        assert_eq!(extract_openai_session_key(&request).as_deref(), Some("openai:sess-1"));
    }

    #[test]
    fn request_type_detects_image_models() {
        assert_eq!(request_type_for_model("gemini-3-pro-image-4k"), "image_gen");
        assert_eq!(request_type_for_model("gemini-2.5-flash"), "agent");
    }

    #[test]
    fn claude_models_get_anthropic_beta_header() {
        let headers = request_headers("claude-sonnet-4-5", "agent");
        assert!(headers.iter().any(|(k, v)| k == "anthropic-beta" && v == CLAUDE_ANTHROPIC_BETA));
        let headers = request_headers("gemini-2.5-pro", "agent");
        assert!(!headers.iter().any(|(k, _)| k == "anthropic-beta"));
    }

    #[test]
    fn every_request_carries_a_requesttype_header() {
        let headers = request_headers("gemini-2.5-pro", "image_gen");
        assert_eq!(headers[0], ("requesttype".to_string(), "image_gen".to_string()));
    }

    #[test]
    fn merge_frames_concatenates_parts_and_keeps_last_finish_reason() {
        use cloudgate_protocol::gemini::{FinishReason, Part};
        let frame1 = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    parts: vec![Part {
                        text: Some("hello ".to_string()),
                        ..Default::default()
                    }],
                    role: None,
                },
                finish_reason: None,
                token_count: None,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: None,
            response_id: None,
        };
        let frame2 = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    parts: vec![Part {
                        text: Some("world".to_string()),
                        ..Default::default()
                    }],
                    role: None,
                },
                finish_reason: Some(FinishReason::Stop),
                token_count: None,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: None,
            response_id: None,
        };

        let merged = merge_frames(vec![frame1, frame2]);
        assert_eq!(merged.candidates[0].content.parts.len(), 2);
        assert_eq!(merged.candidates[0].finish_reason, Some(FinishReason::Stop));
    }
}
