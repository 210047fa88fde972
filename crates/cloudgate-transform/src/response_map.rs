use cloudgate_protocol::claude::{
    ContentBlockParam, CreateMessageResponse, MessageRole as ClaudeRole, MessageType, Model, StopReason,
    TextBlockParam, ToolUseBlockParam, Usage as ClaudeUsage,
};
use cloudgate_protocol::gemini::{Candidate, FinishReason as GeminiFinishReason, GenerateContentResponse};
use cloudgate_protocol::openai::{
    AudioTranscriptionResponse, ChatCompletionResponse, Choice, CompletionChoice, CompletionsResponse,
    CreateResponseResponse, FinishReason as OpenAiFinishReason, FunctionCallPayload, ImageDataItem,
    ImageGenerationResponse, ResponseMessage, ResponseOutputItem, ResponseOutputText, Role, ToolCall,
    Usage as OpenAiUsage,
};
use serde_json::Value as JsonValue;

/// `spec.md` §4.4 Gemini-internal → Claude.
pub fn internal_gemini_to_claude(
    response: GenerateContentResponse,
    requested_model: Model,
    response_id: String,
) -> CreateMessageResponse {
    let candidate = response.candidates.into_iter().next();
    let (content, stop_reason) = match candidate {
        Some(candidate) => (
            map_parts_to_blocks(&candidate),
            map_gemini_finish_to_claude(candidate.finish_reason),
        ),
        None => (Vec::new(), None),
    };

    let usage = response
        .usage_metadata
        .map(|usage| ClaudeUsage {
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
            cache_creation_input_tokens: None,
            cache_read_input_tokens: usage.cached_content_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    CreateMessageResponse {
        id: response_id,
        message_type: MessageType::Message,
        role: ClaudeRole::Assistant,
        content,
        model: requested_model,
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

fn map_parts_to_blocks(candidate: &Candidate) -> Vec<ContentBlockParam> {
    candidate
        .content
        .parts
        .iter()
        .filter_map(|part| {
            if let Some(call) = &part.function_call {
                return Some(ContentBlockParam::ToolUse(ToolUseBlockParam {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4())),
                    name: call.name.clone(),
                    input: call
                        .args
                        .clone()
                        .and_then(|v| v.as_object().cloned())
                        .unwrap_or_default(),
                }));
            }
            if let Some(inline) = &part.inline_data {
                return Some(ContentBlockParam::Image(cloudgate_protocol::claude::ImageBlockParam {
                    source: cloudgate_protocol::claude::ImageSource::Base64 {
                        media_type: inline.mime_type.clone(),
                        data: inline.data.clone(),
                    },
                }));
            }
            part.text
                .clone()
                .map(|text| ContentBlockParam::Text(TextBlockParam { text }))
        })
        .collect()
}

fn map_gemini_finish_to_claude(reason: Option<GeminiFinishReason>) -> Option<StopReason> {
    reason.map(|reason| match reason {
        GeminiFinishReason::Stop => StopReason::EndTurn,
        GeminiFinishReason::MaxTokens => StopReason::MaxTokens,
        GeminiFinishReason::Safety | GeminiFinishReason::Recitation => StopReason::Refusal,
        GeminiFinishReason::Other => StopReason::EndTurn,
    })
}

/// `spec.md` §4.4 Claude → OpenAI: text/thinking blocks concatenate,
/// `tool_use` becomes `tool_calls`, usage and finish reasons map directly.
pub fn claude_to_openai(
    response: CreateMessageResponse,
    response_id: String,
    created: i64,
) -> ChatCompletionResponse {
    let model = response.model.as_str();
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in &response.content {
        match block {
            ContentBlockParam::Text(t) => text.push_str(&t.text),
            ContentBlockParam::Thinking(t) => reasoning.push_str(&t.thinking),
            ContentBlockParam::ToolUse(tool_use) => tool_calls.push(ToolCall {
                id: tool_use.id.clone(),
                call_type: "function".to_string(),
                function: FunctionCallPayload {
                    name: tool_use.name.clone(),
                    arguments: serialize_tool_input(&tool_use.input),
                },
            }),
            ContentBlockParam::Image(image) => {
                if let cloudgate_protocol::claude::ImageSource::Base64 { media_type, data } = &image.source {
                    text.push_str(&format!("\n\n![Generated Image](data:{media_type};base64,{data})\n\n"));
                }
            }
            ContentBlockParam::ToolResult(_) => {}
        }
    }

    let finish_reason = response.stop_reason.map(map_claude_finish_to_openai);

    let message = ResponseMessage {
        role: Role::Assistant,
        content: if text.is_empty() { None } else { Some(text) },
        reasoning_content: if reasoning.is_empty() {
            None
        } else {
            Some(reasoning)
        },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
    };

    let prompt_tokens = response.usage.input_tokens;
    let completion_tokens = response.usage.output_tokens;

    ChatCompletionResponse {
        id: response_id,
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason,
        }],
        usage: OpenAiUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        },
    }
}

fn serialize_tool_input(input: &cloudgate_protocol::claude::JsonObject) -> String {
    serde_json::to_string(&JsonValue::Object(input.clone())).unwrap_or_else(|_| "{}".to_string())
}

fn map_claude_finish_to_openai(reason: StopReason) -> OpenAiFinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence | StopReason::Refusal => OpenAiFinishReason::Stop,
        StopReason::MaxTokens => OpenAiFinishReason::Length,
        StopReason::ToolUse => OpenAiFinishReason::ToolCalls,
    }
}

/// `spec.md` §4.4 "Gemini finish-reason → OpenAI" (used by the streaming path too).
pub fn map_gemini_finish_to_openai(reason: GeminiFinishReason) -> OpenAiFinishReason {
    match reason {
        GeminiFinishReason::Stop => OpenAiFinishReason::Stop,
        GeminiFinishReason::MaxTokens => OpenAiFinishReason::Length,
        GeminiFinishReason::Safety | GeminiFinishReason::Recitation => OpenAiFinishReason::ContentFilter,
        GeminiFinishReason::Other => OpenAiFinishReason::Stop,
    }
}

/// `spec.md` §4.7 `POST /v1/completions`: the aggregated Claude text becomes
/// the single `text_completion` choice.
pub fn claude_to_completions_response(
    response: CreateMessageResponse,
    response_id: String,
    created: i64,
) -> CompletionsResponse {
    let text = response.text();
    let finish_reason = response.stop_reason.map(|reason| match map_claude_finish_to_openai(reason) {
        OpenAiFinishReason::Stop => "stop".to_string(),
        OpenAiFinishReason::Length => "length".to_string(),
        OpenAiFinishReason::ToolCalls => "stop".to_string(),
        OpenAiFinishReason::ContentFilter => "content_filter".to_string(),
    });

    CompletionsResponse {
        id: response_id,
        object: CompletionsResponse::object_name().to_string(),
        created,
        model: response.model.as_str(),
        choices: vec![CompletionChoice {
            text,
            index: 0,
            finish_reason,
        }],
        usage: OpenAiUsage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens.saturating_add(response.usage.output_tokens),
        },
    }
}

/// `spec.md` §4.7 `POST /v1/responses`: text blocks become a message output
/// item, `tool_use` blocks become `function_call` items.
pub fn claude_to_responses_response(
    response: CreateMessageResponse,
    response_id: String,
    created: i64,
) -> CreateResponseResponse {
    let model = response.model.as_str();
    let mut output = Vec::new();
    let mut text = String::new();

    for block in &response.content {
        match block {
            ContentBlockParam::Text(t) => text.push_str(&t.text),
            ContentBlockParam::ToolUse(tool_use) => output.push(ResponseOutputItem::FunctionCall {
                id: format!("fc_{}", uuid::Uuid::new_v4()),
                call_id: tool_use.id.clone(),
                name: tool_use.name.clone(),
                arguments: serialize_tool_input(&tool_use.input),
            }),
            ContentBlockParam::Thinking(_)
            | ContentBlockParam::Image(_)
            | ContentBlockParam::ToolResult(_) => {}
        }
    }

    if !text.is_empty() {
        output.insert(
            0,
            ResponseOutputItem::Message {
                id: format!("msg_{}", uuid::Uuid::new_v4()),
                role: Role::Assistant,
                content: vec![ResponseOutputText {
                    content_type: "output_text".to_string(),
                    text,
                }],
            },
        );
    }

    CreateResponseResponse {
        id: response_id,
        object: "response".to_string(),
        created_at: created,
        model,
        status: "completed".to_string(),
        output,
        usage: OpenAiUsage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens.saturating_add(response.usage.output_tokens),
        },
    }
}

/// `spec.md` §4.7 `/v1/images/generations` and `/v1/images/edits`: the
/// upstream returns generated images as `inlineData` blocks (`spec.md` §4.5
/// "`inlineData` → ...![Generated Image]..."); this extracts those as
/// base64 image payloads instead of inlining them into message text.
pub fn claude_to_image_response(response: CreateMessageResponse, created: i64) -> ImageGenerationResponse {
    let data = response
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlockParam::Image(image) => match &image.source {
                cloudgate_protocol::claude::ImageSource::Base64 { data, .. } => Some(ImageDataItem {
                    b64_json: Some(data.clone()),
                    url: None,
                }),
                cloudgate_protocol::claude::ImageSource::Url { url } => Some(ImageDataItem {
                    b64_json: None,
                    url: Some(url.clone()),
                }),
            },
            _ => None,
        })
        .collect();

    ImageGenerationResponse { created, data }
}

/// `spec.md` §4.7 `/v1/audio/transcriptions`: the upstream's aggregated text
/// response *is* the transcript.
pub fn claude_to_transcription_response(response: CreateMessageResponse) -> AudioTranscriptionResponse {
    AudioTranscriptionResponse { text: response.text() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudgate_protocol::claude::{ImageBlockParam, ImageSource};

    #[test]
    fn claude_to_openai_aggregates_text_and_tool_calls() {
        let response = CreateMessageResponse {
            id: "msg_1".to_string(),
            message_type: MessageType::Message,
            role: ClaudeRole::Assistant,
            content: vec![
                ContentBlockParam::Text(TextBlockParam {
                    text: "hello".to_string(),
                }),
                ContentBlockParam::ToolUse(ToolUseBlockParam {
                    id: "tool_1".to_string(),
                    name: "search".to_string(),
                    input: serde_json::Map::new(),
                }),
                ContentBlockParam::Image(ImageBlockParam {
                    source: ImageSource::Url {
                        url: "https://example.com/x.png".to_string(),
                    },
                }),
            ],
            model: Model::Custom("claude-opus-4-5".to_string()),
            stop_reason: Some(StopReason::ToolUse),
            stop_sequence: None,
            usage: ClaudeUsage {
                input_tokens: 10,
                output_tokens: 5,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: 0,
            },
        };

        let openai = claude_to_openai(response, "chatcmpl-1".to_string(), 0);
        assert_eq!(openai.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(openai.choices[0].message.tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(openai.choices[0].finish_reason, Some(OpenAiFinishReason::ToolCalls));
        assert_eq!(openai.usage.total_tokens, 15);
    }

    #[test]
    fn image_response_extracts_base64_blocks_only() {
        let response = CreateMessageResponse {
            id: "msg_2".to_string(),
            message_type: MessageType::Message,
            role: ClaudeRole::Assistant,
            content: vec![
                ContentBlockParam::Image(ImageBlockParam {
                    source: ImageSource::Base64 {
                        media_type: "image/png".to_string(),
                        data: "Zm9v".to_string(),
                    },
                }),
                ContentBlockParam::Text(TextBlockParam {
                    text: "ignored".to_string(),
                }),
            ],
            model: Model::Custom("gemini-3-pro-image".to_string()),
            stop_reason: None,
            stop_sequence: None,
            usage: ClaudeUsage::default(),
        };

        let image = claude_to_image_response(response, 0);
        assert_eq!(image.data.len(), 1);
        assert_eq!(image.data[0].b64_json.as_deref(), Some("Zm9v"));
    }

    #[test]
    fn completions_response_uses_text_completion_shape() {
        let response = CreateMessageResponse {
            id: "msg_3".to_string(),
            message_type: MessageType::Message,
            role: ClaudeRole::Assistant,
            content: vec![ContentBlockParam::Text(TextBlockParam {
                text: "answer".to_string(),
            })],
            model: Model::Custom("gemini-2.5-pro".to_string()),
            stop_reason: Some(StopReason::EndTurn),
            stop_sequence: None,
            usage: ClaudeUsage {
                input_tokens: 3,
                output_tokens: 1,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: 0,
            },
        };

        let completion = claude_to_completions_response(response, "cmpl-1".to_string(), 0);
        assert_eq!(completion.object, "text_completion");
        assert_eq!(completion.choices[0].text, "answer");
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("stop"));
    }
}
