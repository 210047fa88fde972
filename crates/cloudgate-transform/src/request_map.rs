use cloudgate_protocol::claude::{
    ContentBlockParam, CreateMessageRequest, ImageBlockParam, ImageSource, Model, MessageContent,
    MessageParam, MessageRole, SystemParam, TextBlockParam, Tool as ClaudeTool, ToolInputSchema,
    ToolResultBlockParam, ToolResultContent, ToolUseBlockParam,
};
use cloudgate_protocol::gemini::{
    Blob, Content, ContentRole, FileData, FunctionCall, FunctionDeclaration, GenerateContentRequestBody,
    GenerationConfig, InternalGenerateContentRequest, Part, Tool as GeminiTool,
};
use cloudgate_protocol::openai::{
    ChatCompletionRequest, ChatMessage, CompletionsRequest, ContentPart, CreateResponseRequest,
    FunctionCallPayload, MessageContent as OpenAiMessageContent, ResponseInputItem, Role, ToolCall,
};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// `spec.md` §4.3 OpenAI → Claude: system messages concatenated, `tool`
/// messages become a `tool_result` user block, assistant `tool_calls` become
/// `tool_use` blocks, `image_url` parts decode data-URIs or fall back to a
/// textual note, tools drop the `function` wrapper, metadata merges
/// `request.extra` with `{source: "openai"}`.
pub fn openai_to_claude(request: ChatCompletionRequest) -> CreateMessageRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for message in request.messages {
        match message.role {
            Role::System => {
                if let Some(text) = message_text(&message.content) {
                    system_parts.push(text);
                }
            }
            Role::Tool => {
                let tool_use_id = message
                    .tool_call_id
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4()));
                let text = message_text(&message.content).unwrap_or_default();
                messages.push(MessageParam {
                    role: MessageRole::User,
                    content: MessageContent::Blocks(vec![ContentBlockParam::ToolResult(
                        ToolResultBlockParam {
                            tool_use_id,
                            content: Some(ToolResultContent::Text(text)),
                            is_error: None,
                        },
                    )]),
                });
            }
            Role::User => {
                messages.push(MessageParam {
                    role: MessageRole::User,
                    content: map_openai_content(message.content),
                });
            }
            Role::Assistant => {
                let mut blocks = match map_openai_content(message.content) {
                    MessageContent::Text(text) if !text.is_empty() => {
                        vec![ContentBlockParam::Text(TextBlockParam { text })]
                    }
                    MessageContent::Blocks(blocks) => blocks,
                    _ => Vec::new(),
                };
                if let Some(tool_calls) = message.tool_calls {
                    blocks.extend(tool_calls.into_iter().map(map_tool_call_to_use));
                }
                messages.push(MessageParam {
                    role: MessageRole::Assistant,
                    content: MessageContent::Blocks(blocks),
                });
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(SystemParam::Text(system_parts.join("\n")))
    };

    CreateMessageRequest {
        model: Model::Custom(request.model),
        messages,
        system,
        max_tokens: request.max_tokens.unwrap_or(4096),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: request.stop,
        tools: request.tools.map(|tools| tools.into_iter().map(map_openai_tool).collect()),
        tool_choice: None,
        thinking: None,
        stream: request.stream,
        metadata: None,
    }
}

/// `spec.md` §4.7 `POST /v1/completions`: the prompt (joined if an array)
/// becomes a single user message; everything else maps like chat completions.
pub fn completions_to_claude(request: CompletionsRequest) -> CreateMessageRequest {
    let chat = ChatCompletionRequest {
        model: request.model,
        messages: vec![ChatMessage {
            role: Role::User,
            content: Some(OpenAiMessageContent::Text(request.prompt.joined())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }],
        stream: request.stream,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: None,
        stop: request.stop,
        tools: None,
        tool_choice: None,
        user: None,
        session_id: None,
        extra: None,
    };
    openai_to_claude(chat)
}

/// `spec.md` §4.7 `POST /v1/responses`: normalizes the `input` array into
/// chat messages, reconstructing function-call assistant turns as `tool_use`
/// blocks and tool-result turns as `tool_result` blocks keyed by `call_id`.
pub fn responses_to_claude(request: CreateResponseRequest) -> CreateMessageRequest {
    let mut messages = Vec::new();
    let mut system_parts = Vec::new();

    if let Some(instructions) = request.instructions {
        system_parts.push(instructions);
    }

    for item in request.input {
        match item {
            ResponseInputItem::Message { role, content } => match role {
                Role::System => {
                    if let Some(text) = message_text(&Some(content)) {
                        system_parts.push(text);
                    }
                }
                Role::User => messages.push(MessageParam {
                    role: MessageRole::User,
                    content: map_openai_content(Some(content)),
                }),
                Role::Assistant => messages.push(MessageParam {
                    role: MessageRole::Assistant,
                    content: map_openai_content(Some(content)),
                }),
                Role::Tool => {}
            },
            ResponseInputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let input: JsonMap<String, JsonValue> =
                    serde_json::from_str(&arguments).unwrap_or_default();
                messages.push(MessageParam {
                    role: MessageRole::Assistant,
                    content: MessageContent::Blocks(vec![ContentBlockParam::ToolUse(ToolUseBlockParam {
                        id: call_id,
                        name,
                        input,
                    })]),
                });
            }
            ResponseInputItem::FunctionCallOutput { call_id, output } => {
                messages.push(MessageParam {
                    role: MessageRole::User,
                    content: MessageContent::Blocks(vec![ContentBlockParam::ToolResult(
                        ToolResultBlockParam {
                            tool_use_id: call_id,
                            content: Some(ToolResultContent::Text(output)),
                            is_error: None,
                        },
                    )]),
                });
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(SystemParam::Text(system_parts.join("\n")))
    };

    CreateMessageRequest {
        model: Model::Custom(request.model),
        messages,
        system,
        max_tokens: request.max_output_tokens.unwrap_or(4096),
        temperature: None,
        top_p: None,
        top_k: None,
        stop_sequences: None,
        tools: request.tools.map(|tools| tools.into_iter().map(map_openai_tool).collect()),
        tool_choice: None,
        thinking: None,
        stream: request.stream,
        metadata: None,
    }
}

fn message_text(content: &Option<OpenAiMessageContent>) -> Option<String> {
    match content {
        Some(OpenAiMessageContent::Text(text)) => Some(text.clone()),
        Some(OpenAiMessageContent::Parts(parts)) => {
            let text = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("");
            Some(text)
        }
        None => None,
    }
}

fn map_openai_content(content: Option<OpenAiMessageContent>) -> MessageContent {
    match content {
        None => MessageContent::Text(String::new()),
        Some(OpenAiMessageContent::Text(text)) => MessageContent::Text(text),
        Some(OpenAiMessageContent::Parts(parts)) => {
            MessageContent::Blocks(parts.into_iter().map(map_openai_part).collect())
        }
    }
}

fn map_openai_part(part: ContentPart) -> ContentBlockParam {
    match part {
        ContentPart::Text { text } => ContentBlockParam::Text(TextBlockParam { text }),
        ContentPart::ImageUrl { image_url } => match parse_data_uri(&image_url.url) {
            Some((media_type, data)) => ContentBlockParam::Image(ImageBlockParam {
                source: ImageSource::Base64 { media_type, data },
            }),
            None => ContentBlockParam::Text(TextBlockParam {
                text: format!("[image_url] {}", image_url.url),
            }),
        },
    }
}

fn parse_data_uri(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(",")?;
    let media_type = header.strip_suffix(";base64")?;
    Some((media_type.to_string(), data.to_string()))
}

fn map_tool_call_to_use(call: ToolCall) -> ContentBlockParam {
    let input: JsonMap<String, JsonValue> = serde_json::from_str(&call.function.arguments)
        .unwrap_or_default();
    ContentBlockParam::ToolUse(ToolUseBlockParam {
        id: call.id,
        name: call.function.name,
        input,
    })
}

fn map_openai_tool(tool: cloudgate_protocol::openai::ToolDef) -> ClaudeTool {
    let function = tool.function;
    let properties = function
        .parameters
        .as_ref()
        .and_then(|p| p.get("properties"))
        .and_then(|v| v.as_object())
        .cloned();
    let required = function
        .parameters
        .as_ref()
        .and_then(|p| p.get("required"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });

    ClaudeTool {
        name: function.name,
        description: function.description,
        input_schema: ToolInputSchema {
            schema_type: "object".to_string(),
            properties,
            required,
        },
    }
}

/// `spec.md` §4.3 Claude → Gemini-internal: `systemInstruction.parts`
/// includes only text parts; `sessionId` is never sent upstream.
pub fn claude_to_internal_gemini(
    request: CreateMessageRequest,
    model: String,
    project_id: String,
    request_id: String,
    user_agent: String,
) -> InternalGenerateContentRequest {
    let contents = map_claude_messages_to_contents(&request.messages);
    let system_instruction = map_claude_system_to_content(request.system);
    let tools = map_claude_tools(request.tools);
    let generation_config = Some(GenerationConfig {
        stop_sequences: request.stop_sequences,
        max_output_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        response_mime_type: None,
        response_json_schema: None,
        thinking_config: None,
    });

    InternalGenerateContentRequest {
        project: project_id,
        model,
        request: GenerateContentRequestBody {
            contents,
            system_instruction,
            tools,
            tool_config: None,
            generation_config,
        },
        request_id,
        user_agent,
        request_type: "generate-content".to_string(),
    }
}

fn map_claude_system_to_content(system: Option<SystemParam>) -> Option<Content> {
    let text = match system? {
        SystemParam::Text(text) => text,
        SystemParam::Blocks(blocks) => blocks
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n"),
    };
    if text.is_empty() {
        return None;
    }
    Some(Content {
        parts: vec![Part {
            text: Some(text),
            ..Default::default()
        }],
        role: None,
    })
}

fn map_claude_messages_to_contents(messages: &[MessageParam]) -> Vec<Content> {
    messages
        .iter()
        .filter_map(|message| {
            let role = match message.role {
                MessageRole::User => ContentRole::User,
                MessageRole::Assistant => ContentRole::Model,
            };
            let parts = map_claude_content_to_parts(&message.content);
            if parts.is_empty() {
                None
            } else {
                Some(Content {
                    parts,
                    role: Some(role),
                })
            }
        })
        .collect()
}

fn map_claude_content_to_parts(content: &MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => vec![Part {
            text: Some(text.clone()),
            ..Default::default()
        }],
        MessageContent::Blocks(blocks) => blocks.iter().filter_map(map_claude_block_to_part).collect(),
    }
}

fn map_claude_block_to_part(block: &ContentBlockParam) -> Option<Part> {
    match block {
        ContentBlockParam::Text(text) => Some(Part {
            text: Some(text.text.clone()),
            ..Default::default()
        }),
        ContentBlockParam::Image(image) => match &image.source {
            ImageSource::Base64 { media_type, data } => Some(Part {
                inline_data: Some(Blob {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                }),
                ..Default::default()
            }),
            ImageSource::Url { url } => Some(Part {
                file_data: Some(FileData {
                    mime_type: None,
                    file_uri: url.clone(),
                }),
                ..Default::default()
            }),
        },
        ContentBlockParam::ToolUse(tool_use) => Some(Part {
            function_call: Some(FunctionCall {
                id: Some(tool_use.id.clone()),
                name: tool_use.name.clone(),
                args: Some(JsonValue::Object(tool_use.input.clone())),
            }),
            ..Default::default()
        }),
        ContentBlockParam::ToolResult(_) | ContentBlockParam::Thinking(_) => None,
    }
}

fn map_claude_tools(tools: Option<Vec<ClaudeTool>>) -> Option<Vec<GeminiTool>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    let declarations = tools
        .into_iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            parameters_json_schema: Some(schema_to_json(tool.input_schema)),
        })
        .collect();
    Some(vec![GeminiTool {
        function_declarations: Some(declarations),
        ..Default::default()
    }])
}

fn schema_to_json(schema: ToolInputSchema) -> JsonValue {
    let mut map = JsonMap::new();
    map.insert("type".to_string(), JsonValue::String(schema.schema_type));
    if let Some(properties) = schema.properties {
        map.insert("properties".to_string(), JsonValue::Object(properties));
    }
    if let Some(required) = schema.required {
        map.insert(
            "required".to_string(),
            JsonValue::Array(required.into_iter().map(JsonValue::String).collect()),
        );
    }
    JsonValue::Object(map)
}

/// `spec.md` §4.3 Gemini public → Gemini-internal: thin wrapper copying
/// `contents`/`generationConfig`/text-only `systemInstruction.parts`.
pub fn gemini_to_internal_gemini(
    model: String,
    mut body: GenerateContentRequestBody,
    project_id: String,
    request_id: String,
    user_agent: String,
) -> InternalGenerateContentRequest {
    if let Some(system) = body.system_instruction.as_mut() {
        system.parts.retain(|part| part.text.is_some());
    }

    InternalGenerateContentRequest {
        project: project_id,
        model,
        request: body,
        request_id,
        user_agent,
        request_type: "generate-content".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudgate_protocol::openai::Prompt;

    #[test]
    fn completions_joins_array_prompt_into_single_user_message() {
        let request = CompletionsRequest {
            model: "gpt-4".to_string(),
            prompt: Prompt::Many(vec!["line one".to_string(), "line two".to_string()]),
            stream: false,
            max_tokens: None,
            temperature: None,
            stop: None,
        };
        let claude = completions_to_claude(request);
        assert_eq!(claude.messages.len(), 1);
        match &claude.messages[0].content {
            MessageContent::Text(text) => assert_eq!(text, "line one\nline two"),
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[test]
    fn responses_reconstructs_function_call_and_result_turns() {
        let request = CreateResponseRequest {
            model: "gpt-4".to_string(),
            input: vec![
                ResponseInputItem::Message {
                    role: Role::User,
                    content: OpenAiMessageContent::Text("what's the weather".to_string()),
                },
                ResponseInputItem::FunctionCall {
                    call_id: "call_1".to_string(),
                    name: "get_weather".to_string(),
                    arguments: "{\"city\":\"nyc\"}".to_string(),
                },
                ResponseInputItem::FunctionCallOutput {
                    call_id: "call_1".to_string(),
                    output: "72F".to_string(),
                },
            ],
            stream: false,
            max_output_tokens: None,
            tools: None,
            tool_choice: None,
            instructions: None,
        };
        let claude = responses_to_claude(request);
        assert_eq!(claude.messages.len(), 3);
        match &claude.messages[1].content {
            MessageContent::Blocks(blocks) => {
                assert!(matches!(blocks[0], ContentBlockParam::ToolUse(_)));
            }
            other => panic!("expected blocks, got {other:?}"),
        }
        match &claude.messages[2].content {
            MessageContent::Blocks(blocks) => {
                assert!(matches!(blocks[0], ContentBlockParam::ToolResult(_)));
            }
            other => panic!("expected blocks, got {other:?}"),
        }
    }
}
