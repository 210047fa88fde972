use cloudgate_protocol::gemini::GenerateContentResponse;
use cloudgate_protocol::openai::{ChatCompletionChunk, ChunkChoice, Delta, FunctionCallPayload, Role, ToolCallDelta};
use cloudgate_protocol::sse::SseParser;

use crate::response_map::map_gemini_finish_to_openai;

/// Decodes the raw upstream SSE byte stream into one `GenerateContentResponse`
/// per `data:` frame (`spec.md` §4.5 "Input"). `[DONE]` sentinels and blank
/// frames are skipped silently; a frame whose `data:` payload fails to parse
/// as JSON comes back as `Err(())` so callers that must honor the "recoverable
/// error event, then resume" invariant (`spec.md` §4.5, the Anthropic-SSE
/// stream driver) can surface it — the orchestrator still treats a genuinely
/// empty decoded stream as `EmptyResponseStream`, not a parse failure.
#[derive(Default)]
pub struct GeminiFrameDecoder {
    sse: SseParser,
}

/// `Ok` for a successfully decoded frame, `Err(())` for one that failed to
/// parse as JSON (`spec.md` §4.5 "malformed frames").
pub type DecodedFrame = Result<GenerateContentResponse, ()>;

impl GeminiFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &bytes::Bytes) -> Vec<DecodedFrame> {
        self.sse.push_bytes(chunk).into_iter().filter_map(decode_event).collect()
    }

    pub fn finish(&mut self) -> Vec<DecodedFrame> {
        self.sse.finish().into_iter().filter_map(decode_event).collect()
    }
}

fn decode_event(event: cloudgate_protocol::sse::SseEvent) -> Option<DecodedFrame> {
    let data = event.data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(serde_json::from_str(data).map_err(|_| ()))
}

/// Stateful emitter turning decoded Gemini frames into OpenAI
/// `chat.completion.chunk` deltas (`spec.md` §4.5 "OpenAI-SSE output").
pub struct OpenAiStreamEmitter {
    id: String,
    model: String,
    created: i64,
    emitted_any: bool,
    next_tool_call_index: u32,
}

impl OpenAiStreamEmitter {
    pub fn new(id: String, model: String, created: i64) -> Self {
        Self {
            id,
            model,
            created,
            emitted_any: false,
            next_tool_call_index: 0,
        }
    }

    pub fn process_frame(&mut self, frame: &GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        let mut chunks = Vec::new();
        let Some(candidate) = frame.candidates.first() else {
            return chunks;
        };

        for part in &candidate.content.parts {
            if part.thought == Some(true) {
                if let Some(text) = &part.text {
                    chunks.push(self.delta_chunk(Delta {
                        reasoning_content: Some(text.clone()),
                        ..Default::default()
                    }));
                    self.emitted_any = true;
                }
                continue;
            }

            if let Some(call) = &part.function_call {
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", call.name, uuid::Uuid::new_v4()));
                let args = call
                    .args
                    .clone()
                    .map(|v| serde_json::to_string(&v).unwrap_or_else(|_| "{}".to_string()))
                    .unwrap_or_else(|| "{}".to_string());
                let index = self.next_tool_call_index;
                self.next_tool_call_index += 1;
                chunks.push(self.delta_chunk(Delta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: Some(id),
                        call_type: Some("function".to_string()),
                        function: Some(FunctionCallPayload {
                            name: call.name.clone(),
                            arguments: args,
                        }),
                    }]),
                    ..Default::default()
                }));
                self.emitted_any = true;
                continue;
            }

            if let Some(inline) = &part.inline_data {
                chunks.push(self.delta_chunk(Delta {
                    content: Some(format!(
                        "\n\n![Generated Image](data:{};base64,{})\n\n",
                        inline.mime_type, inline.data
                    )),
                    ..Default::default()
                }));
                self.emitted_any = true;
                continue;
            }

            if let Some(text) = &part.text {
                chunks.push(self.delta_chunk(Delta {
                    content: Some(text.clone()),
                    ..Default::default()
                }));
                self.emitted_any = true;
            }
        }

        if let Some(finish_reason) = candidate.finish_reason {
            if !self.emitted_any {
                chunks.push(self.delta_chunk(Delta::default()));
                self.emitted_any = true;
            }
            chunks.push(ChatCompletionChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: Delta::default(),
                    finish_reason: Some(map_gemini_finish_to_openai(finish_reason)),
                }],
            });
        }

        chunks
    }

    /// `spec.md` §4.5: a stream that ends without any content emits one
    /// empty-content chunk before `[DONE]`.
    pub fn finish_if_empty(&mut self) -> Vec<ChatCompletionChunk> {
        if self.emitted_any {
            return Vec::new();
        }
        self.emitted_any = true;
        vec![self.delta_chunk(Delta::default())]
    }

    fn delta_chunk(&self, delta: Delta) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: Some(Role::Assistant),
                    ..delta
                },
                finish_reason: None,
            }],
        }
    }
}

/// Slices a synthesized unary response into OpenAI-SSE deltas of at most 80
/// characters (`spec.md` §4.6 "Stream fallback for `stream:true` OpenAI").
pub fn chunk_text_for_stream_fallback(text: &str) -> Vec<String> {
    text.chars()
        .collect::<Vec<_>>()
        .chunks(80)
        .map(|chars| chars.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudgate_protocol::gemini::{Candidate, Content, FinishReason, FunctionCall, Part};

    fn frame(parts: Vec<Part>, finish: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content { parts, role: None },
                finish_reason: finish,
                token_count: None,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: None,
            response_id: None,
        }
    }

    #[test]
    fn emits_reasoning_tool_call_and_text_in_order() {
        let mut emitter = OpenAiStreamEmitter::new("chatcmpl-1".to_string(), "gpt-4o".to_string(), 0);
        let parts = vec![
            Part {
                thought: Some(true),
                text: Some("reasoning".to_string()),
                ..Default::default()
            },
            Part {
                function_call: Some(FunctionCall {
                    id: Some("fc1".to_string()),
                    name: "search".to_string(),
                    args: Some(serde_json::json!({"q": "x"})),
                }),
                ..Default::default()
            },
            Part {
                text: Some("answer".to_string()),
                ..Default::default()
            },
        ];
        let chunks = emitter.process_frame(&frame(parts, Some(FinishReason::Stop)));

        assert_eq!(chunks.len(), 4);
        assert_eq!(
            chunks[0].choices[0].delta.reasoning_content.as_deref(),
            Some("reasoning")
        );
        let tool_calls = chunks[1].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(tool_calls[0].function.as_ref().unwrap().name, "search");
        assert_eq!(
            tool_calls[0].function.as_ref().unwrap().arguments,
            "{\"q\":\"x\"}"
        );
        assert_eq!(chunks[2].choices[0].delta.content.as_deref(), Some("answer"));
        assert_eq!(
            chunks[3].choices[0].finish_reason,
            Some(cloudgate_protocol::openai::FinishReason::Stop)
        );
    }

    #[test]
    fn empty_stream_emits_single_empty_chunk() {
        let mut emitter = OpenAiStreamEmitter::new("chatcmpl-2".to_string(), "gpt-4o".to_string(), 0);
        let chunks = emitter.finish_if_empty();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].choices[0].delta.content.is_none());
    }

    #[test]
    fn chunk_text_splits_at_eighty_chars() {
        let text = "a".repeat(200);
        let chunks = chunk_text_for_stream_fallback(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 80);
        assert_eq!(chunks[2].len(), 40);
    }
}
