use cloudgate_protocol::claude::{
    ContentBlockDelta, ContentBlockStart, CreateMessageResponse, MessageDeltaPayload, MessageRole,
    MessageType, Model, StopReason, StreamErrorPayload, StreamEvent, Usage,
};
use cloudgate_protocol::gemini::{FinishReason as GeminiFinishReason, Part};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockVariant {
    Text,
    Thinking,
    ToolUse,
}

/// Per-stream state machine enforcing the Anthropic event prefix invariant
/// (`spec.md` §3 "Streaming state"): `message_start` exactly once, at most one
/// open content block at a time, closed before a different variant opens.
pub struct StreamingState {
    message_id: String,
    model: Model,
    started: bool,
    open_block: Option<(u32, BlockVariant)>,
    next_index: u32,
    usage: Usage,
    error_reset: bool,
}

/// Drives a single upstream candidate's parts through a `StreamingState`,
/// producing the Anthropic events for that frame.
pub struct PartProcessor<'a> {
    state: &'a mut StreamingState,
}

impl StreamingState {
    pub fn new(message_id: String, model: Model) -> Self {
        Self {
            message_id,
            model,
            started: false,
            open_block: None,
            next_index: 0,
            usage: Usage::default(),
            error_reset: false,
        }
    }

    pub fn processor(&mut self) -> PartProcessor<'_> {
        PartProcessor { state: self }
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: CreateMessageResponse {
                id: self.message_id.clone(),
                message_type: MessageType::Message,
                role: MessageRole::Assistant,
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        });
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some((index, _)) = self.open_block.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    /// Reset after a recoverable single-frame parse error (`spec.md` §4.5).
    pub fn recover_from_parse_error(&mut self) -> StreamEvent {
        self.error_reset = true;
        self.open_block = None;
        StreamEvent::Error {
            error: StreamErrorPayload {
                error_type: "overloaded_error".to_string(),
                message: "malformed upstream frame, resuming stream".to_string(),
            },
        }
    }

    pub fn finish(
        &mut self,
        finish_reason: Option<GeminiFinishReason>,
        usage: Option<cloudgate_protocol::gemini::UsageMetadata>,
    ) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        self.close_open_block(&mut events);

        if let Some(usage) = usage {
            self.usage.input_tokens = usage.prompt_token_count.unwrap_or(self.usage.input_tokens);
            self.usage.output_tokens = usage
                .candidates_token_count
                .unwrap_or(self.usage.output_tokens);
        }

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaPayload {
                stop_reason: finish_reason.map(map_finish_reason),
                stop_sequence: None,
            },
            usage: self.usage,
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

impl PartProcessor<'_> {
    pub fn process(&mut self, part: &Part) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.state.ensure_started(&mut events);

        if let Some(call) = &part.function_call {
            self.switch_block(&mut events, BlockVariant::ToolUse, || ContentBlockStart::ToolUse {
                id: call.id.clone().unwrap_or_default(),
                name: call.name.clone(),
            });
            let args = call
                .args
                .clone()
                .map(|v| serde_json::to_string(&v).unwrap_or_default())
                .unwrap_or_default();
            if let Some((index, _)) = self.state.open_block {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::InputJsonDelta { partial_json: args },
                });
            }
            return events;
        }

        if part.thought == Some(true) {
            if let Some(text) = &part.text {
                self.switch_block(&mut events, BlockVariant::Thinking, || {
                    ContentBlockStart::Thinking {
                        thinking: String::new(),
                    }
                });
                if let Some((index, _)) = self.state.open_block {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentBlockDelta::ThinkingDelta {
                            thinking: text.clone(),
                        },
                    });
                }
            }
            return events;
        }

        if let Some(text) = &part.text {
            self.switch_block(&mut events, BlockVariant::Text, || ContentBlockStart::Text {
                text: String::new(),
            });
            if let Some((index, _)) = self.state.open_block {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::TextDelta { text: text.clone() },
                });
            }
        }

        events
    }

    fn switch_block(
        &mut self,
        events: &mut Vec<StreamEvent>,
        variant: BlockVariant,
        start: impl FnOnce() -> ContentBlockStart,
    ) {
        match self.state.open_block {
            Some((_, current)) if current == variant => return,
            Some(_) => self.state.close_open_block(events),
            None => {}
        }
        let index = self.state.next_index;
        self.state.next_index += 1;
        self.state.open_block = Some((index, variant));
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: start(),
        });
    }
}

fn map_finish_reason(reason: GeminiFinishReason) -> StopReason {
    match reason {
        GeminiFinishReason::Stop => StopReason::EndTurn,
        GeminiFinishReason::MaxTokens => StopReason::MaxTokens,
        GeminiFinishReason::Safety | GeminiFinishReason::Recitation => StopReason::Refusal,
        GeminiFinishReason::Other => StopReason::EndTurn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudgate_protocol::gemini::FunctionCall;

    #[test]
    fn opens_and_closes_blocks_on_variant_change() {
        let mut state = StreamingState::new("msg_1".to_string(), Model::Custom("claude".to_string()));
        let mut processor = state.processor();

        let events = processor.process(&Part {
            text: Some("hello".to_string()),
            ..Default::default()
        });
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], StreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[2], StreamEvent::ContentBlockDelta { index: 0, .. }));

        let events = processor.process(&Part {
            function_call: Some(FunctionCall {
                id: Some("fc1".to_string()),
                name: "search".to_string(),
                args: Some(serde_json::json!({"q": "x"})),
            }),
            ..Default::default()
        });
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[1], StreamEvent::ContentBlockStart { index: 1, .. }));

        let finish = state.finish(Some(GeminiFinishReason::Stop), None);
        assert!(matches!(finish[0], StreamEvent::ContentBlockStop { index: 1 }));
        assert!(matches!(finish[1], StreamEvent::MessageDelta { .. }));
        assert!(matches!(finish[2], StreamEvent::MessageStop));
    }

    #[test]
    fn parse_error_recovery_closes_open_block_and_resumes() {
        let mut state = StreamingState::new("msg_1".to_string(), Model::Custom("claude".to_string()));
        {
            let mut processor = state.processor();
            processor.process(&Part {
                text: Some("partial".to_string()),
                ..Default::default()
            });
        }

        let event = state.recover_from_parse_error();
        assert!(matches!(
            event,
            StreamEvent::Error { error } if error.error_type == "overloaded_error"
        ));
        assert!(state.error_reset);
        assert!(state.open_block.is_none());

        // Resuming after recovery opens a fresh block rather than assuming
        // the old one is still live.
        let mut processor = state.processor();
        let events = processor.process(&Part {
            text: Some("resumed".to_string()),
            ..Default::default()
        });
        assert!(matches!(events[0], StreamEvent::ContentBlockStart { index: 1, .. }));
    }
}
