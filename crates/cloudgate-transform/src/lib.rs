pub mod model_route;
pub mod request_map;
pub mod response_map;
pub mod stream_map;
pub mod streaming_state;

pub use model_route::{image_variant_ids, known_model_ids, normalize_model, resolve_model_route};
pub use request_map::{
    claude_to_internal_gemini, completions_to_claude, gemini_to_internal_gemini, openai_to_claude,
    responses_to_claude,
};
pub use response_map::{
    claude_to_completions_response, claude_to_image_response, claude_to_openai, claude_to_responses_response,
    claude_to_transcription_response, internal_gemini_to_claude, map_gemini_finish_to_openai,
};
pub use stream_map::{chunk_text_for_stream_fallback, DecodedFrame, GeminiFrameDecoder, OpenAiStreamEmitter};
pub use streaming_state::{PartProcessor, StreamingState};
