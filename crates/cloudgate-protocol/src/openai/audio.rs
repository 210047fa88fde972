use serde::{Deserialize, Serialize};

/// `POST /v1/audio/transcriptions` arrives as `multipart/form-data`; decoded
/// into this shape by the frontend before reaching the orchestrator.
#[derive(Debug, Clone)]
pub struct AudioTranscriptionRequest {
    pub model: Option<String>,
    pub audio: Vec<u8>,
    /// Defaults to `audio/mpeg` when the multipart part carries no content type
    /// (`spec.md` §4.7 "decodes base64 audio as `audio/mpeg` by default").
    pub mime_type: String,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTranscriptionResponse {
    pub text: String,
}
