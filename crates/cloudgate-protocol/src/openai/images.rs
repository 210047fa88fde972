use serde::{Deserialize, Serialize};

/// Body of `POST /v1/images/generations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// `url` or `b64_json`; only `b64_json` is ever actually produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
}

/// `POST /v1/images/edits` arrives as `multipart/form-data`; the frontend
/// decodes the `image`/`mask` parts and the `prompt`/`model` fields into this
/// shape before handing off to the orchestrator.
#[derive(Debug, Clone)]
pub struct ImageEditRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub image: Vec<u8>,
    pub image_mime_type: String,
    pub mask: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDataItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationResponse {
    pub created: i64,
    pub data: Vec<ImageDataItem>,
}
