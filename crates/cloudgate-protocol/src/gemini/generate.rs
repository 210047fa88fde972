use serde::{Deserialize, Serialize};

use super::types::{Candidate, Content, GenerationConfig, Tool, ToolConfig, UsageMetadata};

/// Body of the public `POST /v1beta/models/{model}:generateContent` request,
/// and the payload carried inside the internal envelope after translation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateContentRequestBody {
    pub contents: Vec<Content>,
    #[serde(
        default,
        rename = "systemInstruction",
        skip_serializing_if = "Option::is_none"
    )]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(
        default,
        rename = "toolConfig",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_config: Option<ToolConfig>,
    #[serde(
        default,
        rename = "generationConfig",
        skip_serializing_if = "Option::is_none"
    )]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(
        default,
        rename = "usageMetadata",
        skip_serializing_if = "Option::is_none"
    )]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(
        default,
        rename = "modelVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub model_version: Option<String>,
    #[serde(
        default,
        rename = "responseId",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_id: Option<String>,
}

impl GenerateContentResponse {
    pub fn empty() -> Self {
        Self {
            candidates: Vec::new(),
            usage_metadata: None,
            model_version: None,
            response_id: None,
        }
    }

    pub fn has_usable_candidate(&self) -> bool {
        self.candidates
            .first()
            .is_some_and(|c| !c.content.parts.is_empty())
    }
}

/// The envelope the internal endpoint expects: `{project, request: {...}, model, ...}`.
/// Grounded on the donor's `wrap_internal_request` (antigravity provider) and
/// `transformClaudeRequestIn` (`spec.md` §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalGenerateContentRequest {
    pub project: String,
    pub model: String,
    pub request: GenerateContentRequestBody,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "userAgent")]
    pub user_agent: String,
    #[serde(rename = "requestType")]
    pub request_type: String,
}

/// Internal endpoint responses are sometimes wrapped as `{"response": {...}}`
/// (`spec.md` §4.2 "Normalization").
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InternalGenerateContentEnvelope {
    Wrapped { response: GenerateContentResponse },
    Bare(GenerateContentResponse),
}

impl InternalGenerateContentEnvelope {
    pub fn into_inner(self) -> GenerateContentResponse {
        match self {
            InternalGenerateContentEnvelope::Wrapped { response } => response,
            InternalGenerateContentEnvelope::Bare(response) => response,
        }
    }
}
