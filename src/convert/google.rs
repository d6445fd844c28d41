//! Upstream Google Generative-AI wire types.
//!
//! These mirror the `v1internal` request/response shapes used by the Cloud
//! Code API. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Model family a signature or model id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Claude,
    Gemini,
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

/// Classify a model id into its family. Unrecognized ids are treated as
/// Gemini, which is the stricter target for signature validation.
pub fn model_family(model: &str) -> ModelFamily {
    if model.to_ascii_lowercase().contains("claude") {
        ModelFamily::Claude
    } else {
        ModelFamily::Gemini
    }
}

/// Whether a model supports extended thinking: any id containing
/// "thinking", or a Gemini generation of 3 or later.
pub fn is_thinking_model(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    if lower.contains("thinking") {
        return true;
    }
    gemini_generation(&lower).is_some_and(|n| n >= 3)
}

/// Parse the major generation out of a `gemini-N...` id.
fn gemini_generation(lower: &str) -> Option<u32> {
    let rest = lower.strip_prefix("gemini-")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Sentinel signature placed on Gemini tool calls when no real signature is
/// available; tells upstream to skip validation.
pub const GEMINI_SKIP_SIGNATURE: &str = "skip_thought_signature_validator";

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// The inner Google request carried inside the Cloud Code wrapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDeclarations>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A role-tagged list of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

/// One content part. Exactly one payload field is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

/// Generation parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Claude models take snake_case keys here, Gemini camelCase; kept as
    /// raw JSON so the request builder controls the exact shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallingConfig {
    pub mode: String,
}

// ---------------------------------------------------------------------------
// Cloud Code wrapper
// ---------------------------------------------------------------------------

/// The outer body sent to the `v1internal` endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudCodeRequest {
    pub project: String,
    pub model: String,
    pub request: GoogleRequest,
    pub user_agent: String,
    pub request_type: String,
    pub request_id: String,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Upstream response; streaming chunks share this shape.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl GoogleResponse {
    /// Parse a response or streaming chunk, unwrapping the Cloud Code
    /// `{"response": ...}` envelope when present.
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        let inner = value.get("response").unwrap_or(value);
        serde_json::from_value(inner.clone())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub cached_content_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

/// Model catalog entry from `fetchAvailableModels`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamModel {
    #[serde(alias = "modelId", alias = "name")]
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_family() {
        assert_eq!(model_family("claude-sonnet-4-5"), ModelFamily::Claude);
        assert_eq!(model_family("claude-opus-4-5-thinking"), ModelFamily::Claude);
        assert_eq!(model_family("gemini-3-pro"), ModelFamily::Gemini);
        assert_eq!(model_family("mystery-model"), ModelFamily::Gemini);
    }

    #[test]
    fn test_is_thinking_model() {
        assert!(is_thinking_model("claude-opus-4-5-thinking"));
        assert!(is_thinking_model("gemini-3-pro"));
        assert!(is_thinking_model("gemini-3.5-flash"));
        assert!(!is_thinking_model("gemini-2.5-pro"));
        assert!(!is_thinking_model("claude-sonnet-4-5"));
    }

    #[test]
    fn test_part_serialization_skips_empty() {
        let part = Part::text("hello");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json, json!({"text": "hello"}));
    }

    #[test]
    fn test_response_unwraps_envelope() {
        let wrapped = json!({
            "response": {
                "candidates": [{"content": {"role": "model", "parts": [{"text": "hi"}]}}],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1}
            }
        });
        let resp = GoogleResponse::from_json(&wrapped).unwrap();
        assert_eq!(resp.candidates.len(), 1);
        assert_eq!(resp.usage_metadata.unwrap().prompt_token_count, 3);

        let bare = json!({"candidates": []});
        assert!(GoogleResponse::from_json(&bare).unwrap().candidates.is_empty());
    }

    #[test]
    fn test_cloud_code_request_wire_shape() {
        let wrapped = CloudCodeRequest {
            project: "proj".into(),
            model: "claude-sonnet-4-5".into(),
            request: GoogleRequest::default(),
            user_agent: "antigravity".into(),
            request_type: "agent".into(),
            request_id: "agent-123".into(),
        };
        let json = serde_json::to_value(&wrapped).unwrap();
        assert_eq!(json["userAgent"], "antigravity");
        assert_eq!(json["requestType"], "agent");
        assert!(json["request"]["contents"].is_array());
    }

    #[test]
    fn test_thought_part_round_trip() {
        let raw = json!({
            "text": "reasoning...",
            "thought": true,
            "thoughtSignature": "sig"
        });
        let part: Part = serde_json::from_value(raw).unwrap();
        assert_eq!(part.thought, Some(true));
        assert_eq!(part.thought_signature.as_deref(), Some("sig"));
    }
}
