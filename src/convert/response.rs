//! Google → Anthropic response conversion (non-streaming).

use rand::Rng;
use serde_json::json;

use crate::convert::anthropic::{
    MessagesResponse, ResponseBlock, Usage, MIN_SIGNATURE_LENGTH,
};
use crate::convert::google::{model_family, GoogleResponse};
use crate::convert::signature::SignatureCache;

/// Generate a client-visible message id.
pub fn generate_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

/// Generate a tool-use id when upstream does not supply one.
pub fn generate_tool_use_id() -> String {
    let mut rng = rand::rng();
    let hex: String = (0..12)
        .map(|_| {
            let n: u8 = rng.random_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect();
    format!("toolu_{hex}")
}

/// Accumulate every candidate part into a single Anthropic response.
pub async fn convert_response(
    response: &GoogleResponse,
    model: &str,
    signatures: &SignatureCache,
) -> MessagesResponse {
    let family = model_family(model);
    let mut content: Vec<ResponseBlock> = Vec::new();
    let mut finish_reason: Option<String> = None;
    let mut saw_tool_use = false;

    for candidate in &response.candidates {
        if let Some(reason) = &candidate.finish_reason {
            finish_reason = Some(reason.clone());
        }
        let Some(candidate_content) = &candidate.content else {
            continue;
        };
        for part in &candidate_content.parts {
            if part.thought == Some(true) {
                let signature = part.thought_signature.clone();
                if let Some(sig) = &signature {
                    signatures.cache_thinking_signature(sig, family).await;
                }
                content.push(ResponseBlock::Thinking {
                    thinking: part.text.clone().unwrap_or_default(),
                    signature,
                });
            } else if let Some(call) = &part.function_call {
                saw_tool_use = true;
                let id = call
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(generate_tool_use_id);
                if let Some(sig) = &part.thought_signature {
                    if sig.len() >= MIN_SIGNATURE_LENGTH {
                        signatures.cache_signature(&id, sig).await;
                    }
                }
                content.push(ResponseBlock::ToolUse {
                    id,
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            } else if let Some(text) = &part.text {
                if !text.is_empty() {
                    content.push(ResponseBlock::Text { text: text.clone() });
                }
            } else if let Some(inline) = &part.inline_data {
                content.push(ResponseBlock::Image {
                    source: json!({
                        "type": "base64",
                        "media_type": inline.mime_type,
                        "data": inline.data,
                    }),
                });
            }
        }
    }

    let stop_reason = if saw_tool_use {
        Some("tool_use".to_string())
    } else {
        finish_reason.as_deref().map(map_finish_reason)
    };

    MessagesResponse {
        id: generate_message_id(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content,
        stop_reason,
        stop_sequence: None,
        usage: convert_usage(response),
    }
}

/// Map the upstream finish reason onto the Anthropic vocabulary.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "end_turn".to_string(),
        "MAX_TOKENS" => "max_tokens".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Anthropic usage accounting: cached prompt tokens are reported separately
/// and subtracted from input.
pub fn convert_usage(response: &GoogleResponse) -> Usage {
    let Some(meta) = &response.usage_metadata else {
        return Usage::default();
    };
    let cached = meta.cached_content_token_count;
    Usage {
        input_tokens: meta.prompt_token_count.saturating_sub(cached),
        output_tokens: meta.candidates_token_count,
        cache_read_input_tokens: (cached > 0).then_some(cached),
        cache_creation_input_tokens: None,
    }
}
