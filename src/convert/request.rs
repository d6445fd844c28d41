//! Anthropic → Google request conversion.
//!
//! The pipeline, in order: system-instruction composition, thinking
//! recovery, per-message part conversion, assistant-turn reordering, tool
//! declaration sanitation, thinking config, session id derivation, and the
//! Gemini output-token cap. `cache_control` never survives deserialization,
//! so the upstream payload is guaranteed free of it.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::convert::anthropic::{
    ContentBlock, MediaSource, Message, MessageContent, MessagesRequest, Role,
};
use crate::convert::google::{
    is_thinking_model, model_family, Content, FunctionCall, FunctionCallingConfig,
    FunctionDeclaration, FunctionResponse, GenerationConfig, GoogleRequest, InlineData, FileData,
    ModelFamily, Part, ToolConfig, ToolDeclarations, GEMINI_SKIP_SIGNATURE,
};
use crate::convert::schema::{sanitize_tool_name, tool_parameters};
use crate::convert::signature::SignatureCache;
use crate::convert::thinking::recover_thinking;

/// Identity preamble injected ahead of any client system prompt.
const BASE_SYSTEM_INSTRUCTION: &str = "You are an agentic coding assistant.";

/// Hint appended for Claude thinking models when tools are declared.
const INTERLEAVED_THINKING_HINT: &str =
    "Interleaved thinking is enabled: you may reason between tool calls.";

/// Default thinking budget for Gemini thinking models.
const GEMINI_DEFAULT_THINKING_BUDGET: u32 = 16_000;

/// Hard cap on Gemini output tokens.
const GEMINI_MAX_OUTPUT_TOKENS: u32 = 16_384;

/// Headroom added on top of the thinking budget when it exceeds the
/// client's max_tokens.
const THINKING_BUDGET_HEADROOM: u32 = 8_192;

/// Default max_tokens when the client omits it.
const DEFAULT_MAX_TOKENS: u32 = 4_096;

/// Convert an Anthropic request into the inner Google request.
pub async fn convert_request(
    request: &MessagesRequest,
    signatures: &SignatureCache,
) -> GoogleRequest {
    let family = model_family(&request.model);
    let thinking = is_thinking_model(&request.model);
    let has_tools = request.tools.as_ref().is_some_and(|t| !t.is_empty());

    // System instruction: identity preamble, the same text inside [ignore]
    // tags, then the client's own system prompt.
    let mut system_parts = vec![
        Part::text(BASE_SYSTEM_INSTRUCTION),
        Part::text(format!("[ignore]{BASE_SYSTEM_INSTRUCTION}[/ignore]")),
    ];
    if let Some(system) = &request.system {
        let text = system.as_text();
        if !text.is_empty() {
            system_parts.push(Part::text(text));
        }
    }
    if family == ModelFamily::Claude && thinking && has_tools {
        system_parts.push(Part::text(INTERLEAVED_THINKING_HINT));
    }

    // Reasoning continuity across tool turns.
    let messages = recover_thinking(request.messages.clone(), family, signatures).await;

    let mut contents = Vec::with_capacity(messages.len());
    for message in &messages {
        contents.push(convert_message(message, family, signatures).await);
    }

    // Generation parameters.
    let mut max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let thinking_config = if thinking {
        match family {
            ModelFamily::Claude => {
                let mut config = json!({"include_thoughts": true});
                if let Some(budget) = request.thinking.as_ref().and_then(|t| t.budget_tokens) {
                    config["thinking_budget"] = json!(budget);
                    if max_tokens <= budget {
                        max_tokens = budget + THINKING_BUDGET_HEADROOM;
                    }
                }
                Some(config)
            }
            ModelFamily::Gemini => {
                let budget = request
                    .thinking
                    .as_ref()
                    .and_then(|t| t.budget_tokens)
                    .unwrap_or(GEMINI_DEFAULT_THINKING_BUDGET);
                Some(json!({"includeThoughts": true, "thinkingBudget": budget}))
            }
        }
    } else {
        None
    };

    if family == ModelFamily::Gemini {
        max_tokens = max_tokens.min(GEMINI_MAX_OUTPUT_TOKENS);
    }

    // Tool declarations.
    let (tools, tool_config) = match &request.tools {
        Some(list) if !list.is_empty() => {
            let declarations: Vec<FunctionDeclaration> = list
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: sanitize_tool_name(&tool.name),
                    description: tool.description.clone(),
                    parameters: tool_parameters(&tool.input_schema),
                })
                .collect();
            let config = (family == ModelFamily::Claude).then(|| ToolConfig {
                function_calling_config: FunctionCallingConfig {
                    mode: "VALIDATED".to_string(),
                },
            });
            (
                Some(vec![ToolDeclarations {
                    function_declarations: declarations,
                }]),
                config,
            )
        }
        _ => (None, None),
    };

    GoogleRequest {
        contents,
        system_instruction: Some(Content {
            role: "user".to_string(),
            parts: system_parts,
        }),
        generation_config: GenerationConfig {
            max_output_tokens: Some(max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            stop_sequences: request.stop_sequences.clone(),
            thinking_config,
        },
        tools,
        tool_config,
        session_id: Some(derive_session_id(&request.messages)),
    }
}

/// Convert one message into an upstream content entry.
async fn convert_message(
    message: &Message,
    family: ModelFamily,
    signatures: &SignatureCache,
) -> Content {
    let role = match message.role {
        Role::Assistant => "model",
        Role::User => "user",
    };

    let mut parts: Vec<Part> = Vec::new();
    let mut deferred: Vec<Part> = Vec::new();

    for block in message.content.as_blocks() {
        match block {
            ContentBlock::Text { text, .. } => {
                if !text.is_empty() {
                    parts.push(Part::text(text));
                }
            }
            ContentBlock::Image { source } | ContentBlock::Document { source } => {
                parts.push(media_part(&source));
            }
            ContentBlock::ToolUse {
                id,
                name,
                input,
                thought_signature,
                ..
            } => {
                let signature = match thought_signature {
                    Some(sig) if !sig.is_empty() => Some(sig),
                    _ => signatures.get_cached_signature(&id).await,
                };
                let signature = match (signature, family) {
                    (Some(sig), _) => Some(sig),
                    // Gemini requires a signature on every function call.
                    (None, ModelFamily::Gemini) => Some(GEMINI_SKIP_SIGNATURE.to_string()),
                    (None, ModelFamily::Claude) => None,
                };
                parts.push(Part {
                    function_call: Some(FunctionCall {
                        name,
                        args: input,
                        id: Some(id),
                    }),
                    thought_signature: signature,
                    ..Part::default()
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let (result_text, images) = extract_tool_result(&content);
                parts.push(Part {
                    function_response: Some(FunctionResponse {
                        name: tool_use_id,
                        response: json!({"result": result_text}),
                    }),
                    ..Part::default()
                });
                // Images inside tool results ride at the end of the turn.
                deferred.extend(images);
            }
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                let Some(signature) = signature else { continue };
                if signature.len() < crate::convert::anthropic::MIN_SIGNATURE_LENGTH {
                    continue;
                }
                if family == ModelFamily::Gemini
                    && !signatures.is_compatible(&signature, ModelFamily::Gemini).await
                {
                    continue;
                }
                parts.push(Part {
                    text: Some(thinking),
                    thought: Some(true),
                    thought_signature: Some(signature),
                    ..Part::default()
                });
            }
            // Redacted blocks cannot be represented upstream.
            ContentBlock::RedactedThinking { .. } => {}
        }
    }

    parts.extend(deferred);

    if message.role == Role::Assistant {
        parts = reorder_assistant_parts(parts);
    }

    // Upstream rejects empty parts arrays and empty strings alike.
    if parts.is_empty() {
        parts.push(Part::text("."));
    }

    Content {
        role: role.to_string(),
        parts,
    }
}

/// Within one assistant turn, order parts thinking → text/media → function
/// calls.
fn reorder_assistant_parts(parts: Vec<Part>) -> Vec<Part> {
    let mut thinking = Vec::new();
    let mut middle = Vec::new();
    let mut calls = Vec::new();

    for part in parts {
        if part.thought == Some(true) {
            thinking.push(part);
        } else if part.function_call.is_some() {
            calls.push(part);
        } else {
            middle.push(part);
        }
    }

    thinking.extend(middle);
    thinking.extend(calls);
    thinking
}

fn media_part(source: &MediaSource) -> Part {
    match source {
        MediaSource::Base64 { media_type, data } => Part {
            inline_data: Some(InlineData {
                mime_type: media_type.clone(),
                data: data.clone(),
            }),
            ..Part::default()
        },
        MediaSource::Url { url, media_type } => Part {
            file_data: Some(FileData {
                mime_type: media_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                file_uri: url.clone(),
            }),
            ..Part::default()
        },
    }
}

/// Flatten a tool result into a result string plus any embedded images.
fn extract_tool_result(content: &Value) -> (String, Vec<Part>) {
    match content {
        Value::String(text) => (text.clone(), Vec::new()),
        Value::Array(blocks) => {
            let mut text = String::new();
            let mut images = Vec::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(part) = block.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(part);
                        }
                    }
                    Some("image") => {
                        if let Ok(source) =
                            serde_json::from_value::<MediaSource>(block["source"].clone())
                        {
                            images.push(media_part(&source));
                        }
                    }
                    _ => {}
                }
            }
            (text, images)
        }
        Value::Null => (String::new(), Vec::new()),
        other => (other.to_string(), Vec::new()),
    }
}

/// Deterministic session id: SHA-256 of the first user message's text,
/// truncated to 32 hex characters. Falls back to a random UUID when the
/// conversation has no user text.
fn derive_session_id(messages: &[Message]) -> String {
    let first_user_text = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| {
            m.content
                .as_blocks()
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .concat()
        })
        .unwrap_or_default();

    if first_user_text.is_empty() {
        return uuid::Uuid::new_v4().to_string();
    }

    let digest = Sha256::digest(first_user_text.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::anthropic::{SystemPrompt, ThinkingConfig, Tool};
    use crate::store::Store;
    use std::sync::Arc;

    fn signatures() -> SignatureCache {
        SignatureCache::new(Arc::new(Store::in_memory()))
    }

    fn request(model: &str, messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            messages,
            system: None,
            max_tokens: Some(1024),
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            thinking: None,
            tools: None,
            tool_choice: None,
            stream: false,
        }
    }

    fn user(text: &str) -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[tokio::test]
    async fn test_system_instruction_composition() {
        let mut req = request("claude-sonnet-4-5", vec![user("hello")]);
        req.system = Some(SystemPrompt::Text("Be terse.".into()));

        let google = convert_request(&req, &signatures()).await;
        let system = google.system_instruction.unwrap();
        assert_eq!(system.role, "user");
        assert_eq!(system.parts.len(), 3);
        assert_eq!(system.parts[0].text.as_deref(), Some(BASE_SYSTEM_INSTRUCTION));
        assert!(system.parts[1].text.as_deref().unwrap().starts_with("[ignore]"));
        assert!(system.parts[1].text.as_deref().unwrap().ends_with("[/ignore]"));
        assert_eq!(system.parts[2].text.as_deref(), Some("Be terse."));
    }

    #[tokio::test]
    async fn test_interleaved_hint_for_claude_thinking_with_tools() {
        let mut req = request("claude-opus-4-5-thinking", vec![user("hello")]);
        req.tools = Some(vec![Tool {
            name: "search".into(),
            description: None,
            input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        }]);

        let google = convert_request(&req, &signatures()).await;
        let system = google.system_instruction.unwrap();
        assert_eq!(
            system.parts.last().unwrap().text.as_deref(),
            Some(INTERLEAVED_THINKING_HINT)
        );
    }

    #[tokio::test]
    async fn test_cache_control_never_reaches_upstream() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "hi", "cache_control": {"type": "ephemeral"}}
                ]
            }]
        }))
        .unwrap();

        let google = convert_request(&req, &signatures()).await;
        let wire = serde_json::to_string(&google).unwrap();
        assert!(!wire.contains("cache_control"));
    }

    #[tokio::test]
    async fn test_assistant_reorder_and_placeholder() {
        let sig = "s".repeat(60);
        let assistant = Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "t".into(),
                    input: json!({}),
                    thought_signature: None,
                    cache_control: None,
                },
                ContentBlock::text("answer"),
                ContentBlock::Thinking {
                    thinking: "why".into(),
                    signature: Some(sig.clone()),
                },
            ]),
        };
        let req = request(
            "claude-sonnet-4-5",
            vec![user("q"), assistant, user("next")],
        );

        let google = convert_request(&req, &signatures()).await;
        let parts = &google.contents[1].parts;
        assert_eq!(parts[0].thought, Some(true));
        assert_eq!(parts[1].text.as_deref(), Some("answer"));
        assert!(parts[2].function_call.is_some());

        // Empty assistant turns become the "." placeholder.
        let empty = Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::text("")]),
        };
        let req = request("claude-sonnet-4-5", vec![user("q"), empty, user("next")]);
        let google = convert_request(&req, &signatures()).await;
        assert_eq!(google.contents[1].parts[0].text.as_deref(), Some("."));
    }

    #[tokio::test]
    async fn test_gemini_tool_use_gets_sentinel() {
        let assistant = Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: "toolu_nosig".into(),
                name: "t".into(),
                input: json!({}),
                thought_signature: None,
                cache_control: None,
            }]),
        };
        let req = request("gemini-3-pro", vec![user("q"), assistant, user("go on")]);

        let google = convert_request(&req, &signatures()).await;
        let call_part = google.contents[1]
            .parts
            .iter()
            .find(|p| p.function_call.is_some())
            .unwrap();
        assert_eq!(
            call_part.thought_signature.as_deref(),
            Some(GEMINI_SKIP_SIGNATURE)
        );
    }

    #[tokio::test]
    async fn test_tool_use_signature_recovered_from_cache() {
        let signatures = signatures();
        signatures.cache_signature("toolu_cached", "recovered-sig").await;

        let assistant = Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: "toolu_cached".into(),
                name: "t".into(),
                input: json!({}),
                thought_signature: None,
                cache_control: None,
            }]),
        };
        let req = request("gemini-3-pro", vec![user("q"), assistant, user("k")]);

        let google = convert_request(&req, &signatures).await;
        let call_part = google.contents[1]
            .parts
            .iter()
            .find(|p| p.function_call.is_some())
            .unwrap();
        assert_eq!(call_part.thought_signature.as_deref(), Some("recovered-sig"));
    }

    #[tokio::test]
    async fn test_tool_result_with_images() {
        let user_result = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: json!([
                    {"type": "text", "text": "screenshot attached"},
                    {"type": "image", "source": {
                        "type": "base64", "media_type": "image/png", "data": "AAAA"
                    }}
                ]),
                is_error: None,
                cache_control: None,
            }]),
        };
        let req = request("claude-sonnet-4-5", vec![user("q"), user_result]);

        let google = convert_request(&req, &signatures()).await;
        let parts = &google.contents[1].parts;
        let response = parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.response["result"], "screenshot attached");
        // Image deferred to the end of the parts array.
        assert!(parts.last().unwrap().inline_data.is_some());
    }

    #[tokio::test]
    async fn test_claude_thinking_budget_raises_max_tokens() {
        let mut req = request("claude-opus-4-5-thinking", vec![user("deep question")]);
        req.max_tokens = Some(2048);
        req.thinking = Some(ThinkingConfig {
            kind: Some("enabled".into()),
            budget_tokens: Some(8000),
        });

        let google = convert_request(&req, &signatures()).await;
        assert_eq!(
            google.generation_config.max_output_tokens,
            Some(8000 + THINKING_BUDGET_HEADROOM)
        );
        let thinking = google.generation_config.thinking_config.unwrap();
        assert_eq!(thinking["include_thoughts"], json!(true));
        assert_eq!(thinking["thinking_budget"], json!(8000));
    }

    #[tokio::test]
    async fn test_gemini_thinking_defaults_and_cap() {
        let mut req = request("gemini-3-pro", vec![user("q")]);
        req.max_tokens = Some(100_000);

        let google = convert_request(&req, &signatures()).await;
        assert_eq!(
            google.generation_config.max_output_tokens,
            Some(GEMINI_MAX_OUTPUT_TOKENS)
        );
        let thinking = google.generation_config.thinking_config.unwrap();
        assert_eq!(thinking["includeThoughts"], json!(true));
        assert_eq!(
            thinking["thinkingBudget"],
            json!(GEMINI_DEFAULT_THINKING_BUDGET)
        );
    }

    #[tokio::test]
    async fn test_claude_tools_validated_mode() {
        let mut req = request("claude-sonnet-4-5", vec![user("q")]);
        req.tools = Some(vec![Tool {
            name: "weird name!".into(),
            description: Some("demo".into()),
            input_schema: json!({}),
        }]);

        let google = convert_request(&req, &signatures()).await;
        let tools = google.tools.unwrap();
        let declaration = &tools[0].function_declarations[0];
        assert_eq!(declaration.name, "weird_name_");
        assert_eq!(declaration.parameters["type"], "OBJECT");
        assert_eq!(
            google.tool_config.unwrap().function_calling_config.mode,
            "VALIDATED"
        );
    }

    #[tokio::test]
    async fn test_session_id_deterministic() {
        let req = request("claude-sonnet-4-5", vec![user("stable input")]);
        let a = convert_request(&req, &signatures()).await;
        let b = convert_request(&req, &signatures()).await;
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(a.session_id.as_ref().unwrap().len(), 32);
    }

    #[test]
    fn test_extract_tool_result_shapes() {
        assert_eq!(extract_tool_result(&json!("plain")).0, "plain");
        assert_eq!(extract_tool_result(&Value::Null).0, "");
        let (text, images) = extract_tool_result(&json!([
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"}
        ]));
        assert_eq!(text, "a\nb");
        assert!(images.is_empty());
    }
}
