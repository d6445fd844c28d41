//! Thinking-block recovery across tool-call turns.
//!
//! When the latest assistant turn is mid tool-loop but carries no usable
//! (signed, family-compatible) thinking block, forwarding it as-is gets the
//! request rejected upstream. Recovery strips the unusable blocks and
//! splices in synthetic turns that keep the conversation well-formed:
//!
//!   - tool loop in progress: append `[Tool execution completed.]` /
//!     `[Continue]` so the model re-enters reasoning cleanly;
//!   - tool call interrupted by a plain user message: insert
//!     `[Tool call was interrupted.]` before that message.

use tracing::debug;

use crate::convert::anthropic::{ContentBlock, Message, MessageContent, Role};
use crate::convert::google::ModelFamily;
use crate::convert::signature::SignatureCache;

/// Synthetic acknowledgement appended when a tool loop is in progress.
const TOOL_COMPLETED_TEXT: &str = "[Tool execution completed.]";

/// Synthetic user nudge paired with [`TOOL_COMPLETED_TEXT`].
const CONTINUE_TEXT: &str = "[Continue]";

/// Synthetic acknowledgement inserted when a tool call was abandoned.
const TOOL_INTERRUPTED_TEXT: &str = "[Tool call was interrupted.]";

/// Where the conversation stands relative to the latest assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// Latest assistant turn called a tool and results have arrived.
    InToolLoop,
    /// Latest assistant turn called a tool but the user moved on instead of
    /// returning a result.
    InterruptedTool,
    /// No tool call pending.
    Normal,
}

/// Classify the conversation by inspecting the final assistant message and
/// everything after it.
pub fn classify_conversation(messages: &[Message]) -> ConversationState {
    let Some(last_assistant) = messages.iter().rposition(|m| m.role == Role::Assistant) else {
        return ConversationState::Normal;
    };

    let has_tool_use = messages[last_assistant]
        .content
        .as_blocks()
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    if !has_tool_use {
        return ConversationState::Normal;
    }

    let tail = &messages[last_assistant + 1..];
    let has_tool_result = tail.iter().any(|m| {
        m.content
            .as_blocks()
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    });
    if has_tool_result {
        return ConversationState::InToolLoop;
    }

    let has_plain_user = tail.iter().any(|m| {
        m.role == Role::User
            && !m
                .content
                .as_blocks()
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    });
    if has_plain_user {
        return ConversationState::InterruptedTool;
    }

    ConversationState::Normal
}

/// Whether a thinking block may be forwarded to the target family.
async fn block_is_forwardable(
    block: &ContentBlock,
    target: ModelFamily,
    signatures: &SignatureCache,
) -> bool {
    if !block.is_signed_thinking() {
        return false;
    }
    match target {
        // Claude validates its own signatures.
        ModelFamily::Claude => true,
        ModelFamily::Gemini => match block {
            ContentBlock::Thinking {
                signature: Some(signature),
                ..
            } => signatures.is_compatible(signature, ModelFamily::Gemini).await,
            _ => false,
        },
    }
}

/// Recover reasoning continuity for the request about to be forwarded.
///
/// Returns the (possibly rewritten) message list. When the final assistant
/// turn is mid tool-flow and none of its thinking blocks can be forwarded,
/// the unusable blocks are stripped and synthetic turns are spliced in.
pub async fn recover_thinking(
    mut messages: Vec<Message>,
    target: ModelFamily,
    signatures: &SignatureCache,
) -> Vec<Message> {
    let state = classify_conversation(&messages);
    if state == ConversationState::Normal {
        return messages;
    }

    let Some(last_assistant) = messages.iter().rposition(|m| m.role == Role::Assistant) else {
        return messages;
    };

    let mut has_valid_thinking = false;
    for block in messages[last_assistant].content.as_blocks() {
        if block.is_thinking() && block_is_forwardable(&block, target, signatures).await {
            has_valid_thinking = true;
            break;
        }
    }
    if has_valid_thinking {
        return messages;
    }

    // Strip thinking blocks that would be rejected upstream.
    let mut kept: Vec<ContentBlock> = Vec::new();
    for block in messages[last_assistant].content.as_blocks() {
        if block.is_thinking() && !block_is_forwardable(&block, target, signatures).await {
            continue;
        }
        kept.push(block);
    }
    messages[last_assistant].content = MessageContent::Blocks(kept);

    match state {
        ConversationState::InterruptedTool => {
            debug!(target = %target, "Recovering interrupted tool call");
            // Acknowledge the abandoned call right before the user's
            // follow-up message.
            let insert_at = messages[last_assistant + 1..]
                .iter()
                .position(|m| m.role == Role::User)
                .map(|offset| last_assistant + 1 + offset)
                .unwrap_or(messages.len());
            messages.insert(
                insert_at,
                Message {
                    role: Role::Assistant,
                    content: MessageContent::Text(TOOL_INTERRUPTED_TEXT.to_string()),
                },
            );
        }
        ConversationState::InToolLoop => {
            debug!(target = %target, "Recovering in-progress tool loop");
            messages.push(Message {
                role: Role::Assistant,
                content: MessageContent::Text(TOOL_COMPLETED_TEXT.to_string()),
            });
            messages.push(Message {
                role: Role::User,
                content: MessageContent::Text(CONTINUE_TEXT.to_string()),
            });
        }
        ConversationState::Normal => unreachable!(),
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::anthropic::MIN_SIGNATURE_LENGTH;
    use crate::store::Store;
    use serde_json::json;
    use std::sync::Arc;

    fn user_text(text: &str) -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn assistant_tool_use(signature: Option<&str>) -> Message {
        let mut blocks = vec![ContentBlock::ToolUse {
            id: "toolu_1".into(),
            name: "search".into(),
            input: json!({"q": "x"}),
            thought_signature: None,
            cache_control: None,
        }];
        if let Some(sig) = signature {
            blocks.insert(
                0,
                ContentBlock::Thinking {
                    thinking: "planning".into(),
                    signature: Some(sig.to_string()),
                },
            );
        }
        Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    fn tool_result() -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: json!("ok"),
                is_error: None,
                cache_control: None,
            }]),
        }
    }

    fn signatures() -> SignatureCache {
        SignatureCache::new(Arc::new(Store::in_memory()))
    }

    #[test]
    fn test_classify_in_tool_loop() {
        let messages = vec![user_text("hi"), assistant_tool_use(None), tool_result()];
        assert_eq!(classify_conversation(&messages), ConversationState::InToolLoop);
    }

    #[test]
    fn test_classify_interrupted() {
        let messages = vec![
            user_text("hi"),
            assistant_tool_use(None),
            user_text("never mind, do something else"),
        ];
        assert_eq!(
            classify_conversation(&messages),
            ConversationState::InterruptedTool
        );
    }

    #[test]
    fn test_classify_normal() {
        let messages = vec![user_text("hi")];
        assert_eq!(classify_conversation(&messages), ConversationState::Normal);

        // Tool use with nothing after it is still awaiting its result.
        let pending = vec![user_text("hi"), assistant_tool_use(None)];
        assert_eq!(classify_conversation(&pending), ConversationState::Normal);
    }

    #[tokio::test]
    async fn test_tool_loop_appends_synthetic_pair() {
        let messages = vec![user_text("hi"), assistant_tool_use(None), tool_result()];
        let recovered =
            recover_thinking(messages, ModelFamily::Claude, &signatures()).await;

        let n = recovered.len();
        assert_eq!(n, 5);
        match &recovered[n - 2].content {
            MessageContent::Text(text) => assert_eq!(text, TOOL_COMPLETED_TEXT),
            other => panic!("unexpected content: {other:?}"),
        }
        match &recovered[n - 1].content {
            MessageContent::Text(text) => assert_eq!(text, CONTINUE_TEXT),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interrupted_inserts_acknowledgement() {
        let messages = vec![
            user_text("hi"),
            assistant_tool_use(None),
            user_text("actually, stop"),
        ];
        let recovered =
            recover_thinking(messages, ModelFamily::Claude, &signatures()).await;

        assert_eq!(recovered.len(), 4);
        assert_eq!(recovered[2].role, Role::Assistant);
        match &recovered[2].content {
            MessageContent::Text(text) => assert_eq!(text, TOOL_INTERRUPTED_TEXT),
            other => panic!("unexpected content: {other:?}"),
        }
        assert_eq!(recovered[3].role, Role::User);
    }

    #[tokio::test]
    async fn test_signed_claude_thinking_skips_recovery() {
        let sig = "s".repeat(MIN_SIGNATURE_LENGTH);
        let messages = vec![
            user_text("hi"),
            assistant_tool_use(Some(&sig)),
            tool_result(),
        ];
        let recovered =
            recover_thinking(messages.clone(), ModelFamily::Claude, &signatures()).await;
        assert_eq!(recovered.len(), messages.len());
    }

    #[tokio::test]
    async fn test_cross_family_signature_triggers_recovery_for_gemini() {
        let signatures = signatures();
        let sig = "c".repeat(MIN_SIGNATURE_LENGTH);
        signatures
            .cache_thinking_signature(&sig, ModelFamily::Claude)
            .await;

        let messages = vec![
            user_text("hi"),
            assistant_tool_use(Some(&sig)),
            tool_result(),
        ];
        let recovered = recover_thinking(messages, ModelFamily::Gemini, &signatures).await;

        // The claude-signed block is stripped and the synthetic pair added.
        assert_eq!(recovered.len(), 5);
        let stripped = recovered[1].content.as_blocks();
        assert!(stripped.iter().all(|b| !b.is_thinking()));
    }

    #[tokio::test]
    async fn test_unsigned_thinking_is_stripped() {
        let messages = vec![
            user_text("hi"),
            Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![
                    ContentBlock::Thinking {
                        thinking: "unsigned".into(),
                        signature: None,
                    },
                    ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "t".into(),
                        input: json!({}),
                        thought_signature: None,
                        cache_control: None,
                    },
                ]),
            },
            tool_result(),
        ];
        let recovered =
            recover_thinking(messages, ModelFamily::Claude, &signatures()).await;
        assert!(recovered[1]
            .content
            .as_blocks()
            .iter()
            .all(|b| !b.is_thinking()));
    }
}
