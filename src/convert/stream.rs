//! Upstream SSE → Anthropic SSE translation.
//!
//! The upstream body is a sequence of `data:` frames each carrying a
//! partial `GoogleResponse`. [`SseDataDecoder`] peels the payloads off the
//! raw byte stream; [`StreamState`] turns them into the Anthropic event
//! sequence: exactly one `message_start`, content blocks bounded by
//! `content_block_start`/`content_block_stop` with strictly increasing
//! indices, a `signature_delta` before closing any thinking block that
//! accumulated one, then `message_delta` and `message_stop`.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use crate::convert::anthropic::{
    Delta, MessageDelta, MessagesResponse, ResponseBlock, StreamEvent, StreamMessage, Usage,
    MIN_SIGNATURE_LENGTH,
};
use crate::convert::google::{model_family, GoogleResponse, ModelFamily};
use crate::convert::response::{generate_message_id, generate_tool_use_id, map_finish_reason};
use crate::convert::signature::SignatureCache;

/// Errors produced while translating an upstream stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The upstream stream completed without producing any content.
    #[error("upstream returned an empty response")]
    EmptyResponse,

    #[error("upstream stream error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Deferred signature-cache writes collected while translating.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    ToolSignature { tool_use_id: String, signature: String },
    ThinkingSignature { signature: String },
}

#[derive(Debug)]
enum OpenBlock {
    Thinking { signature: Option<String> },
    Text,
}

/// Chunk-by-chunk translation state.
pub struct StreamState {
    model: String,
    family: ModelFamily,
    message_id: String,
    started: bool,
    next_index: usize,
    open: Option<OpenBlock>,
    saw_tool_use: bool,
    finish_reason: Option<String>,
    input_usage: Usage,
    output_tokens: u64,
    cache_ops: Vec<CacheOp>,
}

impl StreamState {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let family = model_family(&model);
        Self {
            model,
            family,
            message_id: generate_message_id(),
            started: false,
            next_index: 0,
            open: None,
            saw_tool_use: false,
            finish_reason: None,
            input_usage: Usage::default(),
            output_tokens: 0,
            cache_ops: Vec::new(),
        }
    }

    /// Whether `message_start` has been emitted.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Model family of the stream's target model.
    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// Drain the signature-cache writes accumulated so far.
    pub fn take_cache_ops(&mut self) -> Vec<CacheOp> {
        std::mem::take(&mut self.cache_ops)
    }

    /// Translate one upstream chunk into zero or more events.
    pub fn on_chunk(&mut self, chunk: &GoogleResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(meta) = &chunk.usage_metadata {
            let cached = meta.cached_content_token_count;
            self.input_usage = Usage {
                input_tokens: meta.prompt_token_count.saturating_sub(cached),
                output_tokens: 0,
                cache_read_input_tokens: (cached > 0).then_some(cached),
                cache_creation_input_tokens: None,
            };
            self.output_tokens = meta.candidates_token_count;
        }

        for candidate in &chunk.candidates {
            if let Some(reason) = &candidate.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
            let Some(content) = &candidate.content else {
                continue;
            };
            for part in &content.parts {
                self.ensure_started(&mut events);

                if part.thought == Some(true) {
                    self.on_thinking_part(
                        part.text.as_deref().unwrap_or_default(),
                        part.thought_signature.as_deref(),
                        &mut events,
                    );
                } else if let Some(call) = &part.function_call {
                    self.close_open(&mut events);
                    self.saw_tool_use = true;

                    let id = call
                        .id
                        .clone()
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(generate_tool_use_id);
                    if let Some(sig) = part.thought_signature.as_deref() {
                        if sig.len() >= MIN_SIGNATURE_LENGTH {
                            self.cache_ops.push(CacheOp::ToolSignature {
                                tool_use_id: id.clone(),
                                signature: sig.to_string(),
                            });
                        }
                    }

                    let index = self.next_index;
                    self.next_index += 1;
                    events.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ResponseBlock::ToolUse {
                            id,
                            name: call.name.clone(),
                            input: json!({}),
                        },
                    });
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: Delta::InputJsonDelta {
                            partial_json: call.args.to_string(),
                        },
                    });
                    events.push(StreamEvent::ContentBlockStop { index });
                } else if let Some(text) = &part.text {
                    if text.is_empty() {
                        continue;
                    }
                    self.on_text_part(text, &mut events);
                } else if let Some(inline) = &part.inline_data {
                    // Image blocks carry no deltas.
                    self.close_open(&mut events);
                    let index = self.next_index;
                    self.next_index += 1;
                    events.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ResponseBlock::Image {
                            source: json!({
                                "type": "base64",
                                "media_type": inline.mime_type,
                                "data": inline.data,
                            }),
                        },
                    });
                    events.push(StreamEvent::ContentBlockStop { index });
                }
            }
        }

        events
    }

    /// Close the stream: final block, `message_delta`, `message_stop`.
    ///
    /// Fails with [`StreamError::EmptyResponse`] when no content was ever
    /// produced so the dispatcher can retry.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, StreamError> {
        if !self.started {
            return Err(StreamError::EmptyResponse);
        }

        let mut events = Vec::new();
        self.close_open(&mut events);

        let stop_reason = if self.saw_tool_use {
            "tool_use".to_string()
        } else {
            self.finish_reason
                .as_deref()
                .map(map_finish_reason)
                .unwrap_or_else(|| "end_turn".to_string())
        };

        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: Usage {
                input_tokens: self.input_usage.input_tokens,
                output_tokens: self.output_tokens,
                cache_read_input_tokens: self.input_usage.cache_read_input_tokens,
                cache_creation_input_tokens: None,
            },
        });
        events.push(StreamEvent::MessageStop);
        Ok(events)
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: StreamMessage {
                id: self.message_id.clone(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: self.input_usage.clone(),
            },
        });
    }

    fn on_thinking_part(
        &mut self,
        text: &str,
        signature: Option<&str>,
        events: &mut Vec<StreamEvent>,
    ) {
        if !matches!(self.open, Some(OpenBlock::Thinking { .. })) {
            self.close_open(events);
            let index = self.next_index;
            self.next_index += 1;
            self.open = Some(OpenBlock::Thinking { signature: None });
            events.push(StreamEvent::ContentBlockStart {
                index,
                content_block: ResponseBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
            });
        }

        let index = self.next_index - 1;
        if !text.is_empty() {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::ThinkingDelta {
                    thinking: text.to_string(),
                },
            });
        }
        if let Some(sig) = signature {
            if !sig.is_empty() {
                if let Some(OpenBlock::Thinking { signature }) = &mut self.open {
                    *signature = Some(sig.to_string());
                }
            }
        }
    }

    fn on_text_part(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if !matches!(self.open, Some(OpenBlock::Text)) {
            self.close_open(events);
            let index = self.next_index;
            self.next_index += 1;
            self.open = Some(OpenBlock::Text);
            events.push(StreamEvent::ContentBlockStart {
                index,
                content_block: ResponseBlock::Text {
                    text: String::new(),
                },
            });
        }
        events.push(StreamEvent::ContentBlockDelta {
            index: self.next_index - 1,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        let Some(open) = self.open.take() else { return };
        let index = self.next_index - 1;

        if let OpenBlock::Thinking {
            signature: Some(signature),
        } = &open
        {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::SignatureDelta {
                    signature: signature.clone(),
                },
            });
            if signature.len() >= MIN_SIGNATURE_LENGTH {
                self.cache_ops.push(CacheOp::ThinkingSignature {
                    signature: signature.clone(),
                });
            }
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }
}

/// Apply deferred cache writes.
pub async fn flush_cache_ops(
    ops: Vec<CacheOp>,
    family: ModelFamily,
    signatures: &SignatureCache,
) {
    for op in ops {
        match op {
            CacheOp::ToolSignature {
                tool_use_id,
                signature,
            } => signatures.cache_signature(&tool_use_id, &signature).await,
            CacheOp::ThinkingSignature { signature } => {
                signatures.cache_thinking_signature(&signature, family).await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SSE decoding
// ---------------------------------------------------------------------------

/// Incremental decoder for the upstream SSE wire format.
///
/// The Cloud Code stream only ever carries `data:` lines, so the decoder
/// scans incoming bytes for line breaks, collects consecutive `data:`
/// payloads, and emits them newline-joined at each blank-line frame
/// boundary. Other SSE fields and comment lines are skipped.
#[derive(Default)]
struct SseDataDecoder {
    partial_line: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDataDecoder {
    /// Consume a chunk, returning every payload it completes.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut completed = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.partial_line.push(byte);
                continue;
            }
            if let Some(payload) = self.end_line() {
                completed.push(payload);
            }
        }
        completed
    }

    /// Flush an unterminated trailing line and frame at end of stream.
    fn finish(&mut self) -> Option<String> {
        if !self.partial_line.is_empty() {
            self.collect_data_line();
        }
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }

    /// Close the current line. A blank line completes the frame.
    fn end_line(&mut self) -> Option<String> {
        if self.partial_line.is_empty() || self.partial_line == [b'\r'] {
            self.partial_line.clear();
            if self.data_lines.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data_lines).join("\n"));
        }
        self.collect_data_line();
        None
    }

    fn collect_data_line(&mut self) {
        let raw = String::from_utf8_lossy(&self.partial_line).into_owned();
        self.partial_line.clear();
        let line = raw.strip_suffix('\r').unwrap_or(&raw);
        if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
}

/// Parse one `data:` payload and run it through the state machine. Frames
/// that are not Cloud Code chunks (`[DONE]` markers, keep-alives, junk)
/// produce no events.
fn translate_payload(state: &mut StreamState, payload: &str) -> Vec<StreamEvent> {
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Skipping unparseable stream chunk");
            return Vec::new();
        }
    };
    match GoogleResponse::from_json(&value) {
        Ok(chunk) => state.on_chunk(&chunk),
        Err(e) => {
            debug!(error = %e, "Skipping malformed stream chunk");
            Vec::new()
        }
    }
}

/// Translate an upstream SSE byte stream into Anthropic events.
pub fn translate_stream<S>(
    body: S,
    model: String,
    signatures: SignatureCache,
) -> impl Stream<Item = Result<StreamEvent, StreamError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut decoder = SseDataDecoder::default();
        let mut state = StreamState::new(model);

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(StreamError::Http(e));
                    return;
                }
            };
            for payload in decoder.feed(&chunk) {
                for event in translate_payload(&mut state, &payload) {
                    yield Ok(event);
                }
                flush_cache_ops(state.take_cache_ops(), state.family(), &signatures).await;
            }
        }

        if let Some(payload) = decoder.finish() {
            for event in translate_payload(&mut state, &payload) {
                yield Ok(event);
            }
            flush_cache_ops(state.take_cache_ops(), state.family(), &signatures).await;
        }

        match state.finish() {
            Ok(events) => {
                for event in events {
                    yield Ok(event);
                }
                flush_cache_ops(state.take_cache_ops(), state.family(), &signatures).await;
            }
            Err(e) => yield Err(e),
        }
    }
}

/// Collect a translated event stream into a complete response. Used when a
/// thinking model forces the SSE endpoint for a non-streaming client.
pub async fn accumulate_events<S>(events: S, model: &str) -> Result<MessagesResponse, StreamError>
where
    S: Stream<Item = Result<StreamEvent, StreamError>>,
{
    let mut events = Box::pin(events);

    let mut id = generate_message_id();
    let mut content: Vec<ResponseBlock> = Vec::new();
    let mut pending_json: Vec<(usize, String)> = Vec::new();
    let mut usage = Usage::default();
    let mut stop_reason = None;
    let mut started = false;

    while let Some(event) = events.next().await {
        match event? {
            StreamEvent::MessageStart { message } => {
                started = true;
                id = message.id;
                usage.input_tokens = message.usage.input_tokens;
                usage.cache_read_input_tokens = message.usage.cache_read_input_tokens;
            }
            StreamEvent::ContentBlockStart { content_block, .. } => {
                content.push(content_block);
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => {
                    if let Some(ResponseBlock::Text { text: existing }) = content.last_mut() {
                        existing.push_str(&text);
                    }
                }
                Delta::ThinkingDelta { thinking } => {
                    if let Some(ResponseBlock::Thinking {
                        thinking: existing, ..
                    }) = content.last_mut()
                    {
                        existing.push_str(&thinking);
                    }
                }
                Delta::SignatureDelta { signature } => {
                    if let Some(ResponseBlock::Thinking {
                        signature: existing,
                        ..
                    }) = content.last_mut()
                    {
                        *existing = Some(signature);
                    }
                }
                Delta::InputJsonDelta { partial_json } => {
                    pending_json.push((index, partial_json));
                }
            },
            StreamEvent::ContentBlockStop { .. } => {}
            StreamEvent::MessageDelta { delta, usage: u } => {
                stop_reason = delta.stop_reason;
                usage.output_tokens = u.output_tokens;
            }
            StreamEvent::MessageStop => break,
            StreamEvent::Ping | StreamEvent::Error { .. } => {}
        }
    }

    if !started {
        return Err(StreamError::EmptyResponse);
    }

    // Fold accumulated tool inputs back into their blocks.
    for (index, raw) in pending_json {
        if let Some(ResponseBlock::ToolUse { input, .. }) = content.get_mut(index) {
            if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
                *input = parsed;
            }
        }
    }

    Ok(MessagesResponse {
        id,
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content,
        stop_reason,
        stop_sequence: None,
        usage,
    })
}
