// Streaming translation: upstream SSE chunks -> Anthropic event stream.
//
// The pipe is split producer/consumer over a bounded channel: the producer
// task parses upstream chunks into Anthropic events, the consumer is the
// axum body stream. The bound gives backpressure; a disconnected client
// drops the receiver, the next send fails, and the producer aborts the
// upstream read.

use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::models::{to_claude_usage, FunctionCall, GeminiPart, UsageMetadata};
use super::response::map_finish_reason;
use crate::proxy::signature_cache::SignatureCache;
use crate::proxy::sticky::StickyPins;

/// Channel depth between the upstream parser and the client writer.
const EVENT_CHANNEL_CAPACITY: usize = 32;

pub struct StreamContext {
    /// Model name the client asked for, echoed in message_start.
    pub client_model: String,
    /// Canonical model, for sticky-pin release on zero-byte failure.
    pub model: String,
    pub account_email: String,
    pub pins: Arc<StickyPins>,
    pub trace_id: String,
}

/// Signatures sometimes arrive base64-wrapped; unwrap when the payload is
/// printable so cache keys and client replays stay consistent.
fn decode_signature(sig: &str) -> String {
    use base64::Engine;
    match base64::engine::general_purpose::STANDARD.decode(sig) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| sig.to_string()),
        Err(_) => sig.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    None,
    Text,
    Thinking,
    Tool,
}

/// Event-sequence state machine. Indices are assigned in block arrival
/// order; one block is open at a time.
struct StreamingState {
    kind: BlockKind,
    index: usize,
    message_start_sent: bool,
    used_tool: bool,
    /// Signature for the currently open thinking block (last one wins).
    pending_signature: Option<String>,
    /// Accumulated text of the open thinking block, for the cache record.
    thinking_text: String,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
    response_id: Option<String>,
}

impl StreamingState {
    fn new() -> Self {
        Self {
            kind: BlockKind::None,
            index: 0,
            message_start_sent: false,
            used_tool: false,
            pending_signature: None,
            thinking_text: String::new(),
            finish_reason: None,
            usage: None,
            response_id: None,
        }
    }

    fn emit(&self, event: &str, data: Value) -> Bytes {
        Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            event,
            serde_json::to_string(&data).unwrap_or_default()
        ))
    }

    fn emit_message_start(&mut self, client_model: &str) -> Bytes {
        self.message_start_sent = true;

        let id = self
            .response_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));

        self.emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": client_model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        )
    }

    fn start_block(&mut self, kind: BlockKind, content_block: Value) -> Vec<Bytes> {
        let mut events = Vec::new();
        if self.kind != BlockKind::None {
            events.extend(self.end_block());
        }

        events.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.index,
                "content_block": content_block,
            }),
        ));

        self.kind = kind;
        events
    }

    /// Close the open block. A thinking block's final signature rides inside
    /// the content_block_stop payload and lands in the signature cache.
    fn end_block(&mut self) -> Vec<Bytes> {
        if self.kind == BlockKind::None {
            return vec![];
        }

        let mut stop = json!({
            "type": "content_block_stop",
            "index": self.index,
        });

        if self.kind == BlockKind::Thinking {
            if let Some(signature) = self.pending_signature.take() {
                SignatureCache::global().record(&self.thinking_text, &signature);
                stop["signature"] = json!(signature);
            }
            self.thinking_text.clear();
        }
        self.pending_signature = None;

        let event = self.emit("content_block_stop", stop);
        self.index += 1;
        self.kind = BlockKind::None;

        vec![event]
    }

    fn emit_delta(&self, delta: Value) -> Bytes {
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.index,
                "delta": delta,
            }),
        )
    }

    /// Translate one upstream SSE payload into zero or more client events.
    fn process_payload(&mut self, payload: &Value, client_model: &str) -> Vec<Bytes> {
        let raw = payload.get("response").unwrap_or(payload);
        let mut events = Vec::new();

        if let Some(id) = raw.get("responseId").and_then(|v| v.as_str()) {
            self.response_id = Some(id.to_string());
        }

        if !self.message_start_sent {
            events.push(self.emit_message_start(client_model));
        }

        if let Some(usage) = raw.get("usageMetadata") {
            if let Ok(parsed) = serde_json::from_value::<UsageMetadata>(usage.clone()) {
                self.usage = Some(parsed);
            }
        }

        let candidate = raw.get("candidates").and_then(|c| c.get(0));

        if let Some(reason) = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(|v| v.as_str())
        {
            self.finish_reason = Some(reason.to_string());
        }

        let parts = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array());

        if let Some(parts) = parts {
            for part in parts {
                match serde_json::from_value::<GeminiPart>(part.clone()) {
                    Ok(parsed) => events.extend(self.process_part(&parsed)),
                    Err(e) => debug!("[Claude-SSE] Skipping unparseable part: {}", e),
                }
            }
        }

        events
    }

    fn process_part(&mut self, part: &GeminiPart) -> Vec<Bytes> {
        let signature = part.thought_signature.as_deref().map(decode_signature);

        if let Some(fc) = &part.function_call {
            return self.process_function_call(fc, signature);
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                return self.process_thinking(text, signature);
            }

            // An empty text part carrying only a signature closes out the
            // preceding thinking block
            if text.is_empty() && signature.is_some() {
                if self.kind == BlockKind::Thinking {
                    self.pending_signature = signature;
                }
                return vec![];
            }

            return self.process_text(text);
        }

        if let Some(inline) = &part.inline_data {
            if !inline.data.is_empty() {
                let markdown =
                    format!("![image](data:{};base64,{})", inline.mime_type, inline.data);
                return self.process_text(&markdown);
            }
        }

        vec![]
    }

    fn process_thinking(&mut self, text: &str, signature: Option<String>) -> Vec<Bytes> {
        let mut events = Vec::new();

        if self.kind != BlockKind::Thinking {
            events.extend(self.start_block(
                BlockKind::Thinking,
                json!({"type": "thinking", "thinking": ""}),
            ));
        }

        if !text.is_empty() {
            self.thinking_text.push_str(text);
            events.push(self.emit_delta(json!({"type": "thinking_delta", "thinking": text})));
        }

        if signature.is_some() {
            self.pending_signature = signature;
        }

        events
    }

    fn process_text(&mut self, text: &str) -> Vec<Bytes> {
        if text.is_empty() {
            return vec![];
        }

        let mut events = Vec::new();

        if self.kind != BlockKind::Text {
            events.extend(self.start_block(BlockKind::Text, json!({"type": "text", "text": ""})));
        }

        events.push(self.emit_delta(json!({"type": "text_delta", "text": text})));
        events
    }

    /// Tool calls are atomic per part: start, stream the args as one
    /// partial_json fragment (forwarded verbatim, never re-parsed), stop.
    fn process_function_call(&mut self, fc: &FunctionCall, signature: Option<String>) -> Vec<Bytes> {
        let mut events = Vec::new();

        self.used_tool = true;

        let tool_id = fc
            .id
            .clone()
            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));

        let mut tool_use = json!({
            "type": "tool_use",
            "id": tool_id,
            "name": fc.name,
            "input": {},
        });
        if let Some(sig) = &signature {
            // Calls produced by a thought carry its signature so the client
            // can replay them intact
            tool_use["signature"] = json!(sig);
        }

        events.extend(self.start_block(BlockKind::Tool, tool_use));

        if let Some(args) = &fc.args {
            let partial = serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string());
            events.push(self.emit_delta(json!({
                "type": "input_json_delta",
                "partial_json": partial,
            })));
        }

        events.extend(self.end_block());
        events
    }

    /// Terminal events: close the open block, then message_delta with the
    /// stop reason and usage, message_stop, and the OpenAI-style [DONE].
    fn finish(&mut self) -> Vec<Bytes> {
        let mut events = Vec::new();

        if !self.message_start_sent {
            return events;
        }

        events.extend(self.end_block());

        let stop_reason = map_finish_reason(self.finish_reason.as_deref(), self.used_tool);
        let usage = self
            .usage
            .as_ref()
            .map(to_claude_usage)
            .unwrap_or_default();

        events.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": usage,
            }),
        ));

        events.push(Bytes::from(
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ));
        events.push(Bytes::from("data: [DONE]\n\n"));

        events
    }
}

/// Wire an upstream byte stream into a translated Anthropic SSE stream.
pub fn create_claude_sse_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    ctx: StreamContext,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut state = StreamingState::new();
        let mut buffer = BytesMut::new();
        let mut bytes_sent = false;

        macro_rules! send_or_abort {
            ($event:expr) => {
                if tx.send($event).await.is_err() {
                    debug!("[{}] Client disconnected, aborting upstream read", ctx.trace_id);
                    return;
                }
                bytes_sent = true;
            };
        }

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    buffer.extend_from_slice(&chunk);

                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        let Ok(line) = std::str::from_utf8(&line_raw) else { continue };
                        let Some(payload) = line.trim().strip_prefix("data: ") else { continue };
                        let payload = payload.trim();
                        if payload.is_empty() || payload == "[DONE]" {
                            continue;
                        }

                        if let Ok(json) = serde_json::from_str::<Value>(payload) {
                            for event in state.process_payload(&json, &ctx.client_model) {
                                send_or_abort!(event);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("[{}] Upstream stream error: {}", ctx.trace_id, e);

                    if !bytes_sent {
                        // Nothing reached the client: surface a proper error
                        // event and release the pin so the next request can
                        // move to another account
                        ctx.pins.release(&ctx.model);
                        let error_event = state.emit(
                            "error",
                            json!({
                                "type": "error",
                                "error": {
                                    "type": "overloaded_error",
                                    "message": "upstream connection failed before any data arrived"
                                }
                            }),
                        );
                        let _ = tx.send(error_event).await;
                    }
                    // After first byte the response is non-idempotent from
                    // the client's view: close without retry
                    return;
                }
            }
        }

        for event in state.finish() {
            send_or_abort!(event);
        }

        debug!(
            "[{}] Stream complete for {}",
            ctx.trace_id, ctx.account_email
        );
    });

    let body = async_stream::stream! {
        let mut rx = rx;
        while let Some(bytes) = rx.recv().await {
            yield Ok::<Bytes, std::io::Error>(bytes);
        }
    };

    Box::pin(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_events(state: &mut StreamingState, payloads: &[Value]) -> String {
        let mut out = String::new();
        for payload in payloads {
            for event in state.process_payload(payload, "claude-sonnet-4-5") {
                out.push_str(std::str::from_utf8(&event).unwrap());
            }
        }
        for event in state.finish() {
            out.push_str(std::str::from_utf8(&event).unwrap());
        }
        out
    }

    fn event_names(raw: &str) -> Vec<&str> {
        raw.lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .collect()
    }

    #[test]
    fn test_text_stream_event_sequence() {
        let mut state = StreamingState::new();
        let out = collect_events(
            &mut state,
            &[
                json!({"response": {"candidates": [{"content": {"parts": [{"text": "hel"}]}}]}}),
                json!({"response": {"candidates": [{"content": {"parts": [{"text": "lo"}]},
                      "finishReason": "STOP"}],
                      "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2}}}),
            ],
        );

        assert_eq!(
            event_names(&out),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(out.contains(r#""stop_reason":"end_turn""#));
        assert!(out.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn test_thinking_then_tool_call_sequence() {
        // The S6 shape: a thought, then a function call with args
        let mut state = StreamingState::new();
        let sig = "t".repeat(64);
        let out = collect_events(
            &mut state,
            &[
                json!({"response": {"candidates": [{"content": {"parts": [
                    {"text": "planning the call", "thought": true, "thoughtSignature": sig}
                ]}}]}}),
                json!({"response": {"candidates": [{"content": {"parts": [
                    {"functionCall": {"name": "get_weather", "args": {"loc": "Paris"}}}
                ]}, "finishReason": "STOP"}]}}),
            ],
        );

        let names = event_names(&out);
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",  // thinking, index 0
                "content_block_delta",  // thinking_delta
                "content_block_stop",   // closes thinking, carries signature
                "content_block_start",  // tool_use, index 1
                "content_block_delta",  // input_json_delta
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        assert!(out.contains(r#""type":"thinking_delta""#));
        assert!(out.contains(r#""name":"get_weather""#));
        assert!(out.contains(r#""type":"input_json_delta""#));
        assert!(out.contains(r#""partial_json":"{\"loc\":\"Paris\"}""#));
        assert!(out.contains(r#""stop_reason":"tool_use""#));
        // Thinking signature rides in the stop event
        assert!(out.contains(&format!(r#""signature":"{}""#, sig)));
        // Block indices assigned in arrival order
        assert!(out.contains(r#""index":0"#));
        assert!(out.contains(r#""index":1"#));
    }

    #[test]
    fn test_thought_signature_recorded_in_cache() {
        let mut state = StreamingState::new();
        let sig = "u".repeat(80);
        let text = "streamed reasoning captured for cache by the sse translator";

        collect_events(
            &mut state,
            &[json!({"response": {"candidates": [{"content": {"parts": [
                {"text": text, "thought": true, "thoughtSignature": sig}
            ]}, "finishReason": "STOP"}]}})],
        );

        assert_eq!(SignatureCache::global().lookup(text), Some(sig));
    }

    #[test]
    fn test_trailing_signature_part_attaches_to_open_thinking() {
        let mut state = StreamingState::new();
        let sig = "v".repeat(64);
        let out = collect_events(
            &mut state,
            &[
                json!({"response": {"candidates": [{"content": {"parts": [
                    {"text": "reasoning", "thought": true}
                ]}}]}}),
                // Signature arrives on a bare empty-text part
                json!({"response": {"candidates": [{"content": {"parts": [
                    {"text": "", "thoughtSignature": sig}
                ]}, "finishReason": "STOP"}]}}),
            ],
        );

        assert!(out.contains(&format!(r#""signature":"{}""#, sig)));
    }

    #[test]
    fn test_max_tokens_stop_reason() {
        let mut state = StreamingState::new();
        let out = collect_events(
            &mut state,
            &[json!({"response": {"candidates": [{"content": {"parts": [{"text": "x"}]},
                  "finishReason": "MAX_TOKENS"}]}})],
        );

        assert!(out.contains(r#""stop_reason":"max_tokens""#));
    }

    #[test]
    fn test_usage_flows_into_message_delta() {
        let mut state = StreamingState::new();
        let out = collect_events(
            &mut state,
            &[json!({"response": {
                "candidates": [{"content": {"parts": [{"text": "x"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 7,
                                  "thoughtsTokenCount": 3}
            }})],
        );

        assert!(out.contains(r#""input_tokens":12"#));
        assert!(out.contains(r#""output_tokens":10"#));
        assert!(out.contains(r#""reasoning_tokens":3"#));
    }

    #[test]
    fn test_no_events_without_upstream_data() {
        let mut state = StreamingState::new();
        let events = state.finish();
        assert!(events.is_empty());
    }
}
