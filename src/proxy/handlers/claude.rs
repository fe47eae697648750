// The request dispatcher: validate, resolve, repair, schedule, translate.

use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::proxy::common::model_mapping;
use crate::proxy::common::validation::validate_messages_request;
use crate::proxy::error::ProxyError;
use crate::proxy::mappers::claude::models::{
    ClaudeRequest, ContentBlock, GeminiResponse, MessageContent, SystemPrompt,
};
use crate::proxy::mappers::claude::request::thinking_enabled;
use crate::proxy::mappers::claude::streaming::StreamContext;
use crate::proxy::mappers::claude::thinking::apply_integrity_passes;
use crate::proxy::mappers::claude::{
    collect_upstream_sse_response, create_claude_sse_stream, translate_response_out,
};
use crate::proxy::server::AppState;

fn new_trace_id() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// POST /v1/messages
pub async fn handle_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let trace_id = new_trace_id();

    // Shape and size validation on the raw body first, so clients get
    // precise 400s instead of serde noise
    if let Err(e) = validate_messages_request(&body) {
        return e.into_response();
    }

    let mut request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("invalid request body: {}", e))
                .into_response()
        }
    };

    let client_model = request.model.clone();
    let model = model_mapping::resolve_model_alias(&client_model);

    info!(
        "[{}] Messages request | model: {} -> {} | stream: {} | messages: {} | tools: {}",
        trace_id,
        client_model,
        model,
        request.stream,
        request.messages.len(),
        request.tools.as_ref().map(|t| t.len()).unwrap_or(0)
    );

    // Conversation repair before translation
    let thinking = thinking_enabled(&request, &model);
    apply_integrity_passes(&mut request.messages, thinking);

    let scheduled = match state.scheduler.execute(&request, &model, &trace_id).await {
        Ok(scheduled) => scheduled,
        Err(e) => {
            info!("[{}] Request failed: {}", trace_id, e);
            return e.into_response();
        }
    };

    if request.stream {
        let ctx = StreamContext {
            client_model,
            model: scheduled.model.clone(),
            account_email: scheduled.email.clone(),
            pins: state.scheduler.pins(),
            trace_id,
        };

        let upstream_stream = Box::pin(scheduled.response.bytes_stream());
        let sse_stream = create_claude_sse_stream(upstream_stream, ctx);

        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(sse_stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    // Non-streaming: thinking models still answer over SSE and need
    // collection; plain models return one JSON document
    let gemini_response = if model_mapping::is_thinking_model(&scheduled.model) {
        match collect_upstream_sse_response(Box::pin(scheduled.response.bytes_stream())).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("[{}] Stream collection failed: {}", trace_id, e);
                return ProxyError::ServiceUnavailable.into_response();
            }
        }
    } else {
        match parse_json_response(scheduled.response).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("[{}] Upstream body parse failed: {}", trace_id, e);
                return ProxyError::ServiceUnavailable.into_response();
            }
        }
    };

    let claude_response = match translate_response_out(&gemini_response, &client_model) {
        Ok(response) => response,
        Err(e) => return e.into_response(),
    };

    info!(
        "[{}] ✓ Completed | tokens: in {}, out {}{}",
        trace_id,
        claude_response.usage.input_tokens,
        claude_response.usage.output_tokens,
        claude_response
            .usage
            .cache_read_input_tokens
            .map(|c| format!(", cached {}", c))
            .unwrap_or_default()
    );

    Json(claude_response).into_response()
}

async fn parse_json_response(response: reqwest::Response) -> Result<GeminiResponse, String> {
    let payload: Value = response
        .json()
        .await
        .map_err(|e| format!("body read failed: {}", e))?;

    // v1internal wraps the generate payload in a "response" envelope
    let raw = payload.get("response").cloned().unwrap_or(payload);

    serde_json::from_value(raw).map_err(|e| format!("response parse failed: {}", e))
}

/// GET /v1/models
pub async fn handle_list_models() -> impl IntoResponse {
    let data: Vec<Value> = model_mapping::supported_models()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 1706745600,
                "owned_by": "cloudbridge",
            })
        })
        .collect();

    Json(json!({
        "object": "list",
        "data": data,
    }))
}

// ===== Token counting (estimation only, no upstream call) =====

const MESSAGE_OVERHEAD_TOKENS: u32 = 3;
const IMAGE_BLOCK_TOKENS: u32 = 256;

fn estimate_tokens_from_text(text: &str) -> u32 {
    let mut ascii_chars = 0u32;
    let mut non_ascii_chars = 0u32;

    for ch in text.chars() {
        if ch.is_ascii() {
            ascii_chars += 1;
        } else {
            non_ascii_chars += 1;
        }
    }

    // ~4 ASCII chars per token; CJK and similar run ~1 token per char
    (ascii_chars + 3) / 4 + non_ascii_chars
}

fn estimate_tokens_from_value(value: &Value) -> u32 {
    estimate_tokens_from_text(&value.to_string())
}

fn estimate_tokens_from_block(block: &ContentBlock) -> u32 {
    match block {
        ContentBlock::Text { text } => estimate_tokens_from_text(text),
        ContentBlock::Thinking { thinking, .. } => estimate_tokens_from_text(thinking),
        ContentBlock::RedactedThinking { data } => estimate_tokens_from_text(data),
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_tokens_from_text(name) + estimate_tokens_from_value(input)
        }
        ContentBlock::ToolResult { content, .. } => estimate_tokens_from_value(content),
        ContentBlock::Image { .. } => IMAGE_BLOCK_TOKENS,
    }
}

fn estimate_tokens_from_request(request: &ClaudeRequest) -> u32 {
    let mut total = 0u32;

    match &request.system {
        Some(SystemPrompt::Text(text)) => total += estimate_tokens_from_text(text),
        Some(SystemPrompt::Blocks(blocks)) => {
            for block in blocks {
                total += estimate_tokens_from_text(&block.text);
            }
        }
        None => {}
    }

    if let Some(tools) = &request.tools {
        if let Ok(value) = serde_json::to_value(tools) {
            total += estimate_tokens_from_value(&value);
        }
    }

    for msg in &request.messages {
        total += MESSAGE_OVERHEAD_TOKENS;
        match &msg.content {
            MessageContent::Text(text) => total += estimate_tokens_from_text(text),
            MessageContent::Blocks(blocks) => {
                total += blocks.iter().map(estimate_tokens_from_block).sum::<u32>();
            }
        }
    }

    total
}

/// POST /v1/messages/count_tokens
pub async fn handle_count_tokens(Json(body): Json<Value>) -> Response {
    if let Err(e) = validate_messages_request(&body) {
        return e.into_response();
    }

    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("invalid request body: {}", e))
                .into_response()
        }
    };

    let input_tokens = estimate_tokens_from_request(&request);
    debug!("[CountTokens] Estimated {} input tokens", input_tokens);

    Json(json!({
        "input_tokens": input_tokens,
        "output_tokens": 0,
    }))
    .into_response()
}
