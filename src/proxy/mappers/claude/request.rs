// Inbound translation: Anthropic Messages request -> Cloud Code v1internal
// payload.

use std::collections::HashMap;

use serde_json::{json, Value};

use super::models::*;
use crate::proxy::common::json_schema::{normalize_tool_name, sanitize_tool_schema};
use crate::proxy::common::model_mapping;
use crate::proxy::error::{ProxyError, ProxyResult};
use crate::proxy::mappers::claude::thinking::MIN_SIGNATURE_LENGTH;

const CLIENT_IDENTIFIER: &str = "antigravity";
const MAX_STOP_SEQUENCES: usize = 4;

/// Whether thought parts are in play for this request: explicit opt-in via
/// the thinking config, or a model that always emits them.
pub fn thinking_enabled(req: &ClaudeRequest, model: &str) -> bool {
    req.thinking
        .as_ref()
        .map(|t| t.is_enabled())
        .unwrap_or(false)
        || model_mapping::is_thinking_model(model)
}

/// Translate a (validated, integrity-repaired) request into the upstream
/// envelope for the given canonical model and project.
pub fn translate_request_in(
    req: &ClaudeRequest,
    model: &str,
    project_id: &str,
) -> ProxyResult<Value> {
    let thinking = thinking_enabled(req, model);

    let system_instruction = build_system_instruction(&req.system);
    let contents = build_contents(&req.messages, thinking)?;
    let tools = build_tools(&req.tools);
    let generation_config = build_generation_config(req, model, thinking);

    let mut inner = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });

    if let Some(sys) = system_instruction {
        inner["systemInstruction"] = sys;
    }

    if let Some(tools) = tools {
        inner["tools"] = tools;
    }

    if let Some(user_id) = req.metadata.as_ref().and_then(|m| m.user_id.as_ref()) {
        inner["sessionId"] = json!(user_id);
    }

    Ok(json!({
        "project": project_id,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": inner,
        "model": model,
        "userAgent": CLIENT_IDENTIFIER,
        "requestType": "agent",
    }))
}

/// System prompt entries collapse into a single text part, joined by blank
/// lines.
fn build_system_instruction(system: &Option<SystemPrompt>) -> Option<Value> {
    let text = match system {
        None => return None,
        Some(SystemPrompt::Text(text)) => text.clone(),
        Some(SystemPrompt::Blocks(blocks)) => blocks
            .iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    if text.trim().is_empty() {
        return None;
    }

    Some(json!({
        "parts": [{"text": text}]
    }))
}

fn build_contents(messages: &[Message], thinking: bool) -> ProxyResult<Value> {
    let mut contents = Vec::new();
    // tool_use id -> declared name, for resolving functionResponse names
    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();

    let last_assistant_idx = messages.iter().rposition(|m| m.role == "assistant");

    for (i, msg) in messages.iter().enumerate() {
        let role = if msg.role == "assistant" { "model" } else { "user" };
        let is_last_assistant = last_assistant_idx == Some(i);

        let mut parts = Vec::new();

        match &msg.content {
            MessageContent::Text(text) => {
                if !text.trim().is_empty() {
                    parts.push(json!({"text": text}));
                }
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    translate_block(
                        block,
                        thinking,
                        is_last_assistant && parts.is_empty(),
                        &mut tool_id_to_name,
                        &mut parts,
                    )?;
                }
            }
        }

        if parts.is_empty() {
            continue;
        }

        contents.push(json!({
            "role": role,
            "parts": parts,
        }));
    }

    Ok(json!(contents))
}

fn translate_block(
    block: &ContentBlock,
    thinking: bool,
    leading_of_last_assistant: bool,
    tool_id_to_name: &mut HashMap<String, String>,
    parts: &mut Vec<Value>,
) -> ProxyResult<()> {
    match block {
        ContentBlock::Text { text } => {
            if !text.is_empty() {
                parts.push(json!({"text": text}));
            }
        }
        ContentBlock::Image { source } => match source.source_type.as_str() {
            "base64" => {
                let mime_type = source.media_type.as_deref().unwrap_or("image/png");
                let data = source.data.as_deref().unwrap_or("");
                parts.push(json!({
                    "inlineData": {
                        "mimeType": mime_type,
                        "data": data,
                    }
                }));
            }
            _ => {
                return Err(ProxyError::InvalidRequest(
                    "URL-sourced images are not supported; supply base64 data".into(),
                ))
            }
        },
        ContentBlock::ToolUse {
            id,
            name,
            input,
            signature,
        } => {
            let normalized = normalize_tool_name(name);
            tool_id_to_name.insert(id.clone(), normalized.clone());

            let mut part = json!({
                "functionCall": {
                    "name": normalized,
                    "args": input,
                    "id": id,
                }
            });
            if let Some(sig) = signature {
                part["thoughtSignature"] = json!(sig);
            }
            parts.push(part);
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let name = tool_id_to_name
                .get(tool_use_id)
                .cloned()
                .unwrap_or_else(|| tool_use_id.clone());

            let mut merged = merge_tool_result_content(content);
            if merged.trim().is_empty() {
                // An explicit confirmation keeps the model from hallucinating
                // missing output
                merged = if is_error.unwrap_or(false) {
                    "Tool execution failed with no output.".to_string()
                } else {
                    "Tool executed successfully with no output.".to_string()
                };
            }

            parts.push(json!({
                "functionResponse": {
                    "name": name,
                    "response": {"result": merged},
                    "id": tool_use_id,
                }
            }));
        }
        ContentBlock::Thinking {
            thinking: text,
            signature,
        } => {
            if !thinking {
                // History from a thinking run replayed against a non-thinking
                // model: keep the content as plain text
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
                return Ok(());
            }

            let signature = match signature {
                Some(sig) if sig.len() >= MIN_SIGNATURE_LENGTH => Some(sig.clone()),
                _ => crate::proxy::signature_cache::SignatureCache::global().lookup(text),
            };

            match signature {
                Some(sig) => {
                    parts.push(json!({
                        "text": text,
                        "thought": true,
                        "thoughtSignature": sig,
                    }));
                }
                None if leading_of_last_assistant => {
                    // The one position where the upstream tolerates an
                    // unsigned thought: the head of the final assistant turn
                    parts.push(json!({
                        "text": text,
                        "thought": true,
                    }));
                }
                None => {
                    tracing::debug!("[Translator] Dropping unsigned thinking block");
                }
            }
        }
        ContentBlock::RedactedThinking { .. } => {
            // Opaque to this upstream; nothing meaningful to forward
            tracing::debug!("[Translator] Skipping redacted_thinking block");
        }
    }

    Ok(())
}

fn merge_tool_result_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn build_tools(tools: &Option<Vec<Tool>>) -> Option<Value> {
    let tools = tools.as_ref()?;
    if tools.is_empty() {
        return None;
    }

    let mut declarations = Vec::with_capacity(tools.len());

    for tool in tools {
        let mut schema = tool.input_schema.clone().unwrap_or_else(|| {
            json!({"type": "object", "properties": {}})
        });
        sanitize_tool_schema(&mut schema);

        let mut declaration = json!({
            "name": normalize_tool_name(&tool.name),
            "parameters": schema,
        });
        if let Some(description) = &tool.description {
            declaration["description"] = json!(description);
        }

        declarations.push(declaration);
    }

    Some(json!([{"functionDeclarations": declarations}]))
}

fn build_generation_config(req: &ClaudeRequest, model: &str, thinking: bool) -> Value {
    let mut config = json!({});

    let family_max = model_mapping::max_output_tokens(model);
    let max_tokens = req.max_tokens.unwrap_or(family_max).min(family_max);
    config["maxOutputTokens"] = json!(max_tokens);

    if let Some(temperature) = req.temperature {
        config["temperature"] = json!(temperature);
    }
    if let Some(top_p) = req.top_p {
        config["topP"] = json!(top_p);
    }
    if let Some(top_k) = req.top_k {
        config["topK"] = json!(top_k);
    }

    if let Some(stop_sequences) = &req.stop_sequences {
        if !stop_sequences.is_empty() {
            let truncated: Vec<&String> =
                stop_sequences.iter().take(MAX_STOP_SEQUENCES).collect();
            config["stopSequences"] = json!(truncated);
        }
    }

    if thinking {
        let mut thinking_config = json!({"includeThoughts": true});

        if model_mapping::is_gemini_family(model) {
            let cap = model_mapping::thinking_budget(model);
            let budget = req
                .thinking
                .as_ref()
                .and_then(|t| t.budget_tokens)
                .unwrap_or(cap)
                .min(cap);
            thinking_config["thinkingBudget"] = json!(budget);
        }

        config["thinkingConfig"] = thinking_config;
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_request(model: &str) -> ClaudeRequest {
        serde_json::from_value(json!({
            "model": model,
            "max_tokens": 32,
            "messages": [{"role": "user", "content": "Say hi"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_simple_request_envelope() {
        let req = simple_request("claude-sonnet-4-5");
        let body = translate_request_in(&req, "claude-sonnet-4-5", "proj-1").unwrap();

        assert_eq!(body["project"], "proj-1");
        assert_eq!(body["model"], "claude-sonnet-4-5");
        assert_eq!(body["requestType"], "agent");
        assert!(body["requestId"].as_str().unwrap().starts_with("agent-"));

        let contents = body["request"]["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "Say hi");

        let config = &body["request"]["generationConfig"];
        assert_eq!(config["maxOutputTokens"], 32);
        assert!(config.get("thinkingConfig").is_none());
    }

    #[test]
    fn test_system_entries_joined() {
        let mut req = simple_request("claude-sonnet-4-5");
        req.system = Some(SystemPrompt::Blocks(vec![
            SystemBlock {
                block_type: "text".to_string(),
                text: "You are helpful.".to_string(),
            },
            SystemBlock {
                block_type: "text".to_string(),
                text: "Be brief.".to_string(),
            },
        ]));

        let body = translate_request_in(&req, "claude-sonnet-4-5", "p").unwrap();
        assert_eq!(
            body["request"]["systemInstruction"]["parts"][0]["text"],
            "You are helpful.\n\nBe brief."
        );
    }

    #[test]
    fn test_tool_use_and_result_mapping() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu1", "name": "get weather!",
                     "input": {"loc": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu1",
                     "content": [{"type": "text", "text": "18C"}, {"type": "text", "text": "sunny"}]}
                ]}
            ]
        }))
        .unwrap();

        let body = translate_request_in(&req, "claude-sonnet-4-5", "p").unwrap();
        let contents = body["request"]["contents"].as_array().unwrap();

        let call = &contents[1]["parts"][0]["functionCall"];
        assert_eq!(call["name"], "get_weather_");
        assert_eq!(call["args"]["loc"], "Paris");
        assert_eq!(call["id"], "tu1");

        let response = &contents[2]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "get_weather_");
        assert_eq!(response["response"]["result"], "18C\nsunny");
        assert_eq!(contents[2]["role"], "user");
    }

    #[test]
    fn test_empty_tool_result_gets_confirmation() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu1", "name": "run", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu1", "content": ""}
                ]}
            ]
        }))
        .unwrap();

        let body = translate_request_in(&req, "claude-sonnet-4-5", "p").unwrap();
        let result = &body["request"]["contents"][1]["parts"][0]["functionResponse"]["response"]["result"];
        assert!(result.as_str().unwrap().contains("successfully"));
    }

    #[test]
    fn test_base64_image_and_url_rejection() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "AAAA"}}
            ]}]
        }))
        .unwrap();

        let body = translate_request_in(&req, "claude-sonnet-4-5", "p").unwrap();
        let inline = &body["request"]["contents"][0]["parts"][0]["inlineData"];
        assert_eq!(inline["mimeType"], "image/jpeg");
        assert_eq!(inline["data"], "AAAA");

        let url_req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "url", "url": "https://example.com/x.png"}}
            ]}]
        }))
        .unwrap();

        assert!(translate_request_in(&url_req, "claude-sonnet-4-5", "p").is_err());
    }

    #[test]
    fn test_signed_thinking_becomes_thought_part() {
        let sig = "s".repeat(64);
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5-thinking",
            "max_tokens": 100,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "reasoning...", "signature": sig},
                    {"type": "text", "text": "answer"}
                ]},
                {"role": "user", "content": "more"}
            ]
        }))
        .unwrap();

        let body = translate_request_in(&req, "claude-sonnet-4-5-thinking", "p").unwrap();
        let part = &body["request"]["contents"][0]["parts"][0];
        assert_eq!(part["thought"], true);
        assert_eq!(part["text"], "reasoning...");
        assert_eq!(part["thoughtSignature"].as_str().unwrap(), sig);
    }

    #[test]
    fn test_unsigned_thinking_dropped_except_leading_of_last() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5-thinking",
            "max_tokens": 100,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "old unsigned trace nobody cached"},
                    {"type": "text", "text": "early answer"}
                ]},
                {"role": "user", "content": "next"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "[Continuing from previous context]"},
                    {"type": "text", "text": "final answer"}
                ]},
                {"role": "user", "content": "go on"}
            ]
        }))
        .unwrap();

        let body = translate_request_in(&req, "claude-sonnet-4-5-thinking", "p").unwrap();
        let contents = body["request"]["contents"].as_array().unwrap();

        // First assistant: unsigned thinking dropped, only the text remains
        let first_parts = contents[0]["parts"].as_array().unwrap();
        assert_eq!(first_parts.len(), 1);
        assert_eq!(first_parts[0]["text"], "early answer");

        // Last assistant: unsigned leading thinking tolerated
        let last_parts = contents[2]["parts"].as_array().unwrap();
        assert_eq!(last_parts[0]["thought"], true);
        assert!(last_parts[0].get("thoughtSignature").is_none());
    }

    #[test]
    fn test_generation_config_clamps_and_truncates() {
        let mut req = simple_request("claude-sonnet-4-5");
        req.max_tokens = Some(200_000);
        req.temperature = Some(0.7);
        req.stop_sequences = Some(vec![
            "a".into(),
            "b".into(),
            "c".into(),
            "d".into(),
            "e".into(),
        ]);

        let body = translate_request_in(&req, "claude-sonnet-4-5", "p").unwrap();
        let config = &body["request"]["generationConfig"];

        assert_eq!(config["maxOutputTokens"], 64_000);
        assert_eq!(config["temperature"], 0.7);
        assert_eq!(config["stopSequences"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_thinking_config_for_gemini_family() {
        let mut req = simple_request("gemini-2.5-flash-thinking");
        req.thinking = Some(ThinkingConfig {
            config_type: "enabled".to_string(),
            budget_tokens: Some(100_000),
        });

        let body = translate_request_in(&req, "gemini-2.5-flash-thinking", "p").unwrap();
        let thinking_config = &body["request"]["generationConfig"]["thinkingConfig"];

        assert_eq!(thinking_config["includeThoughts"], true);
        // Budget clamps to the flash ceiling
        assert_eq!(thinking_config["thinkingBudget"], 24_576);

        // Claude-family thinking models carry no budget
        let claude_req = simple_request("claude-opus-4-5-thinking");
        let body = translate_request_in(&claude_req, "claude-opus-4-5-thinking", "p").unwrap();
        let thinking_config = &body["request"]["generationConfig"]["thinkingConfig"];
        assert_eq!(thinking_config["includeThoughts"], true);
        assert!(thinking_config.get("thinkingBudget").is_none());
    }

    #[test]
    fn test_tools_sanitized_and_declared() {
        let mut req = simple_request("claude-sonnet-4-5");
        req.tools = Some(vec![Tool {
            name: "get_weather".to_string(),
            description: Some("Look up weather".to_string()),
            input_schema: Some(json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "additionalProperties": false,
                "properties": {"loc": {"type": "string", "format": "city"}},
                "required": ["loc"]
            })),
        }]);

        let body = translate_request_in(&req, "claude-sonnet-4-5", "p").unwrap();
        let declaration = &body["request"]["tools"][0]["functionDeclarations"][0];

        assert_eq!(declaration["name"], "get_weather");
        assert_eq!(declaration["description"], "Look up weather");
        assert!(declaration["parameters"].get("$schema").is_none());
        assert!(declaration["parameters"].get("additionalProperties").is_none());
        assert!(declaration["parameters"]["properties"]["loc"].get("format").is_none());
    }

    #[test]
    fn test_metadata_user_id_becomes_session() {
        let mut req = simple_request("claude-sonnet-4-5");
        req.metadata = Some(RequestMetadata {
            user_id: Some("session-abc".to_string()),
        });

        let body = translate_request_in(&req, "claude-sonnet-4-5", "p").unwrap();
        assert_eq!(body["request"]["sessionId"], "session-abc");
    }
}
