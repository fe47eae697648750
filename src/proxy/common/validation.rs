// Inbound request validation. Runs on the raw JSON body before the typed
// parse so shape errors produce precise 400s instead of serde noise.

use serde_json::Value;

use crate::proxy::error::{ProxyError, ProxyResult};

const MAX_MESSAGES: usize = 500;
const MAX_TOOLS: usize = 100;
const MAX_TEXT_BLOCK_BYTES: usize = 1024 * 1024;
const MAX_IMAGE_DATA_BYTES: usize = 10 * 1024 * 1024;
const MAX_TOKENS_CEILING: u64 = 200_000;

/// Keys that must never appear anywhere in the request object graph.
const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

pub fn validate_messages_request(body: &Value) -> ProxyResult<()> {
    let obj = body
        .as_object()
        .ok_or_else(|| ProxyError::InvalidRequest("request body must be a JSON object".into()))?;

    reject_forbidden_keys(body)?;

    match obj.get("model") {
        Some(Value::String(model)) if !model.is_empty() => {}
        _ => return Err(ProxyError::InvalidRequest("model must be a non-empty string".into())),
    }

    if let Some(max_tokens) = obj.get("max_tokens") {
        let value = max_tokens
            .as_u64()
            .ok_or_else(|| ProxyError::InvalidRequest("max_tokens must be a positive integer".into()))?;
        if value < 1 || value > MAX_TOKENS_CEILING {
            return Err(ProxyError::InvalidRequest(format!(
                "max_tokens must be between 1 and {}",
                MAX_TOKENS_CEILING
            )));
        }
    }

    let messages = obj
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProxyError::InvalidRequest("messages must be an array".into()))?;

    if messages.is_empty() {
        return Err(ProxyError::InvalidRequest("messages must not be empty".into()));
    }
    if messages.len() > MAX_MESSAGES {
        return Err(ProxyError::InvalidRequest(format!(
            "messages exceeds the limit of {} entries",
            MAX_MESSAGES
        )));
    }

    for (i, message) in messages.iter().enumerate() {
        validate_message(i, message)?;
    }

    if let Some(tools) = obj.get("tools") {
        let tools = tools
            .as_array()
            .ok_or_else(|| ProxyError::InvalidRequest("tools must be an array".into()))?;
        if tools.len() > MAX_TOOLS {
            return Err(ProxyError::InvalidRequest(format!(
                "tools exceeds the limit of {} declarations",
                MAX_TOOLS
            )));
        }
    }

    if let Some(system) = obj.get("system") {
        if !system.is_string() && !system.is_array() {
            return Err(ProxyError::InvalidRequest(
                "system must be a string or an array of text blocks".into(),
            ));
        }
    }

    Ok(())
}

fn validate_message(index: usize, message: &Value) -> ProxyResult<()> {
    let obj = message
        .as_object()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("messages[{}] must be an object", index)))?;

    match obj.get("role").and_then(|r| r.as_str()) {
        Some("user") | Some("assistant") => {}
        _ => {
            return Err(ProxyError::InvalidRequest(format!(
                "messages[{}].role must be \"user\" or \"assistant\"",
                index
            )))
        }
    }

    match obj.get("content") {
        Some(Value::String(_)) => Ok(()),
        Some(Value::Array(blocks)) => {
            for (j, block) in blocks.iter().enumerate() {
                validate_content_block(index, j, block)?;
            }
            Ok(())
        }
        _ => Err(ProxyError::InvalidRequest(format!(
            "messages[{}].content must be a string or an array of content blocks",
            index
        ))),
    }
}

fn validate_content_block(msg_index: usize, block_index: usize, block: &Value) -> ProxyResult<()> {
    let at = || format!("messages[{}].content[{}]", msg_index, block_index);

    let obj = block
        .as_object()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("{} must be an object", at())))?;

    let block_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProxyError::InvalidRequest(format!("{} is missing a type tag", at())))?;

    match block_type {
        "text" => {
            let text = obj
                .get("text")
                .and_then(|t| t.as_str())
                .ok_or_else(|| ProxyError::InvalidRequest(format!("{} is missing text", at())))?;
            if text.len() > MAX_TEXT_BLOCK_BYTES {
                return Err(ProxyError::InvalidRequest(format!(
                    "{} exceeds the {} byte text limit",
                    at(),
                    MAX_TEXT_BLOCK_BYTES
                )));
            }
        }
        "image" => {
            let source = obj
                .get("source")
                .and_then(|s| s.as_object())
                .ok_or_else(|| ProxyError::InvalidRequest(format!("{} is missing source", at())))?;
            match source.get("type").and_then(|t| t.as_str()) {
                Some("base64") => {
                    let data = source.get("data").and_then(|d| d.as_str()).unwrap_or("");
                    if data.len() > MAX_IMAGE_DATA_BYTES {
                        return Err(ProxyError::InvalidRequest(format!(
                            "{} exceeds the {} byte image limit",
                            at(),
                            MAX_IMAGE_DATA_BYTES
                        )));
                    }
                }
                Some("url") => {}
                _ => {
                    return Err(ProxyError::InvalidRequest(format!(
                        "{} source.type must be \"base64\" or \"url\"",
                        at()
                    )))
                }
            }
        }
        "tool_use" => {
            for field in ["id", "name"] {
                if obj.get(field).and_then(|v| v.as_str()).is_none() {
                    return Err(ProxyError::InvalidRequest(format!(
                        "{} is missing {}",
                        at(),
                        field
                    )));
                }
            }
            if !obj.get("input").map(|i| i.is_object()).unwrap_or(false) {
                return Err(ProxyError::InvalidRequest(format!(
                    "{} input must be an object",
                    at()
                )));
            }
        }
        "tool_result" => {
            if obj.get("tool_use_id").and_then(|v| v.as_str()).is_none() {
                return Err(ProxyError::InvalidRequest(format!(
                    "{} is missing tool_use_id",
                    at()
                )));
            }
        }
        "thinking" => {
            if obj.get("thinking").and_then(|v| v.as_str()).is_none() {
                return Err(ProxyError::InvalidRequest(format!(
                    "{} is missing thinking text",
                    at()
                )));
            }
        }
        "redacted_thinking" => {
            if obj.get("data").and_then(|v| v.as_str()).is_none() {
                return Err(ProxyError::InvalidRequest(format!("{} is missing data", at())));
            }
        }
        other => {
            return Err(ProxyError::InvalidRequest(format!(
                "{} has unsupported type \"{}\"",
                at(),
                other
            )))
        }
    }

    Ok(())
}

/// Deep scan of the object graph for prototype-pollution key names.
fn reject_forbidden_keys(value: &Value) -> ProxyResult<()> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    return Err(ProxyError::InvalidRequest(format!(
                        "forbidden key \"{}\" in request body",
                        key
                    )));
                }
                reject_forbidden_keys(child)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                reject_forbidden_keys(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
