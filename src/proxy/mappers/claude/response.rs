// Outbound translation: Cloud Code response -> Anthropic Messages response.

use super::models::*;
use crate::proxy::error::{ProxyError, ProxyResult};
use crate::proxy::signature_cache::SignatureCache;

/// Map the upstream finish reason onto Anthropic's stop_reason. Any
/// function call in the candidate forces `tool_use` regardless of what the
/// upstream reported.
pub fn map_finish_reason(finish_reason: Option<&str>, used_tool: bool) -> &'static str {
    if used_tool {
        return "tool_use";
    }

    match finish_reason {
        Some("MAX_TOKENS") => "max_tokens",
        // SAFETY / RECITATION / STOP and anything unrecognized end the turn
        _ => "end_turn",
    }
}

pub fn translate_response_out(
    response: &GeminiResponse,
    client_model: &str,
) -> ProxyResult<ClaudeResponse> {
    let candidate = response
        .candidates
        .as_ref()
        .and_then(|c| c.first())
        .ok_or_else(|| ProxyError::Translation("upstream response carried no candidates".into()))?;

    let mut content = Vec::new();
    let mut used_tool = false;

    if let Some(candidate_content) = &candidate.content {
        for part in &candidate_content.parts {
            translate_part(part, &mut content, &mut used_tool);
        }
    }

    let stop_reason = map_finish_reason(candidate.finish_reason.as_deref(), used_tool);

    let usage = response
        .usage_metadata
        .as_ref()
        .map(to_claude_usage)
        .unwrap_or_default();

    Ok(ClaudeResponse {
        id: response
            .response_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        model: client_model.to_string(),
        content,
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    })
}

fn translate_part(part: &GeminiPart, content: &mut Vec<ContentBlock>, used_tool: &mut bool) {
    if let Some(fc) = &part.function_call {
        *used_tool = true;

        let id = fc
            .id
            .clone()
            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));

        content.push(ContentBlock::ToolUse {
            id,
            name: fc.name.clone(),
            input: fc.args.clone().unwrap_or_else(|| serde_json::json!({})),
            signature: part.thought_signature.clone(),
        });
        return;
    }

    if let Some(text) = &part.text {
        if part.thought.unwrap_or(false) {
            // Signed thought: hand the signature to the client and remember
            // it so unsigned replays can be restored
            if let Some(sig) = &part.thought_signature {
                SignatureCache::global().record(text, sig);
            }
            content.push(ContentBlock::Thinking {
                thinking: text.clone(),
                signature: part.thought_signature.clone(),
            });
        } else if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.clone() });
        }
        return;
    }

    if let Some(inline) = &part.inline_data {
        if !inline.data.is_empty() {
            // Generated media travels as a markdown data URI inside a text
            // block; the Messages response schema has no image variant
            content.push(ContentBlock::Text {
                text: format!("![image](data:{};base64,{})", inline.mime_type, inline.data),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upstream(parts: serde_json::Value, finish: &str) -> GeminiResponse {
        serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": parts},
                "finishReason": finish,
                "index": 0
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5},
            "responseId": "resp-1",
            "modelVersion": "models/test"
        }))
        .unwrap()
    }

    #[test]
    fn test_plain_text_round_trip() {
        let response = upstream(json!([{"text": "hi"}]), "STOP");
        let claude = translate_response_out(&response, "claude-sonnet-4-5").unwrap();

        assert_eq!(claude.role, "assistant");
        assert_eq!(claude.model, "claude-sonnet-4-5");
        assert_eq!(claude.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(claude.usage.input_tokens, 10);
        assert_eq!(claude.usage.output_tokens, 5);
        match &claude.content[0] {
            ContentBlock::Text { text } => assert_eq!(text, "hi"),
            other => panic!("unexpected block: {:?}", other),
        }
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP"), false), "end_turn");
        assert_eq!(map_finish_reason(Some("MAX_TOKENS"), false), "max_tokens");
        assert_eq!(map_finish_reason(Some("SAFETY"), false), "end_turn");
        assert_eq!(map_finish_reason(Some("RECITATION"), false), "end_turn");
        assert_eq!(map_finish_reason(None, false), "end_turn");
        // Tool use wins over everything
        assert_eq!(map_finish_reason(Some("STOP"), true), "tool_use");
        assert_eq!(map_finish_reason(Some("MAX_TOKENS"), true), "tool_use");
    }

    #[test]
    fn test_function_call_becomes_tool_use() {
        let response = upstream(
            json!([
                {"text": "calling the tool", "thought": true, "thoughtSignature": "x".repeat(64)},
                {"functionCall": {"name": "get_weather", "args": {"loc": "Paris"}}}
            ]),
            "STOP",
        );

        let claude = translate_response_out(&response, "m").unwrap();
        assert_eq!(claude.stop_reason.as_deref(), Some("tool_use"));

        match &claude.content[1] {
            ContentBlock::ToolUse { id, name, input, .. } => {
                assert!(id.starts_with("toolu_"));
                assert_eq!(name, "get_weather");
                assert_eq!(input["loc"], "Paris");
            }
            other => panic!("unexpected block: {:?}", other),
        }
    }

    #[test]
    fn test_thought_part_recorded_in_cache() {
        let sig = "r".repeat(96);
        let text = "distinct reasoning trace recorded by the response translator";
        let response = upstream(
            json!([
                {"text": text, "thought": true, "thoughtSignature": sig},
                {"text": "the answer"}
            ]),
            "STOP",
        );

        let claude = translate_response_out(&response, "m").unwrap();

        match &claude.content[0] {
            ContentBlock::Thinking { thinking, signature } => {
                assert_eq!(thinking, text);
                assert_eq!(signature.as_deref(), Some(sig.as_str()));
            }
            other => panic!("unexpected block: {:?}", other),
        }

        // A replay without the signature can now be restored from cache
        assert_eq!(SignatureCache::global().lookup(text), Some(sig));
    }

    #[test]
    fn test_no_candidates_is_translation_error() {
        let response = GeminiResponse::default();
        assert!(translate_response_out(&response, "m").is_err());
    }

    #[test]
    fn test_reasoning_tokens_in_usage() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "hi"}]}, "finishReason": "STOP"}],
            "usageMetadata": {
                "promptTokenCount": 100,
                "candidatesTokenCount": 40,
                "thoughtsTokenCount": 25,
                "cachedContentTokenCount": 60
            }
        }))
        .unwrap();

        let claude = translate_response_out(&response, "m").unwrap();
        assert_eq!(claude.usage.output_tokens, 65);
        assert_eq!(claude.usage.cache_read_input_tokens, Some(60));
        assert_eq!(
            claude.usage.output_tokens_details.as_ref().unwrap().reasoning_tokens,
            25
        );
    }
}
