// Accumulates an upstream SSE stream into one logical response. Used on the
// non-streaming path for thinking models, whose upstream responses arrive
// as SSE regardless of the client's stream flag.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use tokio::time::{timeout, Duration};

pub const DEFAULT_COLLECTOR_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_MAX_COLLECTED_PARTS: usize = 10_000;

#[derive(Debug, Default)]
pub struct CollectedSse {
    pub parts: Vec<Value>,
    pub finish_reason: Option<String>,
    pub usage_metadata: Option<Value>,
    pub model_version: Option<String>,
    pub response_id: Option<String>,
}

fn ingest_payload(payload: &Value, collected: &mut CollectedSse) {
    // v1internal wraps the generate response in a "response" envelope
    let raw = payload.get("response").unwrap_or(payload);

    if let Some(usage) = raw.get("usageMetadata") {
        collected.usage_metadata = Some(usage.clone());
    }

    if let Some(model) = raw.get("modelVersion").and_then(|v| v.as_str()) {
        collected.model_version = Some(model.to_string());
    }

    if let Some(id) = raw.get("responseId").and_then(|v| v.as_str()) {
        collected.response_id = Some(id.to_string());
    }

    // Only candidate 0 is collected; the upstream emits a single candidate
    if let Some(candidate) = raw.get("candidates").and_then(|c| c.get(0)) {
        if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            collected.finish_reason = Some(reason.to_string());
        }

        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            collected.parts.extend(parts.iter().cloned());
        }
    }
}

pub async fn collect_sse_payloads(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    timeout_secs: u64,
    max_parts: usize,
) -> Result<CollectedSse, String> {
    let collection = async {
        let mut buffer = BytesMut::new();
        let mut collected = CollectedSse::default();

        let mut ingest_line = |line: &str, collected: &mut CollectedSse| -> Result<(), String> {
            let payload = match line.trim().strip_prefix("data: ") {
                Some(rest) => rest.trim(),
                None => return Ok(()),
            };
            if payload.is_empty() || payload == "[DONE]" {
                return Ok(());
            }
            if let Ok(json) = serde_json::from_str::<Value>(payload) {
                ingest_payload(&json, collected);
                if collected.parts.len() > max_parts {
                    return Err(format!(
                        "stream too large: {} parts exceeds the limit of {}",
                        collected.parts.len(),
                        max_parts
                    ));
                }
            }
            Ok(())
        };

        while let Some(item) = upstream.next().await {
            let bytes = item.map_err(|e| format!("stream error: {}", e))?;
            buffer.extend_from_slice(&bytes);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_raw = buffer.split_to(pos + 1);
                if let Ok(line) = std::str::from_utf8(&line_raw) {
                    ingest_line(line, &mut collected)?;
                }
            }
        }

        if !buffer.is_empty() {
            if let Ok(line) = std::str::from_utf8(&buffer) {
                ingest_line(line, &mut collected)?;
            }
        }

        Ok(collected)
    };

    match timeout(Duration::from_secs(timeout_secs), collection).await {
        Ok(result) => result,
        Err(_) => Err(format!("stream collection timed out after {}s", timeout_secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>> {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from(c))),
        ))
    }

    #[tokio::test]
    async fn test_collects_parts_across_chunks() {
        let stream = byte_stream(vec![
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hel\"}]}}]}}\n\n",
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":3}}}\n\n",
            "data: [DONE]\n\n",
        ]);

        let collected = collect_sse_payloads(stream, 10, 100).await.unwrap();
        assert_eq!(collected.parts.len(), 2);
        assert_eq!(collected.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(collected.usage_metadata.unwrap()["promptTokenCount"], 3);
    }

    #[tokio::test]
    async fn test_split_line_across_chunks() {
        let stream = byte_stream(vec![
            "data: {\"candidates\":[{\"content\":",
            "{\"parts\":[{\"text\":\"joined\"}]}}]}\n",
        ]);

        let collected = collect_sse_payloads(stream, 10, 100).await.unwrap();
        assert_eq!(collected.parts.len(), 1);
        assert_eq!(collected.parts[0], json!({"text": "joined"}));
    }

    #[tokio::test]
    async fn test_part_limit_enforced() {
        let stream = byte_stream(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"},{\"text\":\"b\"}]}}]}\n",
        ]);

        let result = collect_sse_payloads(stream, 10, 1).await;
        assert!(result.is_err());
    }
}
