// Assembles a collected upstream SSE stream into the typed response shape
// used by the non-streaming translator.

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use super::models::{Candidate, GeminiContent, GeminiPart, GeminiResponse, UsageMetadata};
use crate::proxy::mappers::sse_collector::{
    collect_sse_payloads, DEFAULT_COLLECTOR_TIMEOUT_SECS, DEFAULT_MAX_COLLECTED_PARTS,
};

pub async fn collect_upstream_sse_response(
    upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
) -> Result<GeminiResponse, String> {
    let collected = collect_sse_payloads(
        upstream,
        DEFAULT_COLLECTOR_TIMEOUT_SECS,
        DEFAULT_MAX_COLLECTED_PARTS,
    )
    .await?;

    let mut parts: Vec<GeminiPart> = Vec::with_capacity(collected.parts.len());
    for part in collected.parts {
        if let Ok(parsed) = serde_json::from_value::<GeminiPart>(part) {
            parts.push(parsed);
        }
    }

    let usage_metadata = collected
        .usage_metadata
        .and_then(|v| serde_json::from_value::<UsageMetadata>(v).ok());

    let candidate = Candidate {
        content: Some(GeminiContent {
            role: "model".to_string(),
            parts,
        }),
        finish_reason: collected.finish_reason,
        index: Some(0),
    };

    Ok(GeminiResponse {
        candidates: Some(vec![candidate]),
        usage_metadata,
        model_version: collected.model_version,
        response_id: collected.response_id,
    })
}
