// Project-id discovery for accounts enrolled without one. The Cloud Code
// API requires a cloudaicompanion project reference on every request;
// `loadCodeAssist` reports the one provisioned for the account.

use serde_json::{json, Value};
use tokio::time::Duration;

use crate::proxy::upstream::UpstreamClient;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn fetch_project_id(
    client: &UpstreamClient,
    access_token: &str,
) -> Result<String, String> {
    let body = json!({
        "metadata": {
            "ideType": "IDE_UNSPECIFIED",
            "platform": "PLATFORM_UNSPECIFIED",
            "pluginType": "GEMINI"
        }
    });

    let response = client
        .call_v1_internal("loadCodeAssist", access_token, &body, None, DISCOVERY_TIMEOUT)
        .await
        .map_err(|e| format!("loadCodeAssist failed: {}", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("loadCodeAssist returned {}", status));
    }

    let payload: Value = response
        .json()
        .await
        .map_err(|e| format!("loadCodeAssist parse failed: {}", e))?;

    extract_project_id(&payload).ok_or_else(|| "no project id in loadCodeAssist response".into())
}

/// The field is a plain string on provisioned accounts and an object with
/// an `id` on newer responses.
fn extract_project_id(payload: &Value) -> Option<String> {
    match payload.get("cloudaicompanionProject") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Object(obj)) => obj
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        _ => None,
    }
}
