// OAuth 2.0 refresh_token grant. Enrollment (browser + PKCE) lives in the
// external tooling; the proxy only ever exchanges refresh tokens.

use once_cell::sync::Lazy;
use serde::Deserialize;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";

static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("failed to build OAuth HTTP client")
});

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

/// Exchange a refresh token for a fresh access token.
///
/// The error string carries the upstream body so callers can detect
/// `invalid_grant` (revoked/expired refresh token) and invalidate the
/// account instead of retrying forever.
pub async fn refresh_access_token(refresh_token: &str) -> Result<TokenResponse, String> {
    let params = [
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];

    let response = HTTP
        .post(TOKEN_ENDPOINT)
        .form(&params)
        .send()
        .await
        .map_err(|e| format!("token endpoint request failed: {}", e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("token endpoint read failed: {}", e))?;

    if !status.is_success() {
        return Err(format!("token refresh failed ({}): {}", status, body));
    }

    serde_json::from_str::<TokenResponse>(&body)
        .map_err(|e| format!("token response parse failed: {}", e))
}

/// Whether a refresh error indicates a terminally revoked refresh token.
pub fn is_invalid_grant(error: &str) -> bool {
    error.contains("invalid_grant")
}
