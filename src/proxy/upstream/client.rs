// Upstream HTTP client for the Cloud Code v1internal API.

use reqwest::{header, Client, Response, StatusCode};
use serde_json::Value;
use tokio::time::Duration;

use crate::proxy::config::UpstreamProxyConfig;

// Cloud Code v1internal endpoints, tried in order on every attempt. The
// daily endpoint draws on a separate quota pool, so a 429 there does not
// imply one on prod.
const V1_INTERNAL_BASE_URL_DAILY: &str = "https://daily-cloudcode-pa.googleapis.com/v1internal";
const V1_INTERNAL_BASE_URL_PROD: &str = "https://cloudcode-pa.googleapis.com/v1internal";

const DEFAULT_USER_AGENT: &str = "antigravity/1.13.3 darwin/arm64";

#[derive(Debug)]
pub enum UpstreamCallError {
    /// The per-call deadline elapsed on every endpoint.
    Timeout,
    /// Transport-level failure on every endpoint.
    Network(String),
}

impl std::fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamCallError::Timeout => write!(f, "upstream request timed out"),
            UpstreamCallError::Network(msg) => write!(f, "upstream request failed: {}", msg),
        }
    }
}

pub struct UpstreamClient {
    http_client: Client,
    user_agent: String,
    endpoints: Vec<String>,
}

impl UpstreamClient {
    pub fn new(proxy_config: Option<UpstreamProxyConfig>) -> Self {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(DEFAULT_USER_AGENT);

        if let Some(config) = &proxy_config {
            if config.enabled && !config.url.is_empty() {
                if let Ok(proxy) = reqwest::Proxy::all(&config.url) {
                    builder = builder.proxy(proxy);
                    tracing::info!("[Upstream] Egress proxy enabled: {}", config.url);
                }
            } else {
                builder = builder.no_proxy();
            }
        } else {
            builder = builder.no_proxy();
        }

        let http_client = builder.build().expect("failed to build upstream HTTP client");

        Self {
            http_client,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            endpoints: vec![
                V1_INTERNAL_BASE_URL_DAILY.to_string(),
                V1_INTERNAL_BASE_URL_PROD.to_string(),
            ],
        }
    }

    fn build_url(base_url: &str, method: &str, query_string: Option<&str>) -> String {
        if let Some(qs) = query_string {
            format!("{}:{}?{}", base_url, method, qs)
        } else {
            format!("{}:{}", base_url, method)
        }
    }

    /// Statuses worth retrying against the fallback endpoint: rate limits
    /// (separate quota pools), timeouts, missing routes, server errors.
    fn should_try_next_endpoint(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::NOT_FOUND
            || status.is_server_error()
    }

    /// POST a v1internal method, walking the endpoint list on retryable
    /// failures. The final non-success response is returned (not an error)
    /// so the scheduler can classify it.
    pub async fn call_v1_internal(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
        query_string: Option<&str>,
        timeout: Duration,
    ) -> Result<Response, UpstreamCallError> {
        let accept = if query_string.map(|q| q.contains("alt=sse")).unwrap_or(false) {
            "text/event-stream"
        } else {
            "application/json"
        };

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(accept));
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|e| UpstreamCallError::Network(e.to_string()))?,
        );
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_str(&self.user_agent)
                .unwrap_or_else(|_| header::HeaderValue::from_static(DEFAULT_USER_AGENT)),
        );

        let mut last_err: Option<UpstreamCallError> = None;
        let endpoint_count = self.endpoints.len();

        for (idx, base_url) in self.endpoints.iter().enumerate() {
            let url = Self::build_url(base_url, method, query_string);
            let has_next = idx + 1 < endpoint_count;

            let response = self
                .http_client
                .post(&url)
                .headers(headers.clone())
                .timeout(timeout)
                .json(body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        if idx > 0 {
                            tracing::info!(
                                "[Upstream] Fallback endpoint succeeded | {} | {}",
                                base_url,
                                status
                            );
                        } else {
                            tracing::debug!("[Upstream] {} | {}", method, status);
                        }
                        return Ok(resp);
                    }

                    if has_next && Self::should_try_next_endpoint(status) {
                        tracing::warn!(
                            "[Upstream] {} returned {} (method={}), trying next endpoint",
                            base_url,
                            status,
                            method
                        );
                        continue;
                    }

                    // Non-retryable status, or the endpoint list is
                    // exhausted: the caller classifies it
                    return Ok(resp);
                }
                Err(e) => {
                    let err = if e.is_timeout() {
                        UpstreamCallError::Timeout
                    } else {
                        UpstreamCallError::Network(e.to_string())
                    };
                    tracing::debug!("[Upstream] Request failed at {}: {}", base_url, e);
                    last_err = Some(err);

                    if !has_next {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| UpstreamCallError::Network("all endpoints failed".into())))
    }
}
