use serde::{Deserialize, Serialize};

use crate::proxy::sticky::SchedulingConfig;

/// Proxy settings, persisted as the `settings` object of the account store
/// document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// false: loopback only (the default). true: bind 0.0.0.0.
    #[serde(default)]
    pub allow_lan_access: bool,

    /// Upstream timeout for non-streaming calls (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Upstream timeout for streaming calls (seconds); also bounds
    /// time-to-first-byte and inter-chunk idle.
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout: u64,

    /// Model retried once when every account is exhausted for the
    /// requested one. None disables the fallback pass.
    #[serde(default)]
    pub fallback_model: Option<String>,

    /// Sticky scheduling policy.
    #[serde(default)]
    pub scheduling: SchedulingConfig,

    /// Optional egress proxy for upstream traffic.
    #[serde(default)]
    pub upstream_proxy: UpstreamProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpstreamProxyConfig {
    pub enabled: bool,
    /// http://, https:// or socks5:// URL.
    #[serde(default)]
    pub url: String,
}

fn default_port() -> u16 {
    8046
}

fn default_request_timeout() -> u64 {
    60
}

fn default_stream_timeout() -> u64 {
    180
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            allow_lan_access: false,
            request_timeout: default_request_timeout(),
            stream_timeout: default_stream_timeout(),
            fallback_model: None,
            scheduling: SchedulingConfig::default(),
            upstream_proxy: UpstreamProxyConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn bind_address(&self) -> &str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8046);
        assert_eq!(config.bind_address(), "127.0.0.1");
        assert_eq!(config.request_timeout, 60);
        assert_eq!(config.stream_timeout, 180);
        assert!(config.fallback_model.is_none());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"port": 9000, "allow_lan_access": true}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind_address(), "0.0.0.0");
        assert_eq!(config.stream_timeout, 180);
    }
}
