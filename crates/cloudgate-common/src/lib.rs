use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Upstream HTTP proxy used for egress to the internal Gemini endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpstreamProxyConfig {
    pub enabled: bool,
    pub url: Option<String>,
}

/// Final, merged process-wide configuration (`spec.md` §6 `proxy:` block).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub port: u16,
    /// Empty string disables `AuthGuard`.
    pub api_key: String,
    pub auto_start: bool,
    pub backend_canary_enabled: bool,
    /// Seconds; minimum enforced at 1 by `UpstreamClient`.
    pub request_timeout: u64,
    pub custom_mapping: HashMap<String, String>,
    pub anthropic_mapping: HashMap<String, String>,
    pub upstream_proxy: UpstreamProxyConfig,
    /// Comma-separated override source: `PROXY_INTERNAL_BASE_URLS` / `ANTIGRAVITY_INTERNAL_BASE_URLS`.
    pub internal_base_urls: Vec<String>,
    /// `PROXY_REQUEST_USER_AGENT` override.
    pub request_user_agent: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8045,
            api_key: String::new(),
            auto_start: true,
            backend_canary_enabled: false,
            request_timeout: 120,
            custom_mapping: HashMap::new(),
            anthropic_mapping: HashMap::new(),
            upstream_proxy: UpstreamProxyConfig::default(),
            internal_base_urls: default_internal_base_urls(),
            request_user_agent: default_user_agent(),
        }
    }
}

pub fn default_internal_base_urls() -> Vec<String> {
    vec![
        "https://cloudcode-pa.googleapis.com/v1internal".to_string(),
        "https://daily-cloudcode-pa.googleapis.com/v1internal".to_string(),
    ]
}

pub fn default_user_agent() -> String {
    "antigravity/1.11.9 windows/amd64".to_string()
}

/// Optional layer used for merging `GatewayConfig` from env / file / CLI.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfigPatch {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub auto_start: Option<bool>,
    pub backend_canary_enabled: Option<bool>,
    pub request_timeout: Option<u64>,
    pub custom_mapping: Option<HashMap<String, String>>,
    pub anthropic_mapping: Option<HashMap<String, String>>,
    pub upstream_proxy: Option<UpstreamProxyConfig>,
    pub internal_base_urls: Option<Vec<String>>,
    pub request_user_agent: Option<String>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.auto_start.is_some() {
            self.auto_start = other.auto_start;
        }
        if other.backend_canary_enabled.is_some() {
            self.backend_canary_enabled = other.backend_canary_enabled;
        }
        if other.request_timeout.is_some() {
            self.request_timeout = other.request_timeout;
        }
        if other.custom_mapping.is_some() {
            self.custom_mapping = other.custom_mapping;
        }
        if other.anthropic_mapping.is_some() {
            self.anthropic_mapping = other.anthropic_mapping;
        }
        if other.upstream_proxy.is_some() {
            self.upstream_proxy = other.upstream_proxy;
        }
        if other.internal_base_urls.is_some() {
            self.internal_base_urls = other.internal_base_urls;
        }
        if other.request_user_agent.is_some() {
            self.request_user_agent = other.request_user_agent;
        }
    }

    pub fn into_config(self) -> GatewayConfig {
        let defaults = GatewayConfig::default();
        GatewayConfig {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            port: self.port.unwrap_or(defaults.port),
            api_key: self.api_key.unwrap_or(defaults.api_key),
            auto_start: self.auto_start.unwrap_or(defaults.auto_start),
            backend_canary_enabled: self
                .backend_canary_enabled
                .unwrap_or(defaults.backend_canary_enabled),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            custom_mapping: self.custom_mapping.unwrap_or_default(),
            anthropic_mapping: self.anthropic_mapping.unwrap_or_default(),
            upstream_proxy: self.upstream_proxy.unwrap_or(defaults.upstream_proxy),
            internal_base_urls: self
                .internal_base_urls
                .unwrap_or(defaults.internal_base_urls),
            request_user_agent: self
                .request_user_agent
                .unwrap_or(defaults.request_user_agent),
        }
    }

    /// Patch built from process environment variables (core-relevant subset only).
    pub fn from_env() -> Self {
        let mut patch = Self::default();

        let base_urls = std::env::var("PROXY_INTERNAL_BASE_URLS")
            .or_else(|_| std::env::var("ANTIGRAVITY_INTERNAL_BASE_URLS"))
            .ok();
        if let Some(raw) = base_urls {
            let urls: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !urls.is_empty() {
                patch.internal_base_urls = Some(urls);
            }
        }

        if let Ok(ua) = std::env::var("PROXY_REQUEST_USER_AGENT") {
            if !ua.is_empty() {
                patch.request_user_agent = Some(ua);
            }
        }

        if let Ok(port) = std::env::var("PROXY_PORT").and_then(|v| {
            v.parse::<u16>()
                .map_err(|_| std::env::VarError::NotPresent)
        }) {
            patch.port = Some(port);
        }

        if let Ok(key) = std::env::var("PROXY_API_KEY") {
            patch.api_key = Some(key);
        }

        patch
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            enabled: Some(value.enabled),
            port: Some(value.port),
            api_key: Some(value.api_key),
            auto_start: Some(value.auto_start),
            backend_canary_enabled: Some(value.backend_canary_enabled),
            request_timeout: Some(value.request_timeout),
            custom_mapping: Some(value.custom_mapping),
            anthropic_mapping: Some(value.anthropic_mapping),
            upstream_proxy: Some(value.upstream_proxy),
            internal_base_urls: Some(value.internal_base_urls),
            request_user_agent: Some(value.request_user_agent),
        }
    }
}

/// Current unix time in whole seconds.
pub fn now_unix_seconds() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Current unix time in whole milliseconds.
pub fn now_unix_millis() -> i64 {
    let now = time::OffsetDateTime::now_utc();
    now.unix_timestamp() * 1000 + i64::from(now.millisecond())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overlay_prefers_later_values() {
        let mut base = GatewayConfigPatch {
            port: Some(8045),
            ..Default::default()
        };
        base.overlay(GatewayConfigPatch {
            port: Some(9000),
            ..Default::default()
        });
        assert_eq!(base.port, Some(9000));
    }

    #[test]
    fn into_config_fills_defaults() {
        let config = GatewayConfigPatch::default().into_config();
        assert_eq!(config.port, 8045);
        assert_eq!(config.internal_base_urls.len(), 2);
    }
}
