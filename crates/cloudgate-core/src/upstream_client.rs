//! C4: `UpstreamClient` — HTTP client to the internal Gemini endpoint with
//! multi-base-URL failover (`spec.md` §4.2).
//!
//! Grounded on the donor's `WreqUpstreamClient` (`gproxy-core/src/upstream_client/mod.rs`)
//! for the `wreq`-based client/proxy plumbing, and on the `antigravity`
//! provider (`gproxy-provider-impl/src/providers/antigravity/mod.rs`) for the
//! internal-endpoint request shape, headers, and project-id probing.

use std::time::Duration;

use serde_json::Value as JsonValue;
use wreq::{Client, Proxy};

use cloudgate_common::GatewayConfig;
use cloudgate_protocol::gemini::{InternalGenerateContentEnvelope, InternalGenerateContentRequest};

use crate::error::GatewayError;

const GENERATE_PATH: &str = ":generateContent";
const STREAM_PATH: &str = ":streamGenerateContent?alt=sse";

pub struct UpstreamClient {
    client: Client,
    base_urls: Vec<String>,
    user_agent: String,
}

impl UpstreamClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, wreq::Error> {
        let timeout = Duration::from_secs(config.request_timeout.max(1));
        let mut builder = Client::builder().timeout(timeout).connect_timeout(Duration::from_secs(10));

        if config.upstream_proxy.enabled {
            if let Some(url) = &config.upstream_proxy.url {
                match Proxy::all(url) {
                    Ok(proxy) => builder = builder.proxy(proxy),
                    Err(err) => tracing::warn!(%url, error = %err, "invalid upstream proxy url, bypassing"),
                }
            }
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            base_urls: config.internal_base_urls.clone(),
            user_agent: config.request_user_agent.clone(),
        })
    }

    /// `spec.md` §4.2 "Failover policy": try endpoints in order, advancing
    /// only on transient failures (no response, or status in {408, 429} ∪
    /// [500, …]). 401/403 never advance the endpoint — a bad token isn't a
    /// bad endpoint.
    pub async fn generate_content(
        &self,
        access_token: &str,
        body: &InternalGenerateContentRequest,
        extra_headers: &[(String, String)],
    ) -> Result<JsonValue, GatewayError> {
        let payload = serde_json::to_vec(body).map_err(|e| GatewayError::Fatal(e.to_string()))?;
        let mut last_err: Option<GatewayError> = None;

        for base in &self.base_urls {
            let url = format!("{base}{GENERATE_PATH}");
            match self.post_json(&url, access_token, payload.clone(), extra_headers).await {
                Ok(value) => {
                    let envelope: InternalGenerateContentEnvelope =
                        serde_json::from_value(value.clone()).unwrap_or_else(|_| {
                            InternalGenerateContentEnvelope::Bare(
                                cloudgate_protocol::gemini::GenerateContentResponse::empty(),
                            )
                        });
                    let unwrapped = serde_json::to_value(envelope.into_inner())
                        .map_err(|e| GatewayError::Fatal(e.to_string()))?;
                    return Ok(unwrapped);
                }
                Err(err) => {
                    let advance = should_advance_endpoint(&err);
                    tracing::warn!(endpoint = %base, error = %err, advance, "upstream generateContent failed");
                    last_err = Some(err);
                    if !advance {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::Fatal("no upstream endpoints configured".to_string())))
    }

    /// Returns the raw byte stream body for `:streamGenerateContent?alt=sse`.
    pub async fn stream_generate_content(
        &self,
        access_token: &str,
        body: &InternalGenerateContentRequest,
        extra_headers: &[(String, String)],
    ) -> Result<wreq::Response, GatewayError> {
        let payload = serde_json::to_vec(body).map_err(|e| GatewayError::Fatal(e.to_string()))?;
        let mut last_err: Option<GatewayError> = None;

        for base in &self.base_urls {
            let url = format!("{base}{STREAM_PATH}");
            match self.post_raw(&url, access_token, payload.clone(), extra_headers).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    let advance = should_advance_endpoint(&err);
                    tracing::warn!(endpoint = %base, error = %err, advance, "upstream streamGenerateContent failed");
                    last_err = Some(err);
                    if !advance {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::Fatal("no upstream endpoints configured".to_string())))
    }

    /// Supplementary feature (`SPEC_FULL.md` §B): a two-call probe that
    /// recovers a project id for a token whose sanitized `project_id` is
    /// empty, mirroring the donor's `loadCodeAssist`/`onboardUser` sequence.
    pub async fn detect_project_id(&self, access_token: &str) -> Result<Option<String>, GatewayError> {
        let Some(base) = self.base_urls.first() else {
            return Ok(None);
        };
        let url = format!("{base}:loadCodeAssist");
        let body = serde_json::json!({ "metadata": { "pluginType": "GEMINI" } });
        let payload = serde_json::to_vec(&body).map_err(|e| GatewayError::Fatal(e.to_string()))?;
        let value = self.post_json(&url, access_token, payload, &[]).await?;
        Ok(value
            .get("cloudaicompanionProject")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .filter(|s| !s.is_empty()))
    }

    async fn post_json(
        &self,
        url: &str,
        access_token: &str,
        body: Vec<u8>,
        extra_headers: &[(String, String)],
    ) -> Result<JsonValue, GatewayError> {
        let resp = self.post_raw(url, access_token, body, extra_headers).await?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(status_error(status, &bytes));
        }

        serde_json::from_slice(&bytes).map_err(|e| GatewayError::Fatal(e.to_string()))
    }

    async fn post_raw(
        &self,
        url: &str,
        access_token: &str,
        body: Vec<u8>,
        extra_headers: &[(String, String)],
    ) -> Result<wreq::Response, GatewayError> {
        let mut builder = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.user_agent)
            .header("requestid", make_request_id())
            .body(body);

        for (name, value) in extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let bytes = resp.bytes().await.unwrap_or_default();
            return Err(status_error(status, &bytes));
        }
        Ok(resp)
    }
}

fn transport_error(err: wreq::Error) -> GatewayError {
    GatewayError::Transient(err.to_string())
}

fn status_error(status: u16, body: &[u8]) -> GatewayError {
    let message = extract_upstream_message(body).unwrap_or_else(|| format!("upstream returned status {status}"));
    crate::classify::classify_upstream_error(Some(status), &message)
}

/// `spec.md` §4.2 "Normalization"/"propagate the last upstream error, with
/// the upstream's own `error.message` preferred when present".
fn extract_upstream_message(body: &[u8]) -> Option<String> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

/// `spec.md` §4.2 "Failover policy": advance past 408/429/5xx or a transport
/// failure (no response at all) — i.e. `Transient`/`RateLimited` — but never
/// past 401/403, and never past a non-transient `Fatal` (e.g. a 400): that's
/// a bad request, not a bad endpoint.
fn should_advance_endpoint(err: &GatewayError) -> bool {
    matches!(err, GatewayError::Transient(_) | GatewayError::RateLimited(_))
}

fn make_request_id() -> String {
    format!("{:x}", std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_does_not_advance_endpoint() {
        assert!(!should_advance_endpoint(&GatewayError::Forbidden("x".to_string())));
    }

    #[test]
    fn transient_and_rate_limited_advance_endpoint() {
        assert!(should_advance_endpoint(&GatewayError::Transient("x".to_string())));
        assert!(should_advance_endpoint(&GatewayError::RateLimited("x".to_string())));
    }

    #[test]
    fn fatal_does_not_advance_endpoint() {
        assert!(!should_advance_endpoint(&GatewayError::Fatal("bad request".to_string())));
    }

    #[test]
    fn extracts_upstream_error_message() {
        let body = br#"{"error":{"code":429,"message":"quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            extract_upstream_message(body).as_deref(),
            Some("quota exceeded")
        );
    }
}
