//! `spec.md` §7 "Error handling design": the internal taxonomy the
//! orchestrator's retry loop pattern-matches on, and the HTTP-facing error
//! the C9 frontends render in whichever protocol the client spoke.

use bytes::Bytes;

/// Internal error kinds (`spec.md` §7 "Taxonomy"). Each carries a
/// human-readable message; classification never retains the socket/request
/// object that produced it (`spec.md` §7 "Circular references").
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Network errors, 5xx, 408, empty stream. Retry with another account; do
    /// not mark it.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// 429, resource_exhausted, quota. Retry; mark the account rate-limited.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// 401/403/invalid_grant/permission_denied. Retry; mark the account
    /// forbidden.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Gemini project licensing / not-found errors. Inline retry with
    /// `project_id=""` on the same account.
    #[error("project context error: {0}")]
    ProjectContext(String),

    /// Anthropic surface only: inline retry downgrading to
    /// `gemini-2.5-flash`.
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Distinguished so the orchestrator can trigger unary↔stream fallback.
    #[error("empty response stream")]
    EmptyResponseStream,

    /// Malformed client input. No retry.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Everything else after retries are exhausted.
    #[error("{0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Whether the orchestrator's retry loop recovers from this kind
    /// (`spec.md` §7 "Propagation policy"). `EmptyResponseStream` is
    /// recoverable only on the unary path; that distinction is handled by the
    /// orchestrator, not here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transient(_)
                | GatewayError::RateLimited(_)
                | GatewayError::Forbidden(_)
        )
    }
}

/// The HTTP-facing error produced at the C9 frontend boundary: a numeric
/// status plus a protocol-shaped JSON body.
#[derive(Debug)]
pub struct ProxyError {
    pub status: u16,
    pub body: Bytes,
}

impl ProxyError {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn bad_request(message: impl Into<Bytes>) -> Self {
        Self::new(400, message.into())
    }

    pub fn not_found(message: impl Into<Bytes>) -> Self {
        Self::new(404, message.into())
    }

    pub fn unauthorized(message: impl Into<Bytes>) -> Self {
        Self::new(401, message.into())
    }
}
