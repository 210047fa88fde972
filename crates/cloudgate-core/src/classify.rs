//! Upstream error classification (`spec.md` §4.6 "error-classification",
//! §7 "Taxonomy") and the client-facing error→HTTP-status mapping
//! (`spec.md` §4.7 "Error→HTTP status mapping").
//!
//! `spec.md` §9 "Error as values" keeps message-substring matching at the
//! ingress to the classifier only; everywhere else in the orchestrator
//! pattern-matches on `GatewayError` variants.

use crate::error::GatewayError;

/// Classify a failed upstream call into the §7 taxonomy from an HTTP status
/// (when one was received) and the upstream's error message.
///
/// The Anthropic-only quota-downgrade special case (`spec.md` §4.6 "Quota
/// downgrade") is deliberately NOT decided here: its trigger substrings
/// overlap with plain `RateLimited` ("quota", "resource_exhausted"), and the
/// two differ only by which client protocol is asking and what recovery they
/// get (inline model downgrade vs. account rotation). The orchestrator checks
/// [`is_quota_exhausted_message`] itself, on the Anthropic path only, before
/// falling back to this classifier.
pub fn classify_upstream_error(status: Option<u16>, message: &str) -> GatewayError {
    let lower = message.to_ascii_lowercase();

    if is_project_context_error(&lower) {
        return GatewayError::ProjectContext(message.to_string());
    }

    match status {
        Some(401) => GatewayError::Forbidden(message.to_string()),
        Some(403) => GatewayError::Forbidden(message.to_string()),
        Some(429) => GatewayError::RateLimited(message.to_string()),
        Some(408) | Some(500) | Some(502) | Some(503) | Some(504) => {
            GatewayError::Transient(message.to_string())
        }
        Some(s) if s >= 500 => GatewayError::Transient(message.to_string()),
        _ => classify_by_message(&lower, message),
    }
}

fn classify_by_message(lower: &str, original: &str) -> GatewayError {
    if lower.contains("invalid_grant") || lower.contains("permission_denied") || lower.contains("forbidden") {
        return GatewayError::Forbidden(original.to_string());
    }
    if lower.contains("resource_exhausted") || lower.contains("quota") || lower.contains("rate_limit") {
        return GatewayError::RateLimited(original.to_string());
    }
    if lower.contains("socket hang up")
        || lower.contains("timeout")
        || lower.contains("empty response stream")
        || lower.contains("connection reset")
    {
        return GatewayError::Transient(original.to_string());
    }
    GatewayError::Fatal(original.to_string())
}

/// `spec.md` §4.6 "Project-context fallback": `#3501` OR ("google cloud
/// project" AND "code assist license") OR "resource projects/… could not be
/// found" OR ("project" AND "not found").
fn is_project_context_error(lower: &str) -> bool {
    if lower.contains("#3501") {
        return true;
    }
    if lower.contains("google cloud project") && lower.contains("code assist license") {
        return true;
    }
    if lower.contains("resource projects/") && lower.contains("could not be found") {
        return true;
    }
    lower.contains("project") && lower.contains("not found")
}

/// `spec.md` §4.6 "Quota downgrade (Anthropic only)": resource has been
/// exhausted / resource_exhausted / quota. Checked by the orchestrator on the
/// Anthropic path only, ahead of the generic classifier.
pub fn is_quota_exhausted_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("resource has been exhausted")
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
}

/// `spec.md` §4.7 "Error→HTTP status mapping": inspect the error message
/// substring-insensitively.
pub fn error_to_http_status(message: &str) -> u16 {
    let lower = message.to_ascii_lowercase();

    if lower.contains("all accounts failed") || lower.contains("unhealthy") {
        return 503;
    }
    if lower.contains("exhausted") || lower.contains("no available accounts") {
        return 429;
    }
    if lower.contains("socket hang up")
        || lower.contains("econnreset")
        || lower.contains("eai_again")
        || lower.contains("secure tls connection")
        || lower.contains("network socket disconnected")
    {
        return 503;
    }
    if lower.contains("401") || lower.contains("unauthorized") {
        return 401;
    }
    if lower.contains("403") || lower.contains("forbidden") {
        return 403;
    }
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("quota") {
        return 429;
    }
    if lower.contains("503") || lower.contains("service unavailable") {
        return 503;
    }
    if lower.contains("502") || lower.contains("bad gateway") {
        return 502;
    }
    if lower.contains("504") || lower.contains("timeout") {
        return 504;
    }
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_429_as_rate_limited() {
        assert!(matches!(
            classify_upstream_error(Some(429), "quota exceeded"),
            GatewayError::RateLimited(_)
        ));
    }

    #[test]
    fn classifies_401_403_as_forbidden() {
        assert!(matches!(
            classify_upstream_error(Some(401), "invalid token"),
            GatewayError::Forbidden(_)
        ));
        assert!(matches!(
            classify_upstream_error(Some(403), "permission denied"),
            GatewayError::Forbidden(_)
        ));
    }

    #[test]
    fn classifies_5xx_and_408_as_transient() {
        for status in [408, 500, 502, 503, 504] {
            assert!(matches!(
                classify_upstream_error(Some(status), "oops"),
                GatewayError::Transient(_)
            ));
        }
    }

    #[test]
    fn project_context_beats_status_classification() {
        assert!(matches!(
            classify_upstream_error(Some(400), "#3501 google cloud project code assist license missing"),
            GatewayError::ProjectContext(_)
        ));
        assert!(matches!(
            classify_upstream_error(None, "resource projects/123 could not be found"),
            GatewayError::ProjectContext(_)
        ));
        assert!(matches!(
            classify_upstream_error(None, "project foo not found"),
            GatewayError::ProjectContext(_)
        ));
    }

    #[test]
    fn quota_exhausted_message_detected_separately_from_classification() {
        assert!(is_quota_exhausted_message(
            "Resource has been exhausted (e.g. check quota)."
        ));
        // Absent protocol context, the generic classifier still treats it as
        // a retryable rate-limit, not a quota-downgrade trigger.
        assert!(matches!(
            classify_upstream_error(None, "Resource has been exhausted (e.g. check quota)."),
            GatewayError::RateLimited(_)
        ));
    }

    #[test]
    fn transport_keywords_classified_transient_without_status() {
        assert!(matches!(
            classify_upstream_error(None, "socket hang up"),
            GatewayError::Transient(_)
        ));
    }

    #[test]
    fn unknown_error_is_fatal() {
        assert!(matches!(
            classify_upstream_error(None, "totally unexpected"),
            GatewayError::Fatal(_)
        ));
    }

    #[test]
    fn http_status_mapping_examples() {
        assert_eq!(error_to_http_status("all accounts failed"), 503);
        assert_eq!(error_to_http_status("quota exceeded"), 429);
        assert_eq!(error_to_http_status("socket hang up"), 503);
        assert_eq!(error_to_http_status("401 unauthorized"), 401);
        assert_eq!(error_to_http_status("bad gateway 502"), 502);
        assert_eq!(error_to_http_status("something else entirely"), 500);
    }
}
