use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Well-known Claude model family buckets used by the family-group mapping step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaudeFamily {
    Claude45,
    Claude35,
    ClaudeDefault,
}

impl ClaudeFamily {
    fn config_key(self) -> &'static str {
        match self {
            ClaudeFamily::Claude45 => "claude-4.5-series",
            ClaudeFamily::Claude35 => "claude-3.5-series",
            ClaudeFamily::ClaudeDefault => "claude-default",
        }
    }
}

fn classify_claude_family(model: &str) -> Option<ClaudeFamily> {
    let lower = model.to_ascii_lowercase();
    if !lower.contains("claude") {
        return None;
    }
    if lower.contains("4-5") || lower.contains("4.5") {
        Some(ClaudeFamily::Claude45)
    } else if lower.contains("3-5") || lower.contains("3.5") {
        Some(ClaudeFamily::Claude35)
    } else {
        Some(ClaudeFamily::ClaudeDefault)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenAiFamily {
    Gpt4,
    Gpt4oOr35,
    Gpt5,
}

fn classify_openai_family(model: &str) -> Option<OpenAiFamily> {
    let lower = model.to_ascii_lowercase();
    if !lower.starts_with("gpt") && !lower.starts_with('o') {
        return None;
    }
    let is_mini_turbo_o_blend =
        lower.contains("mini") || lower.contains("turbo") || lower.contains("4o");
    if lower.starts_with("gpt-5") {
        return Some(OpenAiFamily::Gpt5);
    }
    if lower.contains("4o") || lower.contains("3.5") || lower.contains("3-5") || lower.contains("turbo") {
        return Some(OpenAiFamily::Gpt4oOr35);
    }
    if (lower.starts_with("gpt-4") || lower.starts_with("o1") || lower.starts_with("o3"))
        && !is_mini_turbo_o_blend
    {
        return Some(OpenAiFamily::Gpt4);
    }
    None
}

/// Canonical target for an OpenAI family bucket not caught by a more specific
/// custom/exact mapping. GPT-5 falls back to the GPT-4 series target, per
/// `spec.md` §4.3 priority step 2.
fn openai_family_target(family: OpenAiFamily) -> &'static str {
    match family {
        OpenAiFamily::Gpt4 => "gemini-2.5-pro",
        OpenAiFamily::Gpt4oOr35 => "gemini-2.5-flash",
        OpenAiFamily::Gpt5 => openai_family_target(OpenAiFamily::Gpt4),
    }
}

/// Static Claude/OpenAI/Gemini alias table (`CLAUDE_TO_GEMINI` analogue).
fn static_alias_table() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("claude-opus-4-5", "gemini-3-pro-preview"),
            ("claude-sonnet-4-5", "gemini-3-pro-preview"),
            ("claude-haiku-4-5", "gemini-2.5-flash"),
            ("claude-3-5-sonnet-latest", "gemini-2.5-pro"),
            ("claude-3-5-haiku-latest", "gemini-2.5-flash"),
            ("gpt-4o", "gemini-3-pro-preview"),
            ("gpt-4o-mini", "gemini-2.5-flash"),
            ("gpt-4", "gemini-2.5-pro"),
            ("gpt-4-turbo", "gemini-2.5-pro"),
            ("gpt-3.5-turbo", "gemini-2.5-flash"),
            ("gpt-5", "gemini-3-pro-preview"),
            ("o1", "gemini-2.5-pro"),
            ("o3", "gemini-3-pro-preview"),
            ("gemini-pro", "gemini-2.5-pro"),
            ("gemini-flash", "gemini-2.5-flash"),
        ])
    })
}

/// The dynamic `gemini-3-pro-image` variant grid (`spec.md` §3): the base id
/// crossed with optional resolution and aspect suffixes. Recognized as
/// already-canonical upstream ids (identity route).
pub fn image_variant_ids() -> Vec<String> {
    const RESOLUTIONS: [&str; 3] = ["", "-2k", "-4k"];
    const ASPECTS: [&str; 7] = ["", "-1x1", "-4x3", "-3x4", "-16x9", "-9x16", "-21x9"];
    let mut out = Vec::with_capacity(RESOLUTIONS.len() * ASPECTS.len());
    for res in RESOLUTIONS {
        for aspect in ASPECTS {
            out.push(format!("gemini-3-pro-image{res}{aspect}"));
        }
    }
    out
}

fn is_known_image_variant(model: &str) -> bool {
    image_variant_ids().iter().any(|id| id == model)
}

/// Canonical Gemini base ids the static alias table and family mapping ever
/// route to, not otherwise enumerable from `static_alias_table` (whose keys
/// are the *input* aliases, not the upstream targets).
const GEMINI_BASE_MODEL_IDS: [&str; 3] = ["gemini-2.5-pro", "gemini-2.5-flash", "gemini-3-pro-preview"];

/// The full set of model ids the static listing endpoints advertise: every
/// alias key recognized by `resolve_model_route`, the Gemini base ids those
/// aliases ever resolve to, and the dynamic image-variant grid.
pub fn known_model_ids() -> Vec<String> {
    let mut ids: Vec<String> = static_alias_table().keys().map(|k| k.to_string()).collect();
    for id in GEMINI_BASE_MODEL_IDS {
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids.extend(image_variant_ids());
    ids
}

/// Strip a leading `models/` prefix, the only normalization `spec.md` §4.3 requires.
pub fn normalize_model(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

/// `resolveModelRoute(model, customExact, anthropicFamily)` (`spec.md` §4.3).
///
/// Priority: custom exact/wildcard mapping, then family-group mapping
/// (Claude families via `anthropic_mapping`, OpenAI families via the static
/// table), then the static alias table, then identity. Unlike the donor's
/// `mapModel`, `custom_mapping` and `anthropic_mapping` are never merged into
/// one map — each is consulted at its own priority tier, fixing the
/// insertion-order defect `spec.md` §9 flags as a bug to repair.
pub fn resolve_model_route(
    model: &str,
    custom_mapping: &HashMap<String, String>,
    anthropic_mapping: &HashMap<String, String>,
) -> String {
    let model = normalize_model(model);

    if let Some(route) = lookup_custom_mapping(model, custom_mapping) {
        return route;
    }

    if let Some(family) = classify_claude_family(model) {
        if let Some(route) = anthropic_mapping.get(family.config_key()) {
            return route.clone();
        }
    }

    if let Some(family) = classify_openai_family(model) {
        return openai_family_target(family).to_string();
    }

    if is_known_image_variant(model) {
        return model.to_string();
    }

    if let Some(route) = static_alias_table().get(model) {
        return (*route).to_string();
    }

    model.to_string()
}

fn lookup_custom_mapping(model: &str, custom_mapping: &HashMap<String, String>) -> Option<String> {
    // Wildcard keys evaluated before exact lookups.
    for (pattern, target) in custom_mapping {
        if !pattern.contains('*') {
            continue;
        }
        if let Some(re) = compile_wildcard(pattern) {
            if re.is_match(model) {
                return Some(target.clone());
            }
        }
    }

    custom_mapping.get(model).cloned()
}

fn compile_wildcard(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    Regex::new(&format!("(?i)^{escaped}$")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_exact_wins_over_family_and_static() {
        let mut custom = HashMap::new();
        custom.insert("claude-sonnet-4-5".to_string(), "my-custom-model".to_string());
        let anthropic = HashMap::from([(
            "claude-4.5-series".to_string(),
            "gemini-should-not-win".to_string(),
        )]);
        assert_eq!(
            resolve_model_route("claude-sonnet-4-5", &custom, &anthropic),
            "my-custom-model"
        );
    }

    #[test]
    fn wildcard_custom_mapping_matches() {
        let mut custom = HashMap::new();
        custom.insert("claude-*".to_string(), "gemini-wild".to_string());
        let anthropic = HashMap::new();
        assert_eq!(
            resolve_model_route("claude-opus-4-5", &custom, &anthropic),
            "gemini-wild"
        );
    }

    #[test]
    fn claude_family_mapping_applies_without_custom_override() {
        let custom = HashMap::new();
        let anthropic = HashMap::from([(
            "claude-3.5-series".to_string(),
            "gemini-2.0-flash".to_string(),
        )]);
        assert_eq!(
            resolve_model_route("claude-3-5-sonnet-latest", &custom, &anthropic),
            "gemini-2.0-flash"
        );
    }

    #[test]
    fn openai_family_mapping_beats_static_exact_entry() {
        // "gpt-4o" is both a static-table exact key and a family match;
        // `spec.md` §4.3 priority puts family mapping ahead of the static table.
        let custom = HashMap::new();
        let anthropic = HashMap::new();
        assert_eq!(
            resolve_model_route("gpt-4o", &custom, &anthropic),
            openai_family_target(OpenAiFamily::Gpt4oOr35)
        );
    }

    #[test]
    fn falls_back_to_static_table_then_identity() {
        let custom = HashMap::new();
        let anthropic = HashMap::new();
        assert_eq!(
            resolve_model_route("gemini-pro", &custom, &anthropic),
            "gemini-2.5-pro"
        );
        assert_eq!(
            resolve_model_route("some-unknown-model", &custom, &anthropic),
            "some-unknown-model"
        );
    }

    #[test]
    fn strips_models_prefix() {
        let custom = HashMap::new();
        let anthropic = HashMap::new();
        assert_eq!(
            resolve_model_route("models/gemini-pro", &custom, &anthropic),
            "gemini-2.5-pro"
        );
    }

    #[test]
    fn openai_family_classification_excludes_mini_turbo_blends() {
        assert_eq!(classify_openai_family("gpt-4"), Some(OpenAiFamily::Gpt4));
        assert_eq!(classify_openai_family("o1-preview"), Some(OpenAiFamily::Gpt4));
        assert_eq!(
            classify_openai_family("gpt-4-turbo"),
            Some(OpenAiFamily::Gpt4oOr35)
        );
        assert_eq!(
            classify_openai_family("gpt-4o-mini"),
            Some(OpenAiFamily::Gpt4oOr35)
        );
        assert_eq!(classify_openai_family("gpt-5"), Some(OpenAiFamily::Gpt5));
    }

    #[test]
    fn known_model_ids_include_aliases_and_image_variants() {
        let ids = known_model_ids();
        assert!(ids.iter().any(|id| id == "claude-opus-4-5"));
        assert!(ids.iter().any(|id| id == "gemini-2.5-pro"));
        assert!(ids.iter().any(|id| id == "gemini-3-pro-image-4k-16x9"));
    }

    #[test]
    fn image_variant_ids_pass_through_as_identity() {
        let custom = HashMap::new();
        let anthropic = HashMap::new();
        let variant = "gemini-3-pro-image-4k-16x9";
        assert!(image_variant_ids().iter().any(|id| id == variant));
        assert_eq!(resolve_model_route(variant, &custom, &anthropic), variant);
    }
}
