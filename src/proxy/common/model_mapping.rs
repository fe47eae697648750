// Model alias resolution and per-family capabilities.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Alias table: client-facing names to the canonical ids the upstream
/// accepts. Date-suffixed Anthropic ids and the bare family shorthands all
/// land on a canonical entry.
static MODEL_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();

    // Canonical ids map to themselves
    m.insert("claude-sonnet-4-5", "claude-sonnet-4-5");
    m.insert("claude-sonnet-4-5-thinking", "claude-sonnet-4-5-thinking");
    m.insert("claude-opus-4-5-thinking", "claude-opus-4-5-thinking");
    m.insert("gemini-2.5-flash", "gemini-2.5-flash");
    m.insert("gemini-2.5-flash-lite", "gemini-2.5-flash-lite");
    m.insert("gemini-2.5-flash-thinking", "gemini-2.5-flash-thinking");
    m.insert("gemini-2.5-pro", "gemini-2.5-pro");
    m.insert("gemini-3-pro-preview", "gemini-3-pro-preview");

    // Shorthand aliases
    m.insert("sonnet", "claude-sonnet-4-5");
    m.insert("opus", "claude-opus-4-5-thinking");
    m.insert("haiku", "gemini-2.5-flash-lite");

    // Dated Anthropic ids
    m.insert("claude-sonnet-4-5-20250929", "claude-sonnet-4-5-thinking");
    m.insert("claude-opus-4-5-20251101", "claude-opus-4-5-thinking");
    m.insert("claude-haiku-4-5-20251001", "gemini-2.5-flash-lite");
    m.insert("claude-3-5-sonnet-20241022", "claude-sonnet-4-5");
    m.insert("claude-3-5-sonnet-20240620", "claude-sonnet-4-5");
    m.insert("claude-3-haiku-20240307", "gemini-2.5-flash-lite");

    m
});

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Resolve a client-supplied model name to its canonical upstream id.
pub fn resolve_model_alias(input: &str) -> String {
    if let Some(mapped) = MODEL_ALIASES.get(input) {
        return mapped.to_string();
    }

    // Pass through dynamic upstream ids the table does not enumerate
    if input.starts_with("gemini-") || input.starts_with("claude-") {
        return input.to_string();
    }

    DEFAULT_MODEL.to_string()
}

/// Whether the canonical model emits thought parts.
pub fn is_thinking_model(model: &str) -> bool {
    model.ends_with("-thinking") || model.starts_with("gemini-3-pro")
}

pub fn is_gemini_family(model: &str) -> bool {
    model.starts_with("gemini-")
}

/// Hard output ceiling per model family; `max_tokens` is clamped to this.
pub fn max_output_tokens(model: &str) -> u32 {
    if model.contains("flash-lite") {
        8_192
    } else if is_gemini_family(model) {
        65_536
    } else {
        64_000
    }
}

/// Thinking budget for Gemini-family thinking models. Flash variants carry
/// a lower ceiling than pro.
pub fn thinking_budget(model: &str) -> u32 {
    if model.contains("flash") {
        24_576
    } else {
        32_768
    }
}

/// Canonical ids advertised on `/v1/models`.
pub fn supported_models() -> Vec<&'static str> {
    let mut models: Vec<&'static str> = MODEL_ALIASES
        .values()
        .copied()
        .collect::<std::collections::HashSet<_>>()
        .into_iter()
        .collect();
    models.sort_unstable();
    models
}
