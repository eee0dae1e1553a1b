//! Credential redaction for persisted text.

use std::sync::LazyLock;

use regex::Regex;

const REDACTED: &str = "[REDACTED]";
const TRUNCATED: &str = "...[truncated]";

/// Key/value assignments keep the key name and any opening quote.
const ASSIGNMENT_REPLACEMENT: &str = "${1}${2}[REDACTED]";

static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // "api_key": "...", client_secret=..., auth_token: ...
        (
            concat!(
                r"(?i)(\w*(?:api[_-]?key|secret|token|password|passwd))",
                r#"(["']?\s*[:=]\s*["']?)[^\s"',;}]+"#,
            ),
            ASSIGNMENT_REPLACEMENT,
        ),
        // OpenAI / Anthropic style keys
        (r"sk-[A-Za-z0-9_\-]{8,}", REDACTED),
        (r"(?i)bearer\s+[A-Za-z0-9._~+/\-]+=*", REDACTED),
        // AWS access key ids
        (r"\bAKIA[0-9A-Z]{16}\b", REDACTED),
        // GitHub tokens
        (r"\bgh[pousr]_[A-Za-z0-9]{20,}\b", REDACTED),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Replace credential-shaped substrings with a marker.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for (re, replacement) in SECRET_PATTERNS.iter() {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    out
}

/// Cut `text` to at most `max_chars` characters, marking the cut when the
/// limit leaves room for the marker.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let marker_len = TRUNCATED.chars().count();
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }
    let kept: String = text.chars().take(max_chars - marker_len).collect();
    format!("{kept}{TRUNCATED}")
}

/// Redact and cap text before it is persisted.
pub fn sanitize(text: &str, max_chars: usize) -> String {
    truncate(&redact(text), max_chars)
}
