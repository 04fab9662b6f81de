//! Pull the YAML document out of free-form model output.
//!
//! CLI agents print banners, prose and Markdown fences around the answer.
//! Extraction order: a ```` ```yaml ```` fence, any fence, text from the
//! first line beginning with `type:`, then the trimmed input.

use regex::Regex;
use std::sync::OnceLock;

fn yaml_fence() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)```ya?ml[ \t]*\r?\n(.+?)\r?\n[ \t]*```").ok())
        .as_ref()
}

fn any_fence() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)```[a-zA-Z0-9_-]*[ \t]*\r?\n(.+?)\r?\n[ \t]*```").ok())
        .as_ref()
}

fn type_anchor() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?m)^type:").ok())
        .as_ref()
}

/// Return the YAML document embedded in `response`.
pub fn extract_yaml(response: &str) -> String {
    let response = response.trim();

    for pattern in [yaml_fence(), any_fence()].into_iter().flatten() {
        if let Some(body) = pattern.captures(response).and_then(|c| c.get(1)) {
            return body.as_str().trim().to_string();
        }
    }

    if let Some(anchor) = type_anchor().and_then(|re| re.find(response)) {
        return response[anchor.start()..].trim().to_string();
    }

    response.to_string()
}
