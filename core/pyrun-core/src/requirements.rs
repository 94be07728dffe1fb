//! Dependency manifest parsing.
//!
//! `requirements.txt` holds one specifier per line. Blank lines, comments and
//! pip option lines are ignored; entries that do not look like a specifier are
//! skipped with a warning instead of failing the whole install.

use once_cell::sync::Lazy;
use regex::Regex;

/// Package name, optional extras, then an optional version clause,
/// environment marker or direct reference.
static RE_SPECIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?(?:\s*\[[A-Za-z0-9._,\s-]*\])?\s*(?:(?:===|==|!=|~=|<=|>=|<|>)\s*[^\s;]+(?:\s*,\s*(?:===|==|!=|~=|<=|>=|<|>)\s*[^\s;]+)*)?\s*(?:;.*|@\s*\S+)?$",
    )
    .unwrap()
});

/// Parses manifest text into installable specifiers, preserving order.
pub fn parse_manifest(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|raw| {
            let line = strip_comment(raw).trim();
            if line.is_empty() || line.starts_with('-') {
                return None;
            }
            if RE_SPECIFIER.is_match(line) {
                Some(line.to_string())
            } else {
                tracing::warn!(entry = %line, "Skipping unresolvable requirement");
                None
            }
        })
        .collect()
}

fn strip_comment(line: &str) -> &str {
    // A '#' only starts a comment at line start or after whitespace;
    // it can legitimately appear inside URLs (`pkg @ https://...#egg=pkg`).
    let bytes = line.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        if *byte == b'#' && (index == 0 || bytes[index - 1].is_ascii_whitespace()) {
            return &line[..index];
        }
    }
    line
}
