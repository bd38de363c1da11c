//! Deterministic extraction of file targets named in prompt text.

use std::sync::LazyLock;

use regex::Regex;

static FILE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\.{1,2}/|/)?(?:[\w\-.]+/)*[\w\-]+(?:\.[\w\-]+)*\.[A-Za-z][A-Za-z0-9]{0,9}$")
        .expect("file token regex should be valid")
});

/// Abbreviations that look like `stem.ext` but never name a file.
const NOT_FILES: [&str; 4] = ["e.g", "i.e", "etc.etc", "a.k.a"];

/// Extract distinct file-like targets from `prompt` in order of appearance.
///
/// A target is a whitespace-separated token (with surrounding quotes,
/// backticks, brackets and trailing punctuation removed) shaped like
/// `dir/name.ext`. URLs are ignored.
pub fn extract_file_targets(prompt: &str) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for raw in prompt.split_whitespace() {
        if raw.contains("://") {
            continue;
        }
        let token = raw
            .trim_start_matches(['(', '[', '"', '\'', '`', '<'])
            .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '"', '\'', '`', '>']);
        if token.is_empty() || NOT_FILES.contains(&token.to_ascii_lowercase().as_str()) {
            continue;
        }
        if !FILE_TOKEN_RE.is_match(token) {
            continue;
        }
        if !targets.iter().any(|existing| existing == token) {
            targets.push(token.to_string());
        }
    }
    targets
}
