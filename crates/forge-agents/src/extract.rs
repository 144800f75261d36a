//! Extraction helpers for provider responses
//!
//! Backends wrap their payloads in markdown fences more often than not;
//! these helpers pull the payload out and fall back to the raw text when no
//! fence is present.

/// Extract the body of the first fenced block tagged `lang` (or any fence
/// when `lang` is empty). Returns `None` when the response has no usable
/// fence.
pub fn fenced_block(text: &str, lang: &str) -> Option<String> {
    let mut in_block = false;
    let mut matched = false;
    let mut body = String::new();

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(tag) = trimmed.strip_prefix("```") {
            if in_block {
                if matched {
                    return Some(body);
                }
                in_block = false;
                body.clear();
            } else {
                in_block = true;
                matched = lang.is_empty() || tag.trim().eq_ignore_ascii_case(lang);
            }
            continue;
        }
        if in_block && matched {
            body.push_str(line);
            body.push('\n');
        }
    }

    // Unterminated fence still counts; some backends truncate the closer
    (matched && !body.is_empty()).then_some(body)
}

/// Pull a unified diff out of a response: fenced `diff` block first, then
/// any fence containing diff headers, then the raw text if it already looks
/// like a diff.
pub fn unified_diff(text: &str) -> Option<String> {
    if let Some(block) = fenced_block(text, "diff") {
        return Some(block);
    }
    if let Some(block) = fenced_block(text, "") {
        if looks_like_diff(&block) {
            return Some(block);
        }
    }
    looks_like_diff(text).then(|| text.to_string())
}

fn looks_like_diff(text: &str) -> bool {
    text.lines().any(|l| l.starts_with("+++ ")) && text.lines().any(|l| l.starts_with("--- "))
}
