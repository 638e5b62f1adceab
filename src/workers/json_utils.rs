//! Locating the JSON payload in command output.
//!
//! Agent commands often wrap their answer in prose. The worker adapter needs
//! the `{"output", "structured_result"}` object and the decomposer needs the
//! phase list, given either as a bare array or as `{"phases": [...]}`.

/// Slice of `text` holding the JSON payload, if any.
///
/// A fenced ```json block wins. Otherwise the payload runs from the first
/// `{` or `[` to the last matching closer of the same kind.
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return Some(text[content_start..content_start + end].trim());
        }
    }

    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}
