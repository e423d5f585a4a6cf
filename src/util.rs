//! Parsing helpers for free-form model responses.

use serde_json::Value;

/// Outcome of reading a model response as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Parsed(Value),
    /// Nothing parseable was found; carries the first 200 chars of the response.
    Malformed(String),
}

/// Read a model response as JSON.
///
/// Tries, in order: the whole text, the body of a ```` ```json ```` fence,
/// the body of a bare ```` ``` ```` fence, and finally the outermost `{...}`
/// object embedded in prose.
pub fn parse_json_response(text: &str) -> ParsedResponse {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return ParsedResponse::Parsed(value);
    }

    let candidates = [
        fenced_block(trimmed, "```json"),
        fenced_block(trimmed, "```"),
        extract_json_object(trimmed),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(value) = serde_json::from_str(&candidate) {
            return ParsedResponse::Parsed(value);
        }
    }

    ParsedResponse::Malformed(trimmed.chars().take(200).collect())
}

fn fenced_block(text: &str, opener: &str) -> Option<String> {
    let start = text.find(opener)? + opener.len();
    let end = text[start..].find("```")? + start;
    Some(text[start..end].trim().to_string())
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}
