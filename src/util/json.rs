//! Lenient extraction of JSON structure from free-form LLM text.
//!
//! Per the external LLM client contract, a chat response is opaque natural
//! language; any JSON structure in it comes from either a fenced code
//! block or bare braces. The kernel never treats an unparseable response
//! as a hard error — callers fall back to defaults and record a warning.

use serde_json::Value;

/// Attempts to extract a JSON value from free-form LLM output.
///
/// Tries, in order:
/// 1. A ```json fenced code block.
/// 2. Any fenced code block whose body starts with `{`.
/// 3. The substring between the first `{` and the last `}`.
///
/// Returns `None` if none of these parse as valid JSON.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(body) = fenced_block(text, Some("json")) {
        if let Ok(v) = serde_json::from_str(&body) {
            return Some(v);
        }
    }
    if let Some(body) = fenced_block(text, None) {
        if body.trim_start().starts_with('{') {
            if let Ok(v) = serde_json::from_str(&body) {
                return Some(v);
            }
        }
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            let candidate = &text[start..=end];
            if let Ok(v) = serde_json::from_str(candidate) {
                return Some(v);
            }
        }
    }
    None
}

/// Extracts the body of the first fenced code block, optionally filtered
/// by language tag (e.g. `json`). Ignores the tag when `lang` is `None`.
fn fenced_block(text: &str, lang: Option<&str>) -> Option<String> {
    let mut rest = text;
    loop {
        let start = rest.find("```")?;
        let after_fence = &rest[start + 3..];
        let newline = after_fence.find('\n')?;
        let tag = after_fence[..newline].trim();
        let body_start = &after_fence[newline + 1..];
        let end = body_start.find("```")?;
        let body = &body_start[..end];

        match lang {
            Some(want) if tag.eq_ignore_ascii_case(want) => return Some(body.to_string()),
            Some(_) => {
                rest = &body_start[end + 3..];
                continue;
            }
            None => return Some(body.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json_block() {
        let text = "here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        let v = extract_json(text).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn extracts_bare_fenced_block_starting_with_brace() {
        let text = "```\n{\"b\": 2}\n```";
        let v = extract_json(text).unwrap();
        assert_eq!(v["b"], 2);
    }

    #[test]
    fn falls_back_to_first_and_last_brace() {
        let text = "sure, the result is {\"c\": 3} as requested.";
        let v = extract_json(text).unwrap();
        assert_eq!(v["c"], 3);
    }

    #[test]
    fn returns_none_on_garbage() {
        assert!(extract_json("no json here at all").is_none());
    }

    #[test]
    fn skips_non_json_fence_to_find_json_one() {
        let text = "```python\nprint('hi')\n```\n```json\n{\"d\": 4}\n```";
        let v = extract_json(text).unwrap();
        assert_eq!(v["d"], 4);
    }

    #[test]
    fn prefers_outermost_braces_over_nested_text() {
        let text = "{\"outer\": {\"inner\": 1}}";
        let v = extract_json(text).unwrap();
        assert_eq!(v["outer"]["inner"], 1);
    }
}
