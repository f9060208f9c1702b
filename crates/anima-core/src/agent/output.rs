//! Structured-output recovery for the agent's final message.
//!
//! Parse order: direct JSON parse, then a single level of object
//! unwrapping (`feedback` / `items` / `analysis`), then balanced-array
//! extraction from surrounding prose. Salvage is a fallback only.

use regex::Regex;
use serde_json::Value;

use crate::types::FeedbackItem;

/// Keys tried when the payload is an object wrapping the item array.
const WRAPPER_KEYS: [&str; 3] = ["feedback", "items", "analysis"];

/// Extract feedback items from a raw model response. Invalid items are
/// skipped with a reason; they never fail the whole batch.
pub fn extract_feedback_items(raw: &str, max_items: usize) -> (Vec<FeedbackItem>, Vec<String>) {
    let mut skipped = Vec::new();

    let Some(values) = candidate_array(raw) else {
        return (Vec::new(), vec!["no JSON array found in response".to_string()]);
    };

    let mut items = Vec::new();
    for (i, value) in values.into_iter().enumerate() {
        if items.len() >= max_items {
            break;
        }
        match validate_item(value) {
            Ok(item) => items.push(item),
            Err(reason) => {
                tracing::debug!(index = i, reason = %reason, "Skipping invalid feedback item");
                skipped.push(format!("item {}: {}", i, reason));
            }
        }
    }

    (items, skipped)
}

fn candidate_array(raw: &str) -> Option<Vec<Value>> {
    let stripped = strip_code_fences(raw);
    let text = stripped.trim();

    // 1. Direct parse
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if let Some(values) = unwrap_array(value) {
            return Some(values);
        }
    }

    // 2. Balanced array embedded in prose. Prose can contain incidental
    // bracketed spans, so prefer the first array of objects; fall back to
    // the first array of any shape (covers a bare `[]`).
    let mut fallback: Option<Vec<Value>> = None;
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('[') {
        let start = search_from + offset;
        if let Some(candidate) = balanced_array_at(text, start) {
            if let Ok(Value::Array(values)) = serde_json::from_str::<Value>(candidate) {
                if !values.is_empty() && values.iter().all(|v| v.is_object()) {
                    return Some(values);
                }
                fallback.get_or_insert(values);
            }
        }
        search_from = start + 1;
    }

    fallback
}

/// Top-level array, or one level of object unwrapping.
fn unwrap_array(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(values) => Some(values),
        Value::Object(map) => {
            for key in WRAPPER_KEYS {
                if let Some(Value::Array(values)) = map.get(key) {
                    return Some(values.clone());
                }
            }
            None
        }
        _ => None,
    }
}

fn strip_code_fences(raw: &str) -> String {
    // ```json ... ``` or plain ``` fences around the payload
    let Ok(fence) = Regex::new(r"(?s)```(?:json)?\s*(.*?)```") else {
        return raw.to_string();
    };
    if let Some(captures) = fence.captures(raw) {
        return captures[1].to_string();
    }
    raw.to_string()
}

/// Return the balanced `[...]` substring starting at `start`, tracking
/// string literals and escapes so brackets inside strings don't count.
fn balanced_array_at(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes.get(start), Some(&b'['));

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn validate_item(value: Value) -> Result<FeedbackItem, String> {
    let mut item: FeedbackItem =
        serde_json::from_value(value).map_err(|e| format!("schema mismatch: {}", e))?;

    if item.title.trim().is_empty() {
        return Err("empty title".into());
    }
    if item.content.trim().is_empty() {
        return Err("empty content".into());
    }
    item.confidence = item.confidence.clamp(0.0, 1.0);
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedbackCategory, FeedbackType};

    fn item_json(title: &str) -> String {
        format!(
            r#"{{"type":"issue","category":"clarity","title":"{}","content":"Too vague.","severity":"medium","confidence":0.7}}"#,
            title
        )
    }

    #[test]
    fn parses_top_level_array() {
        let raw = format!("[{}]", item_json("A"));
        let (items, skipped) = extract_feedback_items(&raw, 10);
        assert_eq!(items.len(), 1);
        assert!(skipped.is_empty());
        assert_eq!(items[0].feedback_type, FeedbackType::Issue);
        assert_eq!(items[0].category, FeedbackCategory::Clarity);
    }

    #[test]
    fn unwraps_each_wrapper_key() {
        for key in ["feedback", "items", "analysis"] {
            let raw = format!(r#"{{"{}": [{}]}}"#, key, item_json("A"));
            let (items, _) = extract_feedback_items(&raw, 10);
            assert_eq!(items.len(), 1, "wrapper key {}", key);
        }
    }

    #[test]
    fn salvages_array_from_prose_and_fences() {
        let embedded = format!(
            "Here is my analysis:\n```json\n[{}]\n```\nHope that helps!",
            item_json("A")
        );
        let prose = format!("My feedback [notes [1]] follows: [{}] done.", item_json("B"));

        let (items, _) = extract_feedback_items(&embedded, 10);
        assert_eq!(items.len(), 1);
        let (items, _) = extract_feedback_items(&prose, 10);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "B");
    }

    #[test]
    fn all_three_shapes_yield_the_same_items() {
        let array = format!("[{}]", item_json("Same"));
        let wrapped = format!(r#"{{"feedback": {}}}"#, array);
        let prose = format!("Analysis follows. {} That is all.", array);

        let a = extract_feedback_items(&array, 10).0;
        let b = extract_feedback_items(&wrapped, 10).0;
        let c = extract_feedback_items(&prose, 10).0;
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].title, b[0].title);
        assert_eq!(b[0].title, c[0].title);
    }

    #[test]
    fn invalid_items_are_skipped_not_fatal() {
        let raw = format!(
            r#"[{}, {{"type":"issue","title":"missing fields"}}, {}]"#,
            item_json("A"),
            item_json("B")
        );
        let (items, skipped) = extract_feedback_items(&raw, 10);
        assert_eq!(items.len(), 2);
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn confidence_is_clamped() {
        let raw = r#"[{"type":"praise","category":"voice","title":"T","content":"C","severity":"low","confidence":1.8}]"#;
        let (items, _) = extract_feedback_items(raw, 10);
        assert_eq!(items[0].confidence, 1.0);
    }

    #[test]
    fn cap_is_enforced() {
        let raw = format!("[{},{},{}]", item_json("A"), item_json("B"), item_json("C"));
        let (items, _) = extract_feedback_items(&raw, 2);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn garbage_yields_no_items_with_reason() {
        let (items, skipped) = extract_feedback_items("I could not produce feedback.", 10);
        assert!(items.is_empty());
        assert!(!skipped.is_empty());
    }

    #[test]
    fn brackets_inside_strings_do_not_confuse_salvage() {
        let raw = format!(
            r#"Note "see [section 2]" then [{}]"#,
            item_json("Bracketed")
        );
        let (items, _) = extract_feedback_items(&raw, 10);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Bracketed");
    }
}
