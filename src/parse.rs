//! Pulling structured data out of model output.
//!
//! Models wrap JSON in prose or code fences often enough that every
//! caller goes through [`extract_json`] rather than `serde_json::from_str`.

use serde_json::Value;

/// Find the first JSON object or array in `text`.
///
/// Tries, in order: the whole text, the body of a fenced code block, and
/// the outermost `{...}` / `[...]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }

    if let Some(body) = fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(body.trim()) {
            return Some(v);
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an optional language tag on the opening fence line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Read a score field as a number in `[0, 1]`.
///
/// Accepts numbers and numeric strings; values on a 0–10 or 0–100 scale
/// are normalised.
pub fn unit_score(value: &Value, key: &str) -> Option<f64> {
    let raw = match value.get(key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let scaled = if raw <= 1.0 {
        raw
    } else if raw <= 10.0 {
        raw / 10.0
    } else {
        raw / 100.0
    };
    Some(scaled.clamp(0.0, 1.0))
}

/// Read a string field, trimmed; empty strings become `None`.
pub fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Read an array of strings, skipping non-string and blank entries.
pub fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Read an array of 1-based labels (`[1, "2", "[3]"]`) as integers.
pub fn label_list(value: &Value, key: &str) -> Vec<usize> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| match i {
                    Value::Number(n) => n.as_u64().map(|n| n as usize),
                    Value::String(s) => s
                        .trim()
                        .trim_start_matches('[')
                        .trim_end_matches(']')
                        .parse::<usize>()
                        .ok(),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Read a boolean field, accepting `"true"`/`"false"` strings.
pub fn bool_field(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
    }

    #[test]
    fn fenced_json() {
        let text = "Here you go:\n```json\n{\"answer\": \"x\"}\n```\nthanks";
        assert_eq!(extract_json(text), Some(json!({"answer": "x"})));
    }

    #[test]
    fn embedded_json() {
        let text = "The result is {\"score\": 0.5} as requested.";
        assert_eq!(extract_json(text), Some(json!({"score": 0.5})));
    }

    #[test]
    fn no_json() {
        assert_eq!(extract_json("no structure here"), None);
        assert_eq!(extract_json("42"), None);
    }

    #[test]
    fn scores_are_normalised() {
        let v = json!({"a": 0.4, "b": 8, "c": "75%", "d": -1, "e": "x"});
        assert_eq!(unit_score(&v, "a"), Some(0.4));
        assert_eq!(unit_score(&v, "b"), Some(0.8));
        assert_eq!(unit_score(&v, "c"), Some(0.75));
        assert_eq!(unit_score(&v, "d"), None);
        assert_eq!(unit_score(&v, "e"), None);
        assert_eq!(unit_score(&v, "missing"), None);
    }

    #[test]
    fn labels_accept_mixed_forms() {
        let v = json!({"citations": [1, "2", "[3]", "x", null]});
        assert_eq!(label_list(&v, "citations"), vec![1, 2, 3]);
    }

    #[test]
    fn lists_and_flags() {
        let v = json!({"items": ["a", " ", 3, "b "], "flag": "yes"});
        assert_eq!(string_list(&v, "items"), vec!["a", "b"]);
        assert_eq!(bool_field(&v, "flag"), Some(true));
        assert_eq!(text_field(&v, "missing"), None);
    }
}
