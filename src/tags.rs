//! Repair of tag lists that went through one or more bad serialization rounds.
//!
//! Sidecar files written by older tools contain tags as comma-joined strings,
//! JSON arrays re-encoded into strings, or arrays exploded into one element per
//! character. [`normalize_tags`] turns any of those back into a clean,
//! deduplicated, order-preserving list.

use serde_json::Value;
use std::collections::HashSet;

/// Wrapping pairs stripped from both ends of a tag, escaped quotes first.
const QUOTE_PAIRS: &[(&str, &str)] = &[
    ("\\\"", "\\\""),
    ("\"", "\""),
    ("'", "'"),
    ("\u{201c}", "\u{201d}"),
    ("\u{2018}", "\u{2019}"),
    ("\u{ab}", "\u{bb}"),
];

const BRACKETS: &[char] = &['[', ']'];

fn is_artifact(c: char) -> bool {
    BRACKETS.contains(&c)
        || c == '\\'
        || QUOTE_PAIRS
            .iter()
            .any(|(open, close)| open.contains(c) || close.contains(c))
}

/// Cleans a single tag: trims whitespace, stray brackets and any number of
/// symmetric quote layers. Returns `None` when nothing meaningful is left.
pub fn clean_tag(raw: &str) -> Option<String> {
    let mut s = raw.trim();
    loop {
        let before = s;
        s = s.trim_matches(BRACKETS).trim();
        for (open, close) in QUOTE_PAIRS {
            if s.len() >= open.len() + close.len() && s.starts_with(open) && s.ends_with(close) {
                s = s[open.len()..s.len() - close.len()].trim();
                break;
            }
        }
        if s == before {
            break;
        }
    }

    if s.is_empty() || s.chars().all(is_artifact) {
        None
    } else {
        Some(s.to_string())
    }
}

fn dedup(tags: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses `s` as a JSON array, looking through one extra layer of string encoding.
fn parse_json_list(s: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(s.trim()).ok()? {
        Value::Array(items) => Some(items),
        Value::String(inner) => match serde_json::from_str::<Value>(inner.trim()).ok()? {
            Value::Array(items) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

/// Detects a JSON array that was split into pieces and stored element by element.
fn parse_exploded(joined: &str) -> Option<Vec<Value>> {
    let s = joined.trim();
    if !(s.starts_with('[') || s.starts_with('"')) {
        return None;
    }
    if !(s.contains('[') && s.contains(']') && s.contains('"')) {
        return None;
    }
    parse_json_list(s).or_else(|| parse_json_list(&s.replace("\\\"", "\"")))
}

fn collect_values(items: &[Value], out: &mut Vec<String>) {
    for item in items {
        match item {
            Value::Null => {}
            Value::Array(inner) => collect_values(inner, out),
            other => out.extend(clean_tag(&value_text(other))),
        }
    }
}

fn is_clean(items: &[Value]) -> bool {
    let mut seen = HashSet::new();
    items.iter().all(|item| match item {
        Value::String(s) => clean_tag(s).as_deref() == Some(s.as_str()) && seen.insert(s.as_str()),
        _ => false,
    })
}

fn normalize_list(items: &[Value]) -> Vec<String> {
    if is_clean(items) {
        return items.iter().map(value_text).collect();
    }

    let joined: String = items.iter().map(value_text).collect();
    if let Some(parsed) = parse_exploded(&joined) {
        let mut out = Vec::new();
        collect_values(&parsed, &mut out);
        return dedup(out);
    }

    let mut out = Vec::new();
    collect_values(items, &mut out);
    dedup(out)
}

fn normalize_str(raw: &str) -> Vec<String> {
    if let Some(parsed) = parse_json_list(raw) {
        let mut out = Vec::new();
        collect_values(&parsed, &mut out);
        return dedup(out);
    }

    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');
    dedup(inner.split(',').filter_map(clean_tag).collect())
}

/// Normalizes a raw `tags` value of unknown shape. Pure and idempotent.
pub fn normalize_tags(raw: &Value) -> Vec<String> {
    match raw {
        Value::Array(items) => normalize_list(items),
        Value::String(s) => normalize_str(s),
        _ => Vec::new(),
    }
}

/// Decides whether a stored `tags` value must be rewritten to match `normalized`.
pub fn needs_rewrite(raw: Option<&Value>, normalized: &[String]) -> bool {
    match raw {
        Some(Value::Array(items)) => {
            let stored: Vec<String> = items
                .iter()
                .map(|v| value_text(v).trim().to_string())
                .collect();
            stored != normalized
        }
        Some(Value::String(_)) => true,
        _ => !normalized.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn clean_list_is_returned_unchanged() {
        let raw = json!(["red", "blue", "dragon"]);
        assert_eq!(normalize_tags(&raw), strings(&["red", "blue", "dragon"]));
    }

    #[test]
    fn repairs_split_array_artifact() {
        let raw = json!(["[\"Tag1\"", "\"Tag2\"]"]);
        assert_eq!(normalize_tags(&raw), strings(&["Tag1", "Tag2"]));
    }

    #[test]
    fn repairs_character_exploded_array() {
        let exploded: Vec<Value> = "[\"alpha\", \"beta\"]"
            .chars()
            .map(|c| Value::String(c.to_string()))
            .collect();
        assert_eq!(
            normalize_tags(&Value::Array(exploded)),
            strings(&["alpha", "beta"])
        );
    }

    #[test]
    fn repairs_exploded_array_with_escaped_quotes() {
        let exploded: Vec<Value> = "[\\\"alpha\\\", \\\"beta\\\"]"
            .chars()
            .map(|c| Value::String(c.to_string()))
            .collect();
        assert_eq!(
            normalize_tags(&Value::Array(exploded)),
            strings(&["alpha", "beta"])
        );
    }

    #[test]
    fn strips_nested_and_curly_quotes() {
        let raw = json!(["\"'mini'\"", "\u{201c}bust\u{201d}", "  [terrain]  "]);
        assert_eq!(normalize_tags(&raw), strings(&["mini", "bust", "terrain"]));
    }

    #[test]
    fn drops_empty_and_artifact_only_entries() {
        let raw = json!(["", "   ", "\"\"", "[", "]", "\"", "ok"]);
        assert_eq!(normalize_tags(&raw), strings(&["ok"]));
    }

    #[test]
    fn deduplicates_preserving_first_seen_order() {
        let raw = json!(["b", "a", "\"b\"", "c", "a"]);
        assert_eq!(normalize_tags(&raw), strings(&["b", "a", "c"]));
    }

    #[test]
    fn parses_json_array_string() {
        let raw = json!("[\"red\", \"blue\"]");
        assert_eq!(normalize_tags(&raw), strings(&["red", "blue"]));
    }

    #[test]
    fn parses_double_encoded_array_string() {
        let raw = json!("\"[\\\"red\\\", \\\"blue\\\"]\"");
        assert_eq!(normalize_tags(&raw), strings(&["red", "blue"]));
    }

    #[test]
    fn splits_comma_joined_string() {
        let raw = json!(" red, blue ,, 'green', red ");
        assert_eq!(normalize_tags(&raw), strings(&["red", "blue", "green"]));
    }

    #[test]
    fn strips_outer_brackets_of_non_json_string() {
        let raw = json!("['red', 'blue']");
        assert_eq!(normalize_tags(&raw), strings(&["red", "blue"]));
    }

    #[test]
    fn non_string_values_are_handled() {
        assert!(normalize_tags(&Value::Null).is_empty());
        assert!(normalize_tags(&json!(42)).is_empty());
        assert_eq!(normalize_tags(&json!([1, null, "x"])), strings(&["1", "x"]));
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = vec![
            json!(["[\"Tag1\"", "\"Tag2\"]"]),
            json!("[\"red\", \"blue\"]"),
            json!(" red, blue ,, 'green', red "),
            json!(["\"'mini'\"", "\u{201c}bust\u{201d}", "  [terrain]  "]),
            json!(["a[b]c", "\"odd", "it's"]),
            json!(["b", "a", "\"b\"", "c", "a"]),
        ];
        for input in inputs {
            let once = normalize_tags(&input);
            let twice = normalize_tags(&json!(once));
            assert_eq!(once, twice, "not idempotent for {}", input);
        }
    }

    #[test]
    fn rewrite_detection_follows_stored_shape() {
        let clean = strings(&["red"]);
        assert!(!needs_rewrite(Some(&json!(["red"])), &clean));
        assert!(!needs_rewrite(Some(&json!([" red "])), &clean));
        assert!(needs_rewrite(Some(&json!(["\"red\""])), &clean));
        assert!(needs_rewrite(Some(&json!("red")), &clean));
        assert!(!needs_rewrite(None, &[]));
        assert!(!needs_rewrite(Some(&json!(null)), &[]));
    }
}
