//! Recover a JSON value from raw LLM response text.
//!
//! Model output arrives wrapped in markdown fences, prefixed with chatter,
//! double-encoded as a JSON string, or cut off mid-array when the response
//! hits its token ceiling. [`extract`] normalises the text once and then
//! tries an ordered list of pure strategies, returning the first hit.
//!
//! ## Why a strategy list?
//!
//! Each strategy is a plain `fn(&str) -> Option<Value>`, so every recovery
//! technique can be tested on its own and the order of preference is
//! visible in one place ([`STRATEGIES`]).
//!
//! A `None` result means "no data": callers must not guess a structure.

use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

/// A single recovery strategy.
pub type ExtractStrategy = fn(&str) -> Option<Value>;

/// Recovery strategies in order of preference.
pub const STRATEGIES: &[(&str, ExtractStrategy)] = &[
    ("direct", parse_direct),
    ("outer-slice", parse_outer_slice),
    ("balanced-prefix", parse_balanced_prefix),
    ("array-objects", collect_array_objects),
];

/// Extract the most complete JSON value from `text`.
pub fn extract(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if !trimmed.starts_with('"') {
        if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
            return Some(v);
        }
    }

    // A double-encoded response: unescape one level. A plain JSON string whose
    // contents are not JSON-looking is itself the value.
    if let Some(inner) = unescape_quoted(trimmed) {
        let inner_trim = inner.trim_start();
        if inner_trim.starts_with('{') || inner_trim.starts_with('[') || inner_trim.starts_with("```") {
            if let Some(v) = run_strategies(&strip_fence(&inner)) {
                return Some(v);
            }
        }
        return Some(Value::String(inner));
    }

    run_strategies(&strip_fence(trimmed))
}

/// Read a saved raw response and run it through [`extract`].
pub fn extract_from_file(path: &Path) -> std::io::Result<Option<Value>> {
    let text = std::fs::read_to_string(path)?;
    Ok(extract(&text))
}

fn run_strategies(candidate: &str) -> Option<Value> {
    STRATEGIES.iter().find_map(|(name, strategy)| {
        let value = strategy(candidate)?;
        debug!("JSON recovered by '{}' strategy", name);
        Some(value)
    })
}

// ── Normalisation ────────────────────────────────────────────────────────

fn unescape_quoted(text: &str) -> Option<String> {
    if text.len() < 2 || !text.starts_with('"') || !text.ends_with('"') {
        return None;
    }
    serde_json::from_str::<String>(text).ok()
}

/// Return the interior of the first fenced block, or the input unchanged.
///
/// A fence with no closing marker yields everything after the opening line;
/// that is how a response cut off at the token limit usually looks.
pub fn strip_fence(text: &str) -> String {
    let open = match text.find("```json").or_else(|| text.find("```")) {
        Some(i) => i,
        None => return text.trim().to_string(),
    };
    let after_ticks = &text[open + 3..];
    // Skip the info string ("json", "JSON", ...) up to the end of the line.
    let body_start = after_ticks.find('\n').map(|i| i + 1).unwrap_or_else(|| {
        after_ticks
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(after_ticks.len())
    });
    let body = &after_ticks[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim().to_string(),
        None => {
            warn!("Fenced block has no closing marker, response possibly truncated");
            body.trim().to_string()
        }
    }
}

// ── Strategies ───────────────────────────────────────────────────────────

/// Parse the candidate as-is. When it starts with a container, a trailing
/// second value is ignored and only the first one is used.
pub fn parse_direct(candidate: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(candidate) {
        return Some(v);
    }
    if !(candidate.starts_with('{') || candidate.starts_with('[')) {
        return None;
    }
    serde_json::Deserializer::from_str(candidate)
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok)
}

/// Parse from the first opening bracket to the last closing bracket.
pub fn parse_outer_slice(candidate: &str) -> Option<Value> {
    let start = candidate.find(['{', '['])?;
    let end = candidate.rfind(['}', ']'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&candidate[start..=end]).ok()
}

/// Find the longest prefix that parses once its open containers are closed.
pub fn parse_balanced_prefix(candidate: &str) -> Option<Value> {
    let start = candidate.find(['{', '['])?;
    let text = &candidate[start..];
    let cuts = cut_points(text);
    if cuts.is_empty() {
        return None;
    }

    let try_cut = |i: usize| -> Option<Value> {
        let cut = &cuts[i];
        let mut repaired = String::with_capacity(cut.end + cut.closers.len());
        repaired.push_str(&text[..cut.end]);
        repaired.push_str(&cut.closers);
        serde_json::from_str(&repaired).ok()
    };

    // Binary search for the largest parseable cut, then walk down from the
    // end in case validity is not monotonic across cut points.
    let (mut lo, mut hi) = (0isize, cuts.len() as isize - 1);
    let mut best: Option<(usize, Value)> = None;
    while lo <= hi {
        let mid = ((lo + hi) / 2) as usize;
        match try_cut(mid) {
            Some(v) => {
                best = Some((mid, v));
                lo = mid as isize + 1;
            }
            None => hi = mid as isize - 1,
        }
    }

    let floor = best.as_ref().map(|(i, _)| i + 1).unwrap_or(0);
    for i in (floor..cuts.len()).rev().take(LINEAR_FALLBACK_LIMIT) {
        if let Some(v) = try_cut(i) {
            return Some(v);
        }
    }
    best.map(|(_, v)| v)
}

const LINEAR_FALLBACK_LIMIT: usize = 64;

/// Collect every complete object that sits directly inside an array.
pub fn collect_array_objects(candidate: &str) -> Option<Value> {
    let bytes = candidate.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut object_start: Option<(usize, usize)> = None;
    let mut found = Vec::new();

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if stack.last() == Some(&b'[') && object_start.is_none() {
                    object_start = Some((i, stack.len()));
                }
                stack.push(b'{');
            }
            b'[' => stack.push(b'['),
            b'}' | b']' => {
                stack.pop();
                if b == b'}' {
                    if let Some((s, depth)) = object_start {
                        if stack.len() == depth {
                            if let Ok(v) = serde_json::from_str::<Value>(&candidate[s..=i]) {
                                found.push(v);
                            }
                            object_start = None;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if found.is_empty() {
        None
    } else {
        Some(serde_json::json!({ "data": found }))
    }
}

// ── Depth scanning ───────────────────────────────────────────────────────

struct Cut {
    end: usize,
    closers: String,
}

/// Positions where the text can be cut and closed into valid JSON: right
/// after a nested container closes, and right before a separating comma.
fn cut_points(text: &str) -> Vec<Cut> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut cuts = Vec::new();

    let closers = |stack: &[u8]| -> String {
        stack
            .iter()
            .rev()
            .map(|&b| if b == b'{' { '}' } else { ']' })
            .collect()
    };

    for (i, b) in text.bytes().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => stack.push(b),
            b'}' | b']' => {
                stack.pop();
                if stack.is_empty() {
                    cuts.push(Cut {
                        end: i + 1,
                        closers: String::new(),
                    });
                    break;
                }
                cuts.push(Cut {
                    end: i + 1,
                    closers: closers(&stack),
                });
            }
            b',' if !stack.is_empty() => cuts.push(Cut {
                end: i,
                closers: closers(&stack),
            }),
            _ => {}
        }
    }
    cuts
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn fenced_block_is_unwrapped() {
        let text = "Here you go:\n```json\n{\"data\": [1, 2]}\n```\nThanks";
        assert_eq!(extract(text), Some(json!({"data": [1, 2]})));
    }

    #[test]
    fn plain_fence_without_language() {
        let text = "```\n[{\"a\": 1}]\n```";
        assert_eq!(extract(text), Some(json!([{"a": 1}])));
    }

    #[test]
    fn double_encoded_response() {
        let inner = r#"{"rows": [{"Number": "1"}]}"#;
        let encoded = serde_json::to_string(inner).unwrap();
        assert_eq!(extract(&encoded), Some(json!({"rows": [{"Number": "1"}]})));
    }

    #[test]
    fn prose_around_object() {
        let text = "Sure! The result is {\"a\": {\"b\": 2}} as requested.";
        assert_eq!(extract(text), Some(json!({"a": {"b": 2}})));
    }

    #[test]
    fn only_first_of_multiple_values_is_used() {
        assert_eq!(extract("{\"a\":1}\n{\"b\":2}"), Some(json!({"a": 1})));
    }

    #[test]
    fn truncated_fence_keeps_complete_records() {
        let text = "```json\n{\"data\":[{\"a\":1},{\"a\":2}";
        let v = extract(text).expect("value");
        let data = v["data"].as_array().expect("array");
        assert!(data.contains(&json!({"a": 1})), "got {v}");
    }

    #[test]
    fn truncated_mid_string_drops_partial_record() {
        let text = r#"{"data":[{"a":"x"},{"a":"unterminated"#;
        assert_eq!(extract(text), Some(json!({"data": [{"a": "x"}]})));
    }

    #[test]
    fn brackets_inside_strings_are_not_structural() {
        let text = r#"{"data":[{"t":"a } ] \" {"},{"t":"b"#;
        assert_eq!(extract(text), Some(json!({"data": [{"t": "a } ] \" {"}]})));
    }

    #[test]
    fn truncated_after_comma() {
        let text = r#"[{"a":1},{"a":2},"#;
        assert_eq!(parse_balanced_prefix(text), Some(json!([{"a": 1}, {"a": 2}])));
    }

    #[test]
    fn array_objects_collected_as_data() {
        let text = r#"noise [{"a":1}, {"a":2} garbage"#;
        assert_eq!(
            collect_array_objects(text),
            Some(json!({"data": [{"a": 1}, {"a": 2}]}))
        );
    }

    #[test]
    fn nothing_recoverable() {
        assert_eq!(extract(""), None);
        assert_eq!(extract("I could not process this document."), None);
        assert_eq!(extract("{{{{"), None);
    }

    #[test]
    fn plain_json_string_is_returned() {
        assert_eq!(extract("\"hello\""), Some(json!("hello")));
    }

    #[test]
    fn from_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("raw.txt");
        std::fs::write(&p, "```json\n[1,2,3]\n```").unwrap();
        assert_eq!(extract_from_file(&p).unwrap(), Some(json!([1, 2, 3])));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 {}\\[\\]\",:]{0,12}".prop_map(Value::String),
        ];
        let tree = leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::vec(("[a-z]{1,6}", inner), 0..6)
                    .prop_map(|kv| Value::Object(kv.into_iter().collect())),
            ]
        });
        // Top-level strings come back unescaped; containers only.
        prop_oneof![
            prop::collection::vec(tree.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,6}", tree), 0..6)
                .prop_map(|kv| Value::Object(kv.into_iter().collect())),
        ]
    }

    proptest! {
        #[test]
        fn idempotent_on_valid_json(v in arb_json()) {
            let text = serde_json::to_string(&v).unwrap();
            prop_assert_eq!(extract(&text), Some(v.clone()));
            let pretty = serde_json::to_string_pretty(&v).unwrap();
            prop_assert_eq!(extract(&pretty), Some(v));
        }
    }
}
