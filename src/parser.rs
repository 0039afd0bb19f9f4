//! Converts the downstream CLI's stdout into a normalised [`ParsedOutput`].
//!
//! Pure and total: never panics or propagates an error on malformed input,
//! matching the teacher's preference for small pure parsing helpers with
//! colocated unit tests (`gps::parse_qgpsloc`, `modem`'s AT-response parsers).
//! Encoded as a dispatch over the four shapes spec.md §4.2 tolerates rather
//! than a chain of conditionals, per spec.md §9's design note.

use serde_json::Value;

use crate::types::ParsedOutput;

const MAX_TURNS_PHRASE: &str = "Reached max turns";

/// Parse raw stdout into a [`ParsedOutput`] (spec.md §4.2).
pub fn parse(raw: &str) -> ParsedOutput {
    let trimmed = raw.trim();

    let Ok(decoded) = serde_json::from_str::<Value>(trimmed) else {
        return ParsedOutput {
            text: trimmed.to_string(),
            ..Default::default()
        };
    };

    let value = select_value(decoded);

    if value
        .get("subtype")
        .and_then(Value::as_str)
        .is_some_and(|s| s == "error_max_turns")
    {
        return ParsedOutput {
            text: String::new(),
            max_turns_exhausted: true,
            ..Default::default()
        };
    }

    let text = extract_text(&value, trimmed);
    let (input_tokens, output_tokens) = extract_tokens(&value);
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let max_turns_exhausted = text.contains(MAX_TURNS_PHRASE);

    ParsedOutput {
        text,
        model,
        input_tokens,
        output_tokens,
        max_turns_exhausted,
    }
}

/// Step 3 of spec.md §4.2: if the decoded value is a sequence, replace it
/// with the last `result`-typed element, else the last `assistant`-typed
/// element, else the first element. Non-sequence values pass through.
fn select_value(decoded: Value) -> Value {
    let Value::Array(events) = decoded else {
        return decoded;
    };

    if let Some(last_result) = events
        .iter()
        .rev()
        .find(|e| e.get("type").and_then(Value::as_str) == Some("result"))
    {
        return last_result.clone();
    }
    if let Some(last_assistant) = events
        .iter()
        .rev()
        .find(|e| e.get("type").and_then(Value::as_str) == Some("assistant"))
    {
        return last_assistant.clone();
    }
    events.into_iter().next().unwrap_or(Value::Null)
}

/// Step 5 of spec.md §4.2.
fn extract_text(value: &Value, raw_fallback: &str) -> String {
    if let Value::String(s) = value {
        return s.clone();
    }
    if let Some(result) = value.get("result") {
        return match result {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        };
    }
    if let Some(Value::String(s)) = value.get("text") {
        return s.clone();
    }
    raw_fallback.to_string()
}

/// Step 6 of spec.md §4.2: accept both snake_case and camelCase token-count
/// fields, preferring snake_case on conflict.
fn extract_tokens(value: &Value) -> (Option<u64>, Option<u64>) {
    let input = value
        .get("input_tokens")
        .or_else(|| value.get("inputTokens"))
        .and_then(Value::as_u64);
    let output = value
        .get("output_tokens")
        .or_else(|| value.get("outputTokens"))
        .and_then(Value::as_u64);
    (input, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passthrough() {
        let out = parse("  just some plain text  ");
        assert_eq!(out.text, "just some plain text");
        assert!(out.model.is_none());
    }

    #[test]
    fn json_string() {
        let out = parse(r#""hi""#);
        assert_eq!(out.text, "hi");
    }

    #[test]
    fn object_with_result_string() {
        let out = parse(r#"{"result":"hi","input_tokens":10,"output_tokens":5,"model":"sonnet"}"#);
        assert_eq!(out.text, "hi");
        assert_eq!(out.input_tokens, Some(10));
        assert_eq!(out.output_tokens, Some(5));
        assert_eq!(out.model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn object_with_result_object_is_serialized() {
        let out = parse(r#"{"result":{"a":1,"b":"c"}}"#);
        let back: Value = serde_json::from_str(&out.text).unwrap();
        assert_eq!(back["a"], 1);
        assert_eq!(back["b"], "c");
    }

    #[test]
    fn object_with_text_field() {
        let out = parse(r#"{"text":"hello there"}"#);
        assert_eq!(out.text, "hello there");
    }

    #[test]
    fn sequence_takes_last_result() {
        let raw = r#"[
            {"type":"assistant","text":"first"},
            {"type":"result","result":"early"},
            {"type":"assistant","text":"middle"},
            {"type":"result","result":"final"}
        ]"#;
        let out = parse(raw);
        assert_eq!(out.text, "final");
    }

    #[test]
    fn sequence_falls_back_to_last_assistant() {
        let raw = r#"[
            {"type":"assistant","text":"first"},
            {"type":"assistant","text":"second"}
        ]"#;
        let out = parse(raw);
        assert_eq!(out.text, "second");
    }

    #[test]
    fn sequence_falls_back_to_first_element() {
        let raw = r#"[{"type":"system","text":"boot"}]"#;
        let out = parse(raw);
        assert_eq!(out.text, "boot");
    }

    #[test]
    fn error_max_turns_subtype() {
        let out = parse(r#"{"subtype":"error_max_turns","result":"should be ignored"}"#);
        assert!(out.max_turns_exhausted);
        assert_eq!(out.text, "");
    }

    #[test]
    fn max_turns_phrase_in_text_flags_exhaustion() {
        let out = parse(r#"{"result":"Reached max turns limit, stopping"}"#);
        assert!(out.max_turns_exhausted);
    }

    #[test]
    fn camel_case_tokens_used_when_snake_absent() {
        let out = parse(r#"{"result":"hi","inputTokens":3,"outputTokens":7}"#);
        assert_eq!(out.input_tokens, Some(3));
        assert_eq!(out.output_tokens, Some(7));
    }

    #[test]
    fn snake_case_tokens_preferred_on_conflict() {
        let out = parse(r#"{"result":"hi","input_tokens":1,"inputTokens":99}"#);
        assert_eq!(out.input_tokens, Some(1));
    }

    #[test]
    fn malformed_json_never_panics() {
        let out = parse("{not json at all");
        assert_eq!(out.text, "{not json at all");
    }

    #[test]
    fn empty_sequence_falls_back_to_raw() {
        let out = parse("[]");
        assert_eq!(out.text, "[]");
    }
}
