//! XML tool-call parsing (spec §4.5).
//!
//! Scans assistant text for
//! `<function_calls><invoke name="…"><parameter name="…">…</parameter>…</invoke></function_calls>`
//! blocks. Strings/scalars are passed through literally; anything that looks
//! like a JSON object/array is decoded as such; booleans are recognised only
//! in their lowercase form, matching what a model emitting this format would
//! produce.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct XmlToolCall {
    pub name: String,
    pub arguments: Value,
}

static FUNCTION_CALLS_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<function_calls>(.*?)</function_calls>").unwrap());
static INVOKE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<invoke\s+name="([^"]+)">(.*?)</invoke>"#).unwrap());
static PARAMETER_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<parameter\s+name="([^"]+)">(.*?)</parameter>"#).unwrap());

pub fn parse(text: &str) -> Vec<XmlToolCall> {
    let mut calls = Vec::new();
    for block in FUNCTION_CALLS_BLOCK.captures_iter(text) {
        let body = &block[1];
        for invoke in INVOKE_BLOCK.captures_iter(body) {
            let name = invoke[1].to_string();
            let mut args = serde_json::Map::new();
            for param in PARAMETER_BLOCK.captures_iter(&invoke[2]) {
                let key = param[1].to_string();
                let raw = param[2].trim();
                args.insert(key, parse_scalar_or_json(raw));
            }
            calls.push(XmlToolCall {
                name,
                arguments: Value::Object(args),
            });
        }
    }
    calls
}

fn parse_scalar_or_json(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if (raw.starts_with('{') && raw.ends_with('}')) || (raw.starts_with('[') && raw.ends_with(']')) {
        if let Ok(v) = serde_json::from_str::<Value>(raw) {
            return v;
        }
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_invoke_with_string_param() {
        let text = r#"<function_calls><invoke name="web_search"><parameter name="query">foo</parameter></invoke></function_calls>"#;
        let calls = parse(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].arguments["query"], "foo");
    }

    #[test]
    fn parses_boolean_and_object_params() {
        let text = r#"<function_calls><invoke name="edit"><parameter name="create_backup">true</parameter><parameter name="operation">{"op":"replace"}</parameter></invoke></function_calls>"#;
        let calls = parse(text);
        assert_eq!(calls[0].arguments["create_backup"], Value::Bool(true));
        assert_eq!(calls[0].arguments["operation"]["op"], "replace");
    }

    #[test]
    fn parses_multiple_invokes_in_order() {
        let text = r#"<function_calls>
<invoke name="a"><parameter name="x">1</parameter></invoke>
<invoke name="b"><parameter name="x">2</parameter></invoke>
</function_calls>"#;
        let calls = parse(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
    }

    #[test]
    fn no_function_calls_block_returns_empty() {
        assert!(parse("just plain text").is_empty());
    }
}
