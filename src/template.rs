//! Argument and environment templating.
//!
//! Templates carry placeholders of the form `%{name}s` (string rendering)
//! and `%{name}d` (decimal integer rendering). Every occurrence of a
//! placeholder whose name exists in the attribute map is replaced;
//! everything else is left verbatim.

use crate::config::AttrMap;
use serde_yaml::Value;

/// Expand a single template against a tenant attribute map.
pub fn expand(template: &str, attrs: &AttrMap) -> String {
    let mut out = template.to_string();
    for (key, value) in attrs {
        let string_form = format!("%{{{key}}}s");
        if out.contains(&string_form) {
            out = out.replace(&string_form, &render_string(value));
        }
        if let Some(n) = render_int(value) {
            let int_form = format!("%{{{key}}}d");
            out = out.replace(&int_form, &n.to_string());
        }
    }
    out
}

/// Expand each template in a list independently.
pub fn expand_all(templates: &[String], attrs: &AttrMap) -> Vec<String> {
    templates.iter().map(|t| expand(t, attrs)).collect()
}

fn render_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

// Integer rendering applies only to values that actually are integers;
// a `%{k}d` placeholder over anything else stays verbatim.
fn render_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(entries: &[(&str, Value)]) -> AttrMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_no_placeholders_is_identity() {
        let map = attrs(&[("key", Value::String("alice".into()))]);
        assert_eq!(expand("plain text with %s and %d", &map), "plain text with %s and %d");
        assert_eq!(expand("", &map), "");
    }

    #[test]
    fn test_string_substitution() {
        let map = attrs(&[("key", Value::String("alice".into()))]);
        assert_eq!(expand("/srv/%{key}s/data", &map), "/srv/alice/data");
    }

    #[test]
    fn test_integer_substitution() {
        let map = attrs(&[("id", Value::Number(15000.into()))]);
        assert_eq!(expand("--address=:%{id}d", &map), "--address=:15000");
    }

    #[test]
    fn test_number_renders_as_string_too() {
        let map = attrs(&[("id", Value::Number(15000.into()))]);
        assert_eq!(expand("port %{id}s", &map), "port 15000");
    }

    #[test]
    fn test_integer_form_of_numeric_string() {
        let map = attrs(&[("volume", Value::String("3".into()))]);
        assert_eq!(expand("vol%{volume}d", &map), "vol3");
    }

    #[test]
    fn test_all_occurrences_are_replaced() {
        let map = attrs(&[("key", Value::String("bob".into()))]);
        assert_eq!(
            expand("%{key}s-%{key}s-%{key}s", &map),
            "bob-bob-bob"
        );
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let map = attrs(&[("key", Value::String("alice".into()))]);
        assert_eq!(expand("%{missing}s/%{key}s", &map), "%{missing}s/alice");
    }

    #[test]
    fn test_integer_form_of_non_integer_left_verbatim() {
        let map = attrs(&[("key", Value::String("alice".into()))]);
        assert_eq!(expand("%{key}d", &map), "%{key}d");
    }

    #[test]
    fn test_bool_and_null_render() {
        let map = attrs(&[("on", Value::Bool(true)), ("gone", Value::Null)]);
        assert_eq!(expand("%{on}s|%{gone}s|", &map), "true||");
    }

    #[test]
    fn test_expand_all_is_per_template() {
        let map = attrs(&[
            ("id", Value::Number(15001.into())),
            ("key", Value::String("bob".into())),
        ]);
        let templates = vec![
            "server".to_string(),
            "--address".to_string(),
            ":%{id}d".to_string(),
            "/srv/%{key}s".to_string(),
        ];
        assert_eq!(
            expand_all(&templates, &map),
            vec!["server", "--address", ":15001", "/srv/bob"]
        );
    }
}
