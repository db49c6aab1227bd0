//! ABOUTME: Variable bag merging and ${name} substitution in step args
//! ABOUTME: Merge is last-writer-wins; unknown placeholders are left intact

use serde_json::Value;
use std::collections::HashMap;

/// Merge `incoming` into `base`, last writer wins on overlapping keys
pub fn merge(base: &mut HashMap<String, Value>, incoming: &HashMap<String, Value>) {
    for (k, v) in incoming {
        base.insert(k.clone(), v.clone());
    }
}

/// Parse a task output blob as a variable bag. Anything that is not a JSON
/// object contributes nothing.
pub fn output_bag(output: Option<&str>) -> HashMap<String, Value> {
    let Some(output) = output else {
        return HashMap::new();
    };
    match serde_json::from_str::<Value>(output) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}

/// Substitute every `${name}` token against the variable bag. Values render
/// without JSON quoting; unknown names stay as-is so the failure is visible
/// in the worker command line.
pub fn substitute(template: &str, vars: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(&render(value)),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder: keep the literal text
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut base = bag(&[("a", json!(1)), ("b", json!("x"))]);
        merge(&mut base, &bag(&[("b", json!("y")), ("c", json!(true))]));

        assert_eq!(base.get("a"), Some(&json!(1)));
        assert_eq!(base.get("b"), Some(&json!("y")));
        assert_eq!(base.get("c"), Some(&json!(true)));
    }

    #[test]
    fn test_merge_disjoint_is_commutative() {
        let left = bag(&[("a", json!(1))]);
        let right = bag(&[("b", json!(2))]);

        let mut ab = left.clone();
        merge(&mut ab, &right);
        let mut ba = right.clone();
        merge(&mut ba, &left);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_output_bag_parsing() {
        let vars = output_bag(Some(r#"{"rows": 10, "path": "/tmp/out"}"#));
        assert_eq!(vars.get("rows"), Some(&json!(10)));
        assert_eq!(vars.get("path"), Some(&json!("/tmp/out")));

        assert!(output_bag(Some("plain text output")).is_empty());
        assert!(output_bag(Some("[1, 2, 3]")).is_empty());
        assert!(output_bag(None).is_empty());
        assert!(output_bag(Some("")).is_empty());
    }

    #[test]
    fn test_substitute() {
        let vars = bag(&[
            ("dataset", json!("main")),
            ("count", json!(5)),
            ("flag", json!(true)),
        ]);

        assert_eq!(
            substitute("--input ${dataset} --n ${count}", &vars),
            "--input main --n 5"
        );
        assert_eq!(substitute("${flag}", &vars), "true");
        // Unknown names survive literally
        assert_eq!(substitute("--x ${unknown}", &vars), "--x ${unknown}");
        // Unterminated placeholder survives literally
        assert_eq!(substitute("--x ${oops", &vars), "--x ${oops");
        // No placeholders at all
        assert_eq!(substitute("plain", &vars), "plain");
    }

    #[test]
    fn test_substitute_repeated_and_adjacent() {
        let vars = bag(&[("a", json!("x"))]);
        assert_eq!(substitute("${a}${a} ${a}", &vars), "xx x");
    }
}
