use serde_json::Value;

use super::{ToolDefinition, stringify_scalar};
use crate::error::GatewayError;

/// Characters an argument value may never contain: glob metacharacters,
/// the parenthesis/comma pair reserved for signatures, and anything that
/// would let a crafted value widen a policy pattern match.
const FORBIDDEN: &[char] = &['*', '?', '[', ']', '(', ')', ','];

/// Validate request arguments before any policy evaluation.
///
/// Rejections here mean the signature is never built and the policy is
/// never consulted, so a request cannot smuggle metacharacters into a
/// wildcard match. Tool-defined per-arg validators and required-arg
/// checks apply when the tool is known.
pub fn validate_args(
    def: Option<&ToolDefinition>,
    args: &serde_json::Map<String, Value>,
) -> Result<(), GatewayError> {
    for (name, value) in args {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(_) | Value::Bool(_) | Value::Null => value.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(GatewayError::InvalidRequest(format!(
                    "argument '{}' must be a scalar",
                    name
                )));
            }
        };

        if let Some(bad) = text
            .chars()
            .find(|c| FORBIDDEN.contains(c) || (*c as u32) < 0x20)
        {
            return Err(GatewayError::InvalidRequest(format!(
                "argument '{}' contains forbidden character {:?}",
                name, bad
            )));
        }
    }

    let Some(def) = def else {
        return Ok(());
    };

    for (name, spec) in &def.args {
        match args.get(name) {
            None => {
                if spec.required {
                    return Err(GatewayError::InvalidRequest(format!(
                        "missing required argument '{}'",
                        name
                    )));
                }
            }
            Some(value) => {
                if let Some(validator) = &spec.validator {
                    let text = stringify_scalar(value);
                    if !validator.is_match(&text) {
                        return Err(GatewayError::InvalidRequest(format!(
                            "argument '{}' does not match expected format",
                            name
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn tool_with_validator() -> Arc<ToolDefinition> {
        let mut registry = ToolRegistry::new();
        registry
            .load_service_yaml(
                "svc",
                r#"
tools:
  - name: get_state
    args:
      entity_id:
        required: true
        validate: "^[a-z_]+\\.[a-z0-9_]+$"
      note:
        required: false
    request:
      path: "/states/{entity_id}"
"#,
            )
            .expect("load");
        registry.lookup("get_state").expect("tool")
    }

    fn args(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn rejects_glob_metacharacters() {
        for bad in ["sensor.*", "a?b", "x[0]", "x]"] {
            let result = validate_args(None, &args(&[("entity_id", json!(bad))]));
            assert!(result.is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn rejects_signature_reserved_characters() {
        for bad in ["call(", "close)", "a,b"] {
            let result = validate_args(None, &args(&[("v", json!(bad))]));
            assert!(result.is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn rejects_control_characters() {
        let result = validate_args(None, &args(&[("v", json!("line\nbreak"))]));
        assert!(result.is_err());
        let result = validate_args(None, &args(&[("v", json!("nul\u{0}"))]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_scalar_values() {
        let result = validate_args(None, &args(&[("v", json!(["a", "b"]))]));
        assert!(result.is_err());
        let result = validate_args(None, &args(&[("v", json!({"k": "v"}))]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_missing_required_arg() {
        let def = tool_with_validator();
        let result = validate_args(Some(&def), &args(&[("note", json!("hi"))]));
        assert!(result.is_err());
    }

    #[test]
    fn applies_tool_validator() {
        let def = tool_with_validator();
        let ok = validate_args(Some(&def), &args(&[("entity_id", json!("sensor.temp"))]));
        assert!(ok.is_ok());

        let bad = validate_args(Some(&def), &args(&[("entity_id", json!("Not-An-Entity"))]));
        assert!(bad.is_err());
    }

    #[test]
    fn accepts_plain_scalars() {
        let result = validate_args(
            None,
            &args(&[
                ("s", json!("sensor.temp")),
                ("n", json!(42)),
                ("b", json!(false)),
            ]),
        );
        assert!(result.is_ok());
    }
}
