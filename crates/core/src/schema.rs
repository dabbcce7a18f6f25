//! Tagged-union parameter schemas and their interpreter (§9 DESIGN NOTES:
//! "represent them as tagged union values ... plus a small interpreter that
//! produces typed values or structured validation errors. Do not rely on
//! reflection.").
//!
//! These are the schemas gadgets (`runtime-agent`'s tools) declare for their
//! parameters — distinct from [`crate::chat::ParametersSchema`], which
//! shapes a provider's native function-calling surface.

use serde_json::Value;
use std::collections::BTreeMap;

/// A gadget parameter's declared shape.
#[derive(Debug, Clone)]
pub enum ParamSchema {
    String {
        description: String,
    },
    Enum {
        description: String,
        values: Vec<String>,
    },
    Number {
        description: String,
        min: Option<f64>,
        max: Option<f64>,
        integer: bool,
    },
    Boolean {
        description: String,
    },
    Array {
        description: String,
        items: Box<ParamSchema>,
    },
    Object {
        description: String,
        fields: BTreeMap<String, ParamSchema>,
        required: Vec<String>,
    },
    Optional(Box<ParamSchema>),
}

/// A validation failure produced by [`validate`], named by the dotted path
/// to the offending field (`"args.count"`, `"items[2]"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validates `value` against `schema`, returning the (possibly coerced)
/// value on success or every structured error found. Errors accumulate
/// rather than short-circuit, so a caller can report every offending field
/// at once — mirroring how the dispatcher (C7) surfaces a single
/// synthesized validation message to the model instead of calling
/// `Execute`.
pub fn validate(schema: &ParamSchema, value: &Value, path: &str) -> Result<Value, Vec<ValidationError>> {
    match schema {
        ParamSchema::Optional(inner) => {
            if value.is_null() {
                Ok(Value::Null)
            } else {
                validate(inner, value, path)
            }
        }
        ParamSchema::String { .. } => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(vec![err(path, "expected a string")]),
        },
        ParamSchema::Enum { values, .. } => match value.as_str() {
            Some(s) if values.iter().any(|v| v == s) => Ok(value.clone()),
            Some(s) => Err(vec![err(
                path,
                format!("\"{s}\" is not one of {values:?}"),
            )]),
            None => Err(vec![err(path, "expected a string")]),
        },
        ParamSchema::Number {
            min, max, integer, ..
        } => {
            let Some(n) = value.as_f64() else {
                return Err(vec![err(path, "expected a number")]);
            };
            let mut errors = Vec::new();
            if *integer && n.fract() != 0.0 {
                errors.push(err(path, "expected an integer"));
            }
            if let Some(min) = min {
                if n < *min {
                    errors.push(err(path, format!("must be >= {min}")));
                }
            }
            if let Some(max) = max {
                if n > *max {
                    errors.push(err(path, format!("must be <= {max}")));
                }
            }
            if errors.is_empty() {
                Ok(value.clone())
            } else {
                Err(errors)
            }
        }
        ParamSchema::Boolean { .. } => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => Err(vec![err(path, "expected a boolean")]),
        },
        ParamSchema::Array { items, .. } => {
            let Some(arr) = value.as_array() else {
                return Err(vec![err(path, "expected an array")]);
            };
            let mut errors = Vec::new();
            let mut out = Vec::with_capacity(arr.len());
            for (i, item) in arr.iter().enumerate() {
                match validate(items, item, &format!("{path}[{i}]")) {
                    Ok(v) => out.push(v),
                    Err(mut e) => errors.append(&mut e),
                }
            }
            if errors.is_empty() {
                Ok(Value::Array(out))
            } else {
                Err(errors)
            }
        }
        ParamSchema::Object {
            fields, required, ..
        } => {
            let Some(obj) = value.as_object() else {
                return Err(vec![err(path, "expected an object")]);
            };
            let mut errors = Vec::new();
            let mut out = serde_json::Map::new();
            for name in required {
                if !obj.contains_key(name) {
                    errors.push(err(
                        &format!("{path}.{name}"),
                        "missing required field",
                    ));
                }
            }
            for (name, field_schema) in fields {
                let Some(field_value) = obj.get(name) else {
                    continue;
                };
                let field_path = format!("{path}.{name}");
                match validate(field_schema, field_value, &field_path) {
                    Ok(v) => {
                        out.insert(name.clone(), v);
                    }
                    Err(mut e) => errors.append(&mut e),
                }
            }
            if errors.is_empty() {
                Ok(Value::Object(out))
            } else {
                Err(errors)
            }
        }
    }
}

fn err(path: &str, message: impl Into<String>) -> ValidationError {
    ValidationError {
        path: path.to_string(),
        message: message.into(),
    }
}

/// Renders the accumulated validation errors into the single string the
/// dispatcher records as a tool's synthetic result instead of invoking it.
pub fn render_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validates_number_bounds() {
        let schema = ParamSchema::Number {
            description: "count".into(),
            min: Some(1.0),
            max: Some(10.0),
            integer: true,
        };
        assert!(validate(&schema, &json!(5), "n").is_ok());
        let err = validate(&schema, &json!(11), "n").unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].message.contains("<= 10"));
    }

    #[test]
    fn validates_nested_object_accumulating_errors() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "op".to_string(),
            ParamSchema::Enum {
                description: "operator".into(),
                values: vec!["add".into(), "multiply".into()],
            },
        );
        fields.insert(
            "a".to_string(),
            ParamSchema::Number {
                description: "left".into(),
                min: None,
                max: None,
                integer: false,
            },
        );
        let schema = ParamSchema::Object {
            description: "calculator args".into(),
            fields,
            required: vec!["op".into(), "a".into()],
        };

        let errors = validate(&schema, &json!({"op": "divide"}), "args").unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.path == "args.a"));
        assert!(errors.iter().any(|e| e.path == "args.op"));
    }

    #[test]
    fn optional_schema_accepts_null() {
        let schema = ParamSchema::Optional(Box::new(ParamSchema::String {
            description: "note".into(),
        }));
        assert_eq!(validate(&schema, &Value::Null, "note").unwrap(), Value::Null);
        assert!(validate(&schema, &json!("hi"), "note").is_ok());
    }

    #[test]
    fn array_validates_each_item() {
        let schema = ParamSchema::Array {
            description: "tags".into(),
            items: Box::new(ParamSchema::String {
                description: "tag".into(),
            }),
        };
        let errors = validate(&schema, &json!(["a", 2, "c"]), "tags").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "tags[1]");
    }
}
