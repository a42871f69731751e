//! Per-endpoint request schema validation.
//!
//! The schema maps body paths to field descriptors; the walker checks the
//! parsed request shape (JSON body, SOAP body dict, GraphQL variables, or
//! reflected gRPC message) and reports the first offending field path.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;

use doorman_core::{FieldFormat, FieldRule, FieldType};

use crate::error::GatewayError;
use crate::jsonpath;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid regex")
});
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").expect("valid regex"));

fn violation(path: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::SchemaViolation {
        path: path.to_owned(),
        message: message.into(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_format(value: &str, format: FieldFormat, path: &str) -> Result<(), GatewayError> {
    let ok = match format {
        FieldFormat::Email => EMAIL_RE.is_match(value),
        FieldFormat::Url => URL_RE.is_match(value),
        FieldFormat::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
        FieldFormat::Datetime => chrono::DateTime::parse_from_rfc3339(value).is_ok(),
        FieldFormat::Uuid => uuid::Uuid::parse_str(value).is_ok(),
    };
    if ok {
        Ok(())
    } else {
        Err(violation(path, format!("invalid {format:?} format").to_lowercase()))
    }
}

#[allow(clippy::cast_precision_loss)]
fn check_value(value: &Value, rule: &FieldRule, path: &str) -> Result<(), GatewayError> {
    match rule.field_type {
        FieldType::String => {
            let Value::String(s) = value else {
                return Err(violation(path, format!("expected string, got {}", type_name(value))));
            };
            let len = s.chars().count() as f64;
            if rule.min.is_some_and(|min| len < min) {
                return Err(violation(path, "string shorter than minimum length"));
            }
            if rule.max.is_some_and(|max| len > max) {
                return Err(violation(path, "string longer than maximum length"));
            }
            if let Some(pattern) = &rule.pattern {
                let re = Regex::new(pattern)
                    .map_err(|e| violation(path, format!("invalid pattern in schema: {e}")))?;
                if !re.is_match(s) {
                    return Err(violation(path, format!("string does not match pattern {pattern}")));
                }
            }
            if let Some(format) = rule.format {
                check_format(s, format, path)?;
            }
        }
        FieldType::Number => {
            let Some(n) = value.as_f64() else {
                return Err(violation(path, format!("expected number, got {}", type_name(value))));
            };
            if rule.min.is_some_and(|min| n < min) {
                return Err(violation(path, "number below minimum"));
            }
            if rule.max.is_some_and(|max| n > max) {
                return Err(violation(path, "number above maximum"));
            }
        }
        FieldType::Boolean => {
            if !value.is_boolean() {
                return Err(violation(path, format!("expected boolean, got {}", type_name(value))));
            }
        }
        FieldType::Array => {
            let Value::Array(items) = value else {
                return Err(violation(path, format!("expected array, got {}", type_name(value))));
            };
            let len = items.len() as f64;
            if rule.min.is_some_and(|min| len < min) {
                return Err(violation(path, "array shorter than minimum length"));
            }
            if rule.max.is_some_and(|max| len > max) {
                return Err(violation(path, "array longer than maximum length"));
            }
            if let Some(item_rule) = &rule.array_items {
                for (i, item) in items.iter().enumerate() {
                    check_value(item, item_rule, &format!("{path}[{i}]"))?;
                }
            }
        }
        FieldType::Object => {
            let Value::Object(map) = value else {
                return Err(violation(path, format!("expected object, got {}", type_name(value))));
            };
            if let Some(nested) = &rule.nested_schema {
                for (field, field_rule) in nested {
                    let nested_path = format!("{path}.{field}");
                    match map.get(field) {
                        Some(nested_value) => {
                            check_value(nested_value, field_rule, &nested_path)?;
                        }
                        None if field_rule.required => {
                            return Err(violation(&nested_path, "field is required"));
                        }
                        None => {}
                    }
                }
            }
        }
    }

    if let Some(allowed) = &rule.allowed
        && !allowed.contains(value)
    {
        return Err(violation(path, "value is not one of the allowed set"));
    }

    Ok(())
}

/// Validate a parsed request body against an endpoint schema.
pub fn validate(
    schema: &std::collections::BTreeMap<String, FieldRule>,
    body: &Value,
) -> Result<(), GatewayError> {
    for (path, rule) in schema {
        match jsonpath::get_path(body, path) {
            Some(value) if value.is_null() => {
                if rule.required {
                    return Err(violation(path, "field is required"));
                }
            }
            Some(value) => check_value(value, rule, path)?,
            None => {
                if rule.required {
                    return Err(violation(path, "field is required"));
                }
            }
        }
    }
    Ok(())
}

/// Validate GraphQL variables with the operation name as the root path:
/// a schema path `$.getUser.id` matches `variables.id` for operation
/// `getUser`.
pub fn validate_graphql(
    schema: &std::collections::BTreeMap<String, FieldRule>,
    operation_name: &str,
    variables: &Value,
) -> Result<(), GatewayError> {
    let mut rooted = Value::Object(serde_json::Map::new());
    jsonpath::set_path(
        &mut rooted,
        &format!("$.{operation_name}"),
        variables.clone(),
    );
    validate(schema, &rooted)
}
