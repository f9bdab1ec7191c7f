//! 参数 Schema：由 schemars 从参数结构体生成，并在执行前做必填与类型校验
//!
//! 只检查顶层 required / properties.*.type，足以覆盖工具参数这种扁平对象。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use crate::tools::ToolError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("arguments must be a JSON object")]
    NotAnObject,
    #[error("missing required field(s): {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("field '{field}' should be of type {expected}")]
    WrongType { field: String, expected: String },
}

/// 由参数结构体生成 JSON Schema
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({ "type": "object" }))
}

/// 缺失的必填字段（null 视为缺失）
pub fn missing_fields(schema: &Value, args: &Value) -> Vec<String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Vec::new();
    };
    required
        .iter()
        .filter_map(Value::as_str)
        .filter(|field| args.get(*field).map_or(true, Value::is_null))
        .map(String::from)
        .collect()
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// 校验参数：对象形态、必填字段、已声明字段的类型
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ValidationError> {
    let empty = json!({});
    let args = if args.is_null() { &empty } else { args };
    let Some(obj) = args.as_object() else {
        return Err(ValidationError::NotAnObject);
    };

    let missing = missing_fields(schema, args);
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing));
    }

    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (field, value) in obj {
        if value.is_null() {
            continue;
        }
        let Some(declared) = props.get(field).and_then(|p| p.get("type")) else {
            continue;
        };
        // schemars 对 Option<T> 生成 ["string", "null"]
        let ok = match declared {
            Value::String(t) => type_matches(t, value),
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).any(|t| type_matches(t, value)),
            _ => true,
        };
        if !ok {
            return Err(ValidationError::WrongType {
                field: field.clone(),
                expected: declared.to_string(),
            });
        }
    }
    Ok(())
}

/// 把 JSON 参数解析为工具的参数结构体（null 视为空对象）
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct SqlArgs {
        /// 数据库名
        db: String,
        query: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_missing_required_fields() {
        let schema = schema_of::<SqlArgs>();
        let err = validate_args(&schema, &json!({ "db": "prod" })).unwrap_err();
        assert_eq!(err, ValidationError::MissingFields(vec!["query".into()]));
        assert_eq!(missing_fields(&schema, &Value::Null), vec!["db", "query"]);
    }

    #[test]
    fn test_type_mismatch() {
        let schema = schema_of::<SqlArgs>();
        let err = validate_args(&schema, &json!({ "db": "prod", "query": 42 })).unwrap_err();
        assert!(matches!(err, ValidationError::WrongType { ref field, .. } if field == "query"));
        assert!(validate_args(&schema, &json!({ "db": "prod", "query": "select 1", "limit": 5 })).is_ok());
        assert!(validate_args(&schema, &json!({ "db": "prod", "query": "x", "limit": null })).is_ok());
    }

    #[test]
    fn test_non_object_rejected() {
        assert_eq!(
            validate_args(&json!({}), &json!(["a"])),
            Err(ValidationError::NotAnObject)
        );
        assert!(validate_args(&json!({}), &Value::Null).is_ok());
    }
}
