//! 工具参数 JSON Schema 生成（schemars 自动生成）
//!
//! 参数结构体一律扁平：只有标量、可选标量与字符串数组。嵌套对象会超出部分远端服务的 schema 限制。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 由参数结构体生成 schema，去掉 $schema / title 等模型不需要的键
pub fn schema_value<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {} })
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.remove("definitions");
    }
    value
}

/// 是否为扁平 schema：顶层 object，属性中没有对象、引用或对象数组
pub fn is_flat(schema: &Value) -> bool {
    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return schema.get("type").and_then(Value::as_str) == Some("object");
    };
    if schema.get("definitions").is_some() || schema.get("$defs").is_some() {
        return false;
    }
    props.values().all(|p| !is_nested(p) && p.get("items").map_or(true, |i| !is_nested(i)))
}

fn is_nested(prop: &Value) -> bool {
    if prop.get("$ref").is_some() || prop.get("properties").is_some() {
        return true;
    }
    if ["allOf", "anyOf", "oneOf"].iter().any(|k| prop.get(*k).is_some()) {
        return true;
    }
    match prop.get("type") {
        Some(Value::String(t)) => t == "object",
        Some(Value::Array(types)) => types.iter().any(|t| t == "object"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct FlatArgs {
        /// 提示词
        prompt: String,
        tags: Option<Vec<String>>,
        strict: Option<bool>,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Inner {
        x: u32,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct NestedArgs {
        inner: Inner,
    }

    #[test]
    fn test_generated_flat_schema() {
        let schema = schema_value::<FlatArgs>();
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["required"], json!(["prompt"]));
        assert!(is_flat(&schema));
    }

    #[test]
    fn test_nested_schema_detected() {
        assert!(!is_flat(&schema_value::<NestedArgs>()));
        assert!(!is_flat(&json!({
            "type": "object",
            "properties": { "a": { "type": "array", "items": { "type": "object" } } }
        })));
    }
}
