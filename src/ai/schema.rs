/// JSON Schema 模块
///
/// 只实现结构化输出真正用到的子集：type / properties / required /
/// additionalProperties / enum / const / 数值范围 / 字符串长度 / items / 数组长度。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{AppError, AppResult};

/// 调用方提供的 Schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonSchema(Value);

/// 单条校验失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// 形如 `$.items[0].name` 的路径
    pub path: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl JsonSchema {
    /// Schema 顶层必须是对象
    pub fn new(value: Value) -> AppResult<Self> {
        if !value.is_object() {
            return Err(AppError::config(30, "Schema 顶层必须是 JSON 对象"));
        }
        Ok(Self(value))
    }

    /// 从 JSON 文本解析
    pub fn parse(text: &str) -> AppResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| AppError::config(31, format!("Schema 不是合法 JSON: {}", e)))?;
        Self::new(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// 顶层属性名
    pub fn property_names(&self) -> Vec<&str> {
        self.0
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// 收集所有校验失败
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();
        check(&self.0, instance, "$", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// 校验响应，失败时返回 SchemaInvalid
    pub fn validate_response(&self, instance: &Value) -> AppResult<()> {
        self.validate(instance).map_err(|violations| {
            let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
            AppError::schema_invalid(1, details.join("; "))
        })
    }

    /// 严格模式：每一层对象都禁止额外属性，并把全部属性列为必填
    pub fn strict(&self) -> Value {
        let mut value = self.0.clone();
        make_strict(&mut value);
        value
    }
}

fn make_strict(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for child in props.values_mut() {
            make_strict(child);
        }
        let names: Vec<Value> = props.keys().cloned().map(Value::String).collect();
        obj.insert("required".to_string(), Value::Array(names));
        obj.insert("additionalProperties".to_string(), Value::Bool(false));
    }

    if let Some(items) = obj.get_mut("items") {
        make_strict(items);
    }
}

fn type_matches(expected: &str, instance: &Value) -> bool {
    match expected {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "number" => instance.is_number(),
        "integer" => match instance {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
            }
            _ => false,
        },
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        _ => true,
    }
}

fn type_name(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check(schema: &Value, instance: &Value, path: &str, out: &mut Vec<Violation>) {
    let Some(schema) = schema.as_object() else {
        return;
    };
    let mut fail = |message: String| {
        out.push(Violation {
            path: path.to_string(),
            message,
        })
    };

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(instance) {
            fail(format!("值 {} 不在枚举 {} 中", instance, Value::Array(allowed.clone())));
            return;
        }
    }

    if let Some(expected) = schema.get("const") {
        if expected != instance {
            fail(format!("值 {} 不等于常量 {}", instance, expected));
            return;
        }
    }

    if let Some(ty) = schema.get("type") {
        let ok = match ty {
            Value::String(t) => type_matches(t, instance),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, instance)),
            _ => true,
        };
        if !ok {
            fail(format!("类型不匹配: 期望 {}，实际 {}", ty, type_name(instance)));
            return;
        }
    }

    match instance {
        Value::Number(n) => {
            if let Some(x) = n.as_f64() {
                check_range(schema, x, &mut fail);
            }
        }
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    fail(format!("字符串长度 {} 小于 {}", len, min));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    fail(format!("字符串长度 {} 大于 {}", len, max));
                }
            }
        }
        Value::Array(items) => {
            let len = items.len() as u64;
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if len < min {
                    fail(format!("数组长度 {} 小于 {}", len, min));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
                if len > max {
                    fail(format!("数组长度 {} 大于 {}", len, max));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{}[{}]", path, i), out);
                }
            }
        }
        Value::Object(map) => check_object(schema, map, path, out),
        _ => {}
    }
}

fn check_range(schema: &Map<String, Value>, x: f64, fail: &mut impl FnMut(String)) {
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if x < min {
            fail(format!("数值 {} 小于最小值 {}", x, min));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if x > max {
            fail(format!("数值 {} 大于最大值 {}", x, max));
        }
    }
    if let Some(min) = schema.get("exclusiveMinimum").and_then(Value::as_f64) {
        if x <= min {
            fail(format!("数值 {} 必须大于 {}", x, min));
        }
    }
    if let Some(max) = schema.get("exclusiveMaximum").and_then(Value::as_f64) {
        if x >= max {
            fail(format!("数值 {} 必须小于 {}", x, max));
        }
    }
}

fn check_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    out: &mut Vec<Violation>,
) {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                out.push(Violation {
                    path: path.to_string(),
                    message: format!("缺少必填属性 '{}'", name),
                });
            }
        }
    }

    let props = schema.get("properties").and_then(Value::as_object);
    for (key, value) in map {
        let child_path = format!("{}.{}", path, key);
        match props.and_then(|p| p.get(key)) {
            Some(child) => check(child, value, &child_path, out),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => out.push(Violation {
                    path: path.to_string(),
                    message: format!("不允许的额外属性 '{}'", key),
                }),
                Some(extra @ Value::Object(_)) => check(extra, value, &child_path, out),
                _ => {}
            },
        }
    }
}
