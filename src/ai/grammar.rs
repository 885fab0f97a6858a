/// Schema → GBNF 语法转换
///
/// 供 Grammar 机制的提供商（LocalAI / llama.cpp）使用。
/// 语法只约束结构；数值范围、字符串长度和数组长度交给响应校验处理。
/// 语法系统无法表达的结构（引用、组合、正则等）直接报 UnsupportedSchemaConstruct。

use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::ai::schema::JsonSchema;
use crate::error::{AppError, AppResult};

const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$ref",
    "anyOf",
    "oneOf",
    "allOf",
    "not",
    "if",
    "then",
    "else",
    "pattern",
    "patternProperties",
    "dependentSchemas",
    "dependencies",
];

const PRIMITIVES: &[(&str, &str)] = &[
    ("boolean", r#"("true" | "false")"#),
    ("null", r#""null""#),
    ("integer", r#""-"? ([0-9] | [1-9] [0-9]*)"#),
    (
        "number",
        r#""-"? ([0-9] | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [-+]? [0-9]+)?"#,
    ),
    (
        "string",
        r#""\"" ( [^"\\\x7F\x00-\x1F] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]) )* "\"""#,
    ),
];

struct GrammarBuilder {
    rules: Vec<(String, String)>,
    primitives: BTreeSet<&'static str>,
    /// 已分配的规则名，清洗后重名的属性加数字后缀
    names: BTreeSet<String>,
}

/// 把 Schema 转换为 GBNF 文本，根规则名为 `root`
pub fn schema_to_gbnf(schema: &JsonSchema) -> AppResult<String> {
    let mut builder = GrammarBuilder {
        rules: Vec::new(),
        primitives: BTreeSet::new(),
        names: BTreeSet::from(["root".to_string()]),
    };
    let body = builder.visit(schema.as_value(), "root", "$")?;
    builder.rules.insert(0, ("root".to_string(), body));

    let mut out = String::new();
    for (name, body) in &builder.rules {
        out.push_str(&format!("{} ::= {}\n", name, body));
    }
    for (name, body) in PRIMITIVES {
        if builder.primitives.contains(name) {
            out.push_str(&format!("{} ::= {}\n", name, body));
        }
    }
    out.push_str("ws ::= [ \\t\\n]*\n");
    Ok(out)
}

/// GBNF 字面量：把任意文本包成 "..."
fn literal(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("\"{}\"", escaped)
}

/// 规则名只能包含字母、数字和连字符
fn rule_name(parent: &str, key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{}-{}", parent, cleaned)
}

impl GrammarBuilder {
    fn unique_name(&mut self, base: String) -> String {
        let mut candidate = base.clone();
        let mut suffix = 2;
        while !self.names.insert(candidate.clone()) {
            candidate = format!("{}-{}", base, suffix);
            suffix += 1;
        }
        candidate
    }

    fn visit(&mut self, schema: &Value, name: &str, path: &str) -> AppResult<String> {
        let obj = schema.as_object().ok_or_else(|| {
            AppError::unsupported_schema(1, format!("{}: 子 Schema 必须是对象", path))
        })?;

        for keyword in UNSUPPORTED_KEYWORDS {
            if obj.contains_key(*keyword) {
                return Err(AppError::unsupported_schema(
                    2,
                    format!("{}: 语法约束无法表达关键字 '{}'", path, keyword),
                ));
            }
        }

        if let Some(values) = obj.get("enum").and_then(Value::as_array) {
            return self.alternatives(values, path);
        }
        if let Some(value) = obj.get("const") {
            return self.alternatives(std::slice::from_ref(value), path);
        }

        let ty = match obj.get("type") {
            Some(Value::String(t)) => t.as_str(),
            Some(_) => {
                return Err(AppError::unsupported_schema(
                    3,
                    format!("{}: 不支持多类型联合", path),
                ))
            }
            None if obj.contains_key("properties") => "object",
            None => {
                return Err(AppError::unsupported_schema(
                    4,
                    format!("{}: 缺少 type", path),
                ))
            }
        };

        match ty {
            "object" => self.object(obj, name, path),
            "array" => self.array(obj, name, path),
            "string" | "number" | "integer" | "boolean" | "null" => {
                let primitive = PRIMITIVES
                    .iter()
                    .map(|(n, _)| *n)
                    .find(|n| *n == ty)
                    .unwrap_or("string");
                self.primitives.insert(primitive);
                Ok(primitive.to_string())
            }
            other => Err(AppError::unsupported_schema(
                5,
                format!("{}: 未知类型 '{}'", path, other),
            )),
        }
    }

    fn alternatives(&mut self, values: &[Value], path: &str) -> AppResult<String> {
        if values.is_empty() {
            return Err(AppError::unsupported_schema(
                6,
                format!("{}: 空枚举无法生成语法", path),
            ));
        }
        let options: Vec<String> = values
            .iter()
            .map(|v| literal(&v.to_string()))
            .collect();
        Ok(format!("({})", options.join(" | ")))
    }

    fn object(&mut self, obj: &Map<String, Value>, name: &str, path: &str) -> AppResult<String> {
        if matches!(obj.get("additionalProperties"), Some(Value::Object(_))) {
            return Err(AppError::unsupported_schema(
                7,
                format!("{}: 不支持以 Schema 描述的额外属性", path),
            ));
        }
        let props = obj
            .get("properties")
            .and_then(Value::as_object)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                AppError::unsupported_schema(8, format!("{}: 无属性定义的自由对象无法生成语法", path))
            })?;

        let mut members = Vec::with_capacity(props.len());
        for (key, child) in props {
            let child_name = self.unique_name(rule_name(name, key));
            let body = self.visit(child, &child_name, &format!("{}.{}", path, key))?;
            self.rules.push((child_name.clone(), body));
            members.push(format!(
                "{} ws \":\" ws {}",
                literal(&Value::String(key.clone()).to_string()),
                child_name
            ));
        }

        Ok(format!(
            "\"{{\" ws {} ws \"}}\"",
            members.join(" ws \",\" ws ")
        ))
    }

    fn array(&mut self, obj: &Map<String, Value>, name: &str, path: &str) -> AppResult<String> {
        let items = obj.get("items").ok_or_else(|| {
            AppError::unsupported_schema(9, format!("{}: 数组缺少 items", path))
        })?;
        let item_name = self.unique_name(format!("{}-item", name));
        let body = self.visit(items, &item_name, &format!("{}[]", path))?;
        self.rules.push((item_name.clone(), body));
        Ok(format!(
            "\"[\" ws ({item} (ws \",\" ws {item})*)? ws \"]\"",
            item = item_name
        ))
    }
}
