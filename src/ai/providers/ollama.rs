/// Ollama /api/chat 协议
///
/// 图片以 base64 数组挂在消息上，结构化输出用顶层 `format` 字段，采样参数放在 `options` 里。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    join_url, parse_json, unsupported_directive, Extracted, RequestParts, StructuredDirective,
    WireFormat,
};
use crate::error::{AppError, AppResult};

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
    options: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: Option<OllamaResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

pub struct OllamaFormat;

impl WireFormat for OllamaFormat {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn endpoint(&self, base_url: &str, _model: &str) -> String {
        join_url(base_url, "/api/chat")
    }

    /// 本地服务通常不需要认证；配置了密钥时按反向代理的 Bearer 方式发送
    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        if api_key.is_empty() {
            Vec::new()
        } else {
            vec![("Authorization".to_string(), format!("Bearer {}", api_key))]
        }
    }

    fn build_body(&self, parts: &RequestParts<'_>) -> AppResult<Value> {
        let format = match parts.directive {
            StructuredDirective::Text => None,
            StructuredDirective::Native(schema) => Some(schema.clone()),
            other => return Err(unsupported_directive(self.name(), other)),
        };

        let mut options = parts.sampling.extra.clone();
        options.insert("num_predict".to_string(), Value::from(parts.sampling.max_tokens));
        if let Some(temperature) = parts.sampling.temperature {
            options.insert("temperature".to_string(), Value::from(temperature));
        }
        if let Some(top_p) = parts.sampling.top_p {
            options.insert("top_p".to_string(), Value::from(top_p));
        }

        let request = OllamaRequest {
            model: parts.model.to_string(),
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: parts.prompt.to_string(),
                images: parts.images.iter().map(|i| i.data.clone()).collect(),
            }],
            stream: false,
            format,
            options,
        };

        Ok(serde_json::to_value(&request)?)
    }

    fn extract(&self, raw: &str) -> AppResult<Extracted> {
        let response: OllamaResponse = parse_json(raw, self.name())?;
        response
            .message
            .map(|m| m.content)
            .filter(|c| !c.is_empty())
            .map(Extracted::text)
            .ok_or_else(|| AppError::response(2, "响应中没有内容"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::providers::{EncodedImage, SamplingParams};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_native_body() {
        let mut params = BTreeMap::new();
        params.insert("max_tokens".to_string(), json!(256));
        params.insert("num_ctx".to_string(), json!(8192));
        let sampling = SamplingParams::from_params(&params).unwrap();
        let images = vec![EncodedImage {
            media_type: "image/jpeg".into(),
            data: "DDDD".into(),
        }];
        let schema = json!({"type": "object"});
        let directive = StructuredDirective::Native(schema.clone());

        let body = OllamaFormat
            .build_body(&RequestParts {
                model: "llava",
                prompt: "describe",
                images: &images,
                directive: &directive,
                sampling: &sampling,
            })
            .unwrap();

        assert_eq!(body["stream"], false);
        assert_eq!(body["format"], schema);
        assert_eq!(body["messages"][0]["images"], json!(["DDDD"]));
        assert_eq!(body["options"]["num_predict"], 256);
        assert_eq!(body["options"]["num_ctx"], 8192);
        assert!(body["options"].get("temperature").is_none());
    }

    #[test]
    fn test_grammar_unsupported() {
        let sampling = SamplingParams::from_params(&BTreeMap::new()).unwrap();
        let directive = StructuredDirective::Grammar("root ::= x".into());
        let result = OllamaFormat.build_body(&RequestParts {
            model: "llava",
            prompt: "p",
            images: &[],
            directive: &directive,
            sampling: &sampling,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_extract() {
        let raw = r#"{"model":"llava","message":{"role":"assistant","content":"hi"},"done":true}"#;
        assert_eq!(OllamaFormat.extract(raw).unwrap().text, "hi");
        assert!(OllamaFormat.extract(r#"{"done":true}"#).is_err());
        assert!(OllamaFormat.auth_headers("").is_empty());
    }
}
