/// OpenAI Chat Completions 协议（含 Azure OpenAI 与兼容服务）

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{
    join_url, parse_json, unsupported_directive, Extracted, RequestParts, StructuredDirective,
    WireFormat,
};
use crate::ai::prompt::{STRUCTURED_TOOL_DESCRIPTION, STRUCTURED_TOOL_NAME};
use crate::error::{AppError, AppResult};

const AZURE_API_VERSION: &str = "2024-10-21";
const RESPONSE_FORMAT_NAME: &str = "structured_response";

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: Vec<OpenAIContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OpenAIContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: OpenAIImageUrl },
}

#[derive(Debug, Serialize)]
struct OpenAIImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    function: OpenAIFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

/// OpenAI 协议；`azure` 为 true 时使用部署路径与 `api-key` 头
pub struct OpenAIFormat {
    pub azure: bool,
}

impl WireFormat for OpenAIFormat {
    fn name(&self) -> &'static str {
        if self.azure {
            "azure_openai"
        } else {
            "openai"
        }
    }

    fn endpoint(&self, base_url: &str, model: &str) -> String {
        if self.azure {
            join_url(
                base_url,
                &format!(
                    "/openai/deployments/{}/chat/completions?api-version={}",
                    model, AZURE_API_VERSION
                ),
            )
        } else {
            join_url(base_url, "/v1/chat/completions")
        }
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        if api_key.is_empty() {
            return Vec::new();
        }
        if self.azure {
            vec![("api-key".to_string(), api_key.to_string())]
        } else {
            vec![("Authorization".to_string(), format!("Bearer {}", api_key))]
        }
    }

    fn build_body(&self, parts: &RequestParts<'_>) -> AppResult<Value> {
        let mut content = vec![OpenAIContent::Text {
            text: parts.prompt.to_string(),
        }];
        content.extend(parts.images.iter().map(|image| OpenAIContent::ImageUrl {
            image_url: OpenAIImageUrl {
                url: image.data_url(),
            },
        }));

        let mut request = OpenAIRequest {
            // Azure 的模型由部署路径决定
            model: (!self.azure).then(|| parts.model.to_string()),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content,
            }],
            max_tokens: parts.sampling.max_tokens,
            temperature: parts.sampling.temperature,
            top_p: parts.sampling.top_p,
            response_format: None,
            tools: None,
            tool_choice: None,
            grammar: None,
            extra: parts.sampling.extra.clone(),
        };

        match parts.directive {
            StructuredDirective::Text => {}
            StructuredDirective::StrictSchema(schema) => {
                request.response_format = Some(json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": RESPONSE_FORMAT_NAME,
                        "strict": true,
                        "schema": schema,
                    }
                }));
            }
            StructuredDirective::Native(schema) => {
                request.response_format = Some(json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": RESPONSE_FORMAT_NAME,
                        "schema": schema,
                    }
                }));
            }
            StructuredDirective::Tool(schema) => {
                request.tools = Some(vec![OpenAITool {
                    kind: "function".to_string(),
                    function: OpenAIFunction {
                        name: STRUCTURED_TOOL_NAME.to_string(),
                        description: STRUCTURED_TOOL_DESCRIPTION.to_string(),
                        parameters: schema.clone(),
                    },
                }]);
                request.tool_choice = Some(json!({
                    "type": "function",
                    "function": {"name": STRUCTURED_TOOL_NAME}
                }));
            }
            StructuredDirective::Grammar(grammar) => {
                if self.azure {
                    return Err(unsupported_directive(self.name(), parts.directive));
                }
                request.grammar = Some(grammar.clone());
            }
        }

        Ok(serde_json::to_value(&request)?)
    }

    fn extract(&self, raw: &str) -> AppResult<Extracted> {
        let response: OpenAIResponse = parse_json(raw, self.name())?;
        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| AppError::response(2, "响应中没有内容"))?;

        if let Some(call) = message
            .tool_calls
            .into_iter()
            .find(|call| call.function.name == STRUCTURED_TOOL_NAME)
        {
            // 参数不是合法 JSON 属于模型输出问题，可以重试
            let value: Value = serde_json::from_str(&call.function.arguments).map_err(|e| {
                AppError::schema_invalid(2, format!("工具参数不是合法 JSON: {}", e))
            })?;
            return Ok(Extracted {
                text: call.function.arguments,
                structured: Some(value),
            });
        }

        message
            .content
            .filter(|c| !c.is_empty())
            .map(Extracted::text)
            .ok_or_else(|| AppError::response(2, "响应中没有内容"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::providers::{EncodedImage, SamplingParams};
    use crate::error::ErrorKind;
    use std::collections::BTreeMap;

    fn sampling() -> SamplingParams {
        SamplingParams::from_params(&BTreeMap::new()).unwrap()
    }

    fn images() -> Vec<EncodedImage> {
        vec![EncodedImage {
            media_type: "image/jpeg".into(),
            data: "AAAA".into(),
        }]
    }

    fn build(format: &OpenAIFormat, directive: StructuredDirective) -> AppResult<Value> {
        let sampling = sampling();
        let images = images();
        format.build_body(&RequestParts {
            model: "gpt-4o-mini",
            prompt: "describe",
            images: &images,
            directive: &directive,
            sampling: &sampling,
        })
    }

    #[test]
    fn test_strict_schema_body() {
        let format = OpenAIFormat { azure: false };
        let schema = json!({"type": "object", "properties": {}});
        let body = build(&format, StructuredDirective::StrictSchema(schema.clone())).unwrap();

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(body["response_format"]["json_schema"]["schema"], schema);
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_text_body_has_no_structured_fields() {
        let format = OpenAIFormat { azure: false };
        let body = build(&format, StructuredDirective::Text).unwrap();
        assert!(body.get("response_format").is_none());
        assert!(body.get("tools").is_none());
        assert!(body.get("grammar").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_tool_and_grammar_body() {
        let format = OpenAIFormat { azure: false };
        let body = build(&format, StructuredDirective::Tool(json!({"type": "object"}))).unwrap();
        assert_eq!(body["tools"][0]["function"]["name"], STRUCTURED_TOOL_NAME);
        assert_eq!(body["tool_choice"]["function"]["name"], STRUCTURED_TOOL_NAME);

        let body = build(&format, StructuredDirective::Grammar("root ::= \"x\"".into())).unwrap();
        assert_eq!(body["grammar"], "root ::= \"x\"");
    }

    #[test]
    fn test_azure_endpoint_and_headers() {
        let format = OpenAIFormat { azure: true };
        assert_eq!(
            format.endpoint("https://res.openai.azure.com/", "gpt4o"),
            "https://res.openai.azure.com/openai/deployments/gpt4o/chat/completions?api-version=2024-10-21"
        );
        assert_eq!(format.auth_headers("k")[0].0, "api-key");

        let body = build(&format, StructuredDirective::Text).unwrap();
        assert!(body.get("model").is_none());
        assert!(build(&format, StructuredDirective::Grammar("g".into())).is_err());
    }

    #[test]
    fn test_extract_content() {
        let format = OpenAIFormat { azure: false };
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"{\"a\":1}"}}]}"#;
        let extracted = format.extract(raw).unwrap();
        assert_eq!(extracted.text, "{\"a\":1}");
        assert!(extracted.structured.is_none());
    }

    #[test]
    fn test_extract_tool_call() {
        let format = OpenAIFormat { azure: false };
        let raw = json!({
            "choices": [{"message": {"content": null, "tool_calls": [{
                "id": "call_1", "type": "function",
                "function": {"name": STRUCTURED_TOOL_NAME, "arguments": "{\"a\":1}"}
            }]}}]
        })
        .to_string();
        let extracted = format.extract(&raw).unwrap();
        assert_eq!(extracted.structured, Some(json!({"a": 1})));

        let broken = raw.replace("{\\\"a\\\":1}", "{oops");
        let err = format.extract(&broken).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
    }

    #[test]
    fn test_extract_empty() {
        let format = OpenAIFormat { azure: false };
        let err = format.extract(r#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        let err = format.extract("<html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }
}
