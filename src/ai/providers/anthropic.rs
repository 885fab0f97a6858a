/// Anthropic Messages 协议
///
/// 结构化输出只能通过强制调用伪工具实现，结果从 tool_use 块的 input 读取。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    join_url, parse_json, unsupported_directive, Extracted, RequestParts, StructuredDirective,
    WireFormat,
};
use crate::ai::prompt::{STRUCTURED_TOOL_DESCRIPTION, STRUCTURED_TOOL_NAME};
use crate::error::{AppError, AppResult};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ClaudeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ClaudeTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ClaudeToolChoice>,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage {
    role: String,
    content: Vec<ClaudeContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ClaudeContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ClaudeImageSource },
}

#[derive(Debug, Serialize)]
struct ClaudeImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct ClaudeTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ClaudeToolChoice {
    #[serde(rename = "type")]
    kind: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClaudeResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },
    #[serde(other)]
    Other,
}

pub struct AnthropicFormat;

impl WireFormat for AnthropicFormat {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn endpoint(&self, base_url: &str, _model: &str) -> String {
        join_url(base_url, "/v1/messages")
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![
            ("x-api-key".to_string(), api_key.to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ]
    }

    fn build_body(&self, parts: &RequestParts<'_>) -> AppResult<Value> {
        let (tools, tool_choice) = match parts.directive {
            StructuredDirective::Text => (None, None),
            StructuredDirective::Tool(schema) => (
                Some(vec![ClaudeTool {
                    name: STRUCTURED_TOOL_NAME.to_string(),
                    description: STRUCTURED_TOOL_DESCRIPTION.to_string(),
                    input_schema: schema.clone(),
                }]),
                Some(ClaudeToolChoice {
                    kind: "tool".to_string(),
                    name: STRUCTURED_TOOL_NAME.to_string(),
                }),
            ),
            other => return Err(unsupported_directive(self.name(), other)),
        };

        if !parts.sampling.extra.is_empty() {
            log::debug!(
                "[Anthropic] 忽略不支持的参数: {:?}",
                parts.sampling.extra.keys().collect::<Vec<_>>()
            );
        }

        // 图片在前、文本在后
        let mut content: Vec<ClaudeContent> = parts
            .images
            .iter()
            .map(|image| ClaudeContent::Image {
                source: ClaudeImageSource {
                    source_type: "base64".to_string(),
                    media_type: image.media_type.clone(),
                    data: image.data.clone(),
                },
            })
            .collect();
        content.push(ClaudeContent::Text {
            text: parts.prompt.to_string(),
        });

        let request = ClaudeRequest {
            model: parts.model.to_string(),
            max_tokens: parts.sampling.max_tokens,
            messages: vec![ClaudeMessage {
                role: "user".to_string(),
                content,
            }],
            temperature: parts.sampling.temperature,
            top_p: parts.sampling.top_p,
            tools,
            tool_choice,
        };

        Ok(serde_json::to_value(&request)?)
    }

    fn extract(&self, raw: &str) -> AppResult<Extracted> {
        let response: ClaudeResponse = parse_json(raw, self.name())?;

        let mut texts = Vec::new();
        for block in response.content {
            match block {
                ClaudeResponseBlock::ToolUse { name, input } if name == STRUCTURED_TOOL_NAME => {
                    return Ok(Extracted {
                        text: input.to_string(),
                        structured: Some(input),
                    });
                }
                ClaudeResponseBlock::Text { text } => texts.push(text),
                _ => {}
            }
        }

        if texts.is_empty() {
            return Err(AppError::response(2, "响应中没有内容"));
        }
        Ok(Extracted::text(texts.join("")))
    }
}
