use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    join_url, parse_json, unsupported_directive, Extracted, RequestParts, StructuredDirective,
    WireFormat,
};
use crate::error::{AppError, AppResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiInlineData },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(rename = "response_mime_type", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(rename = "response_json_schema", skip_serializing_if = "Option::is_none")]
    response_json_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

/// Google Gemini generateContent 协议
pub struct GeminiFormat;

impl WireFormat for GeminiFormat {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn endpoint(&self, base_url: &str, model: &str) -> String {
        join_url(base_url, &format!("/v1beta/models/{}:generateContent", model))
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![("x-goog-api-key".to_string(), api_key.to_string())]
    }

    fn build_body(&self, parts: &RequestParts<'_>) -> AppResult<Value> {
        let mut generation_config = GeminiGenerationConfig {
            max_output_tokens: parts.sampling.max_tokens,
            temperature: parts.sampling.temperature,
            top_p: parts.sampling.top_p,
            response_mime_type: None,
            response_json_schema: None,
        };

        match parts.directive {
            StructuredDirective::Text => {}
            StructuredDirective::Native(schema) => {
                generation_config.response_mime_type = Some("application/json".to_string());
                generation_config.response_json_schema = Some(schema.clone());
            }
            other => return Err(unsupported_directive(self.name(), other)),
        }

        if !parts.sampling.extra.is_empty() {
            log::debug!(
                "[Gemini] 忽略不支持的参数: {:?}",
                parts.sampling.extra.keys().collect::<Vec<_>>()
            );
        }

        let mut request_parts = vec![GeminiPart::Text {
            text: parts.prompt.to_string(),
        }];
        request_parts.extend(parts.images.iter().map(|image| GeminiPart::InlineData {
            inline_data: GeminiInlineData {
                mime_type: image.media_type.clone(),
                data: image.data.clone(),
            },
        }));

        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: request_parts,
            }],
            generation_config,
        };

        Ok(serde_json::to_value(&request)?)
    }

    fn extract(&self, raw: &str) -> AppResult<Extracted> {
        let response: GeminiResponse = parse_json(raw, self.name())?;

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(AppError::response(2, "响应中没有内容"));
        }
        Ok(Extracted::text(text))
    }
}
