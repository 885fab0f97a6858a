/// 响应解析与校验
///
/// 从提供商的原始响应中取出文本或结构化参数，按 Schema 校验，组装成统一的分析结果。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai::capability::{ProviderCapability, StructuredOutputMechanism};
use crate::ai::frame_selection::{CoverageShortfall, ImageRef};
use crate::ai::providers::wire_format;
use crate::ai::schema::JsonSchema;
use crate::error::{AppError, AppResult};

/// 关键帧选择规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeyFrameRule {
    /// 提交帧中最新的一帧
    #[default]
    MostRecent,
    /// 质量分最高的一帧（同分取最新）
    HighestQuality,
    /// 第一帧
    First,
    /// 指定下标
    Index(usize),
    /// 不设置关键帧
    Disabled,
}

impl KeyFrameRule {
    pub fn pick(&self, frames: &[ImageRef]) -> Option<ImageRef> {
        let by_time = |a: &&ImageRef, b: &&ImageRef| a.timestamp.cmp(&b.timestamp);
        let picked = match self {
            // max_by 在相等时返回后一个元素，即提交顺序靠后的那帧
            KeyFrameRule::MostRecent => frames.iter().max_by(by_time),
            KeyFrameRule::HighestQuality => frames.iter().max_by(|a, b| {
                a.rank_score()
                    .total_cmp(&b.rank_score())
                    .then_with(|| by_time(a, b))
            }),
            KeyFrameRule::First => frames.first(),
            KeyFrameRule::Index(i) => frames.get(*i),
            KeyFrameRule::Disabled => None,
        };
        picked.cloned()
    }
}

/// 结果附带的诊断信息
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub provider_id: String,
    pub model: String,
    /// 成功所在提供商上的尝试次数
    pub attempts: u32,
    /// 结构化输出只靠提示词约束
    pub best_effort: bool,
    /// 非致命提示（如图片被截断、前序提供商失败）
    pub notes: Vec<String>,
    /// 帧选择的配额缺口
    pub shortfalls: Vec<CoverageShortfall>,
}

/// 归一化的分析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// 原始文本形式，便于诊断
    pub raw_text: String,
    pub structured_response: Option<Value>,
    /// 由调用方的摘要规则填写
    pub title: Option<String>,
    pub key_frame: Option<ImageRef>,
    #[serde(default)]
    pub metadata: ResultMetadata,
}

/// 从文本中提取 JSON：依次尝试 ```json 代码块、普通代码块、首个 `{` 到末个 `}`
pub fn extract_json(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let after_marker = &text[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return after_marker[..end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let after_marker = &text[start + 3..];
        if let Some(end) = after_marker.find("```") {
            return after_marker[..end].trim();
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text.trim()
}

/// 诊断信息里只保留响应开头
fn snippet(text: &str) -> String {
    const MAX_CHARS: usize = 200;
    if text.chars().count() <= MAX_CHARS {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX_CHARS).collect();
        format!("{}...", head)
    }
}

/// 解析原始响应
///
/// 请求了 Schema 时，JSON 解析失败或校验失败都返回 SchemaInvalid（上游可重试）。
pub fn parse(
    raw: &str,
    capability: &ProviderCapability,
    expected_schema: Option<&JsonSchema>,
    frames: &[ImageRef],
    key_frame_rule: KeyFrameRule,
) -> AppResult<AnalysisResult> {
    let extracted = wire_format(capability.api_format).extract(raw)?;

    let structured_response = match expected_schema {
        None => None,
        Some(schema) => {
            let value = match extracted.structured {
                Some(value) => value,
                None => serde_json::from_str::<Value>(extract_json(&extracted.text)).map_err(
                    |e| {
                        AppError::schema_invalid(
                            3,
                            format!("响应不是合法 JSON ({}): {}", e, snippet(&extracted.text)),
                        )
                    },
                )?,
            };

            schema.validate(&value).map_err(|violations| {
                let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
                AppError::schema_invalid(
                    1,
                    format!("{} | 原始响应: {}", details.join("; "), snippet(&extracted.text)),
                )
            })?;
            Some(value)
        }
    };

    Ok(AnalysisResult {
        raw_text: extracted.text,
        structured_response,
        title: None,
        key_frame: key_frame_rule.pick(frames),
        metadata: ResultMetadata {
            provider_id: capability.id.clone(),
            best_effort: expected_schema.is_some()
                && capability.mechanism == StructuredOutputMechanism::None,
            ..ResultMetadata::default()
        },
    })
}
