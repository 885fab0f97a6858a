/// 请求翻译器
///
/// 把提供商无关的分析请求翻译成某个提供商的请求体：
/// 按能力裁剪图片、按机制生成结构化输出指令、拼接多帧说明。纯函数，不发网络请求。

use log::{debug, warn};
use serde_json::Value;

use crate::ai::capability::{ApiFormat, ProviderCapability, StructuredOutputMechanism};
use crate::ai::frame_selection::ImageRef;
use crate::ai::grammar::schema_to_gbnf;
use crate::ai::prompt::{frame_context, json_instruction};
use crate::ai::providers::{
    wire_format, EncodedImage, RequestParts, SamplingParams, StructuredDirective,
};
use crate::ai::request::AnalysisRequest;
use crate::error::{AppError, AppResult};

/// 翻译后的提供商请求
#[derive(Debug, Clone)]
pub struct ProviderPayload {
    pub provider_id: String,
    pub api_format: ApiFormat,
    pub mechanism: StructuredOutputMechanism,
    pub model: String,
    /// 最终请求体
    pub body: Value,
    /// 实际提交的帧（裁剪后，保持原顺序）
    pub frames: Vec<ImageRef>,
    /// 翻译过程中的提示信息（如图片被裁剪）
    pub notes: Vec<String>,
    /// 是否请求了结构化输出
    pub structured: bool,
}

impl ProviderPayload {
    /// 结构化输出只靠提示词约束
    pub fn is_best_effort(&self) -> bool {
        self.structured && self.mechanism.is_best_effort()
    }
}

/// 翻译请求；`model_params` 中的 `model` 覆盖 `default_model`
pub fn translate(
    request: &AnalysisRequest,
    capability: &ProviderCapability,
    default_model: &str,
) -> AppResult<ProviderPayload> {
    capability.validate()?;

    let model = request
        .model_params
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(default_model)
        .to_string();
    if model.is_empty() {
        return Err(AppError::config(
            60,
            format!("提供商 '{}' 未配置模型", capability.id),
        ));
    }

    if !request.images.is_empty() && !capability.supports_vision {
        return Err(AppError::config(
            61,
            format!("提供商 '{}' 不支持图像输入", capability.id),
        ));
    }

    let mut notes = Vec::new();
    let mut frames = request.images.clone();
    if frames.len() > capability.max_images_per_call {
        let note = format!(
            "图片数量 {} 超过提供商 '{}' 的上限 {}，已截断",
            frames.len(),
            capability.id,
            capability.max_images_per_call
        );
        warn!("[Translator] {}", note);
        notes.push(note);
        frames.truncate(capability.max_images_per_call);
    }

    let images = frames
        .iter()
        .map(|frame| {
            Ok(EncodedImage {
                media_type: frame.media_type.clone(),
                data: frame.data.to_base64()?,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    let directive = match &request.schema {
        None => StructuredDirective::Text,
        Some(schema) => match capability.mechanism {
            StructuredOutputMechanism::StrictSchema => {
                StructuredDirective::StrictSchema(schema.strict())
            }
            StructuredOutputMechanism::ToolBased => {
                StructuredDirective::Tool(schema.as_value().clone())
            }
            StructuredOutputMechanism::NativeParam => {
                StructuredDirective::Native(schema.as_value().clone())
            }
            StructuredOutputMechanism::Grammar => {
                StructuredDirective::Grammar(schema_to_gbnf(schema)?)
            }
            StructuredOutputMechanism::None => StructuredDirective::Text,
        },
    };

    let user_prompt = match (&request.schema, capability.mechanism) {
        (Some(schema), StructuredOutputMechanism::None) => json_instruction(&request.prompt, schema),
        _ => request.prompt.clone(),
    };
    let prompt = match frame_context(&frames) {
        Some(context) => format!("{}\n\n{}", context, user_prompt),
        None => user_prompt,
    };

    let sampling = SamplingParams::from_params(&request.model_params)?;
    let format = wire_format(capability.api_format);
    let body = format.build_body(&RequestParts {
        model: &model,
        prompt: &prompt,
        images: &images,
        directive: &directive,
        sampling: &sampling,
    })?;

    debug!(
        "[Translator] {} ({}): {} 张图片, 指令 {}",
        capability.id,
        format.name(),
        frames.len(),
        directive.label()
    );

    Ok(ProviderPayload {
        provider_id: capability.id.clone(),
        api_format: capability.api_format,
        mechanism: capability.mechanism,
        model,
        body,
        frames,
        notes,
        structured: request.schema.is_some(),
    })
}
