/// 分析请求
///
/// 一次请求描述一组按时间排序的图片、提示词、可选的输出 Schema 以及首选/备用提供商。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ai::frame_selection::ImageRef;
use crate::ai::parser::KeyFrameRule;
use crate::ai::schema::JsonSchema;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// 已按时间排序的图片
    pub images: Vec<ImageRef>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonSchema>,
    pub provider_id: String,
    /// 模型参数：model / max_tokens / temperature / top_p，其余按协议透传
    #[serde(default)]
    pub model_params: BTreeMap<String, Value>,
    /// 首选提供商失败后依次尝试
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub key_frame_rule: KeyFrameRule,
}

impl AnalysisRequest {
    pub fn new(provider_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            images: Vec::new(),
            prompt: prompt.into(),
            schema: None,
            provider_id: provider_id.into(),
            model_params: BTreeMap::new(),
            fallback_chain: Vec::new(),
            key_frame_rule: KeyFrameRule::default(),
        }
    }

    pub fn with_images(mut self, images: Vec<ImageRef>) -> Self {
        self.images = images;
        self
    }

    pub fn with_schema(mut self, schema: JsonSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.model_params.insert(key.into(), value.into());
        self
    }

    pub fn with_fallback<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_chain = providers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_key_frame_rule(mut self, rule: KeyFrameRule) -> Self {
        self.key_frame_rule = rule;
        self
    }

    /// 依次尝试的提供商，去重并保持顺序
    pub fn provider_chain(&self) -> Vec<&str> {
        let mut chain: Vec<&str> = Vec::with_capacity(1 + self.fallback_chain.len());
        for id in std::iter::once(&self.provider_id).chain(self.fallback_chain.iter()) {
            if !chain.contains(&id.as_str()) {
                chain.push(id);
            }
        }
        chain
    }

    /// 请求自身的合法性，不涉及提供商
    pub fn validate(&self) -> AppResult<()> {
        if self.provider_id.trim().is_empty() {
            return Err(AppError::config(50, "provider_id 不能为空"));
        }
        if self.prompt.trim().is_empty() {
            return Err(AppError::config(51, "prompt 不能为空"));
        }
        if self.fallback_chain.iter().any(|id| id.trim().is_empty()) {
            return Err(AppError::config(52, "备用提供商 ID 不能为空"));
        }
        Ok(())
    }
}
