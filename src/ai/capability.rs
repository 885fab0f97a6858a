/// 提供商能力描述模块
///
/// 声明每个提供商使用哪种结构化输出机制、是否支持视觉以及单次调用的图片上限。
/// 能力表在进程启动时构建一次，之后只读，可在并发调用之间共享。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, AppResult};

/// 结构化输出机制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructuredOutputMechanism {
    /// Schema 原样嵌入强制字段，要求精确属性集
    StrictSchema,
    /// 合成一个伪工具并强制调用
    ToolBased,
    /// 挂在提供商专用的结构化格式字段上
    NativeParam,
    /// 由 Schema 推导语法约束
    Grammar,
    /// 只在提示词里要求 JSON，无强制保证
    None,
}

impl StructuredOutputMechanism {
    /// 该机制是否只能尽力而为
    pub fn is_best_effort(&self) -> bool {
        matches!(self, StructuredOutputMechanism::None)
    }
}

/// 线协议格式（决定请求体字段名和响应提取方式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ApiFormat {
    #[default]
    OpenAiChat,
    /// OpenAI 兼容格式，但使用 `api-key` 头认证
    AzureOpenAi,
    AnthropicMessages,
    GeminiGenerate,
    OllamaChat,
}

/// 提供商能力描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapability {
    /// 提供商 ID (唯一标识)
    pub id: String,

    /// 结构化输出机制
    pub mechanism: StructuredOutputMechanism,

    /// 是否支持图像输入
    pub supports_vision: bool,

    /// 单次调用最多图片数
    pub max_images_per_call: usize,

    /// 线协议格式
    #[serde(default)]
    pub api_format: ApiFormat,
}

impl ProviderCapability {
    pub fn new(
        id: impl Into<String>,
        mechanism: StructuredOutputMechanism,
        api_format: ApiFormat,
        max_images_per_call: usize,
    ) -> Self {
        Self {
            id: id.into(),
            mechanism,
            supports_vision: true,
            max_images_per_call,
            api_format,
        }
    }

    /// 标记为纯文本提供商（builder 模式）
    pub fn text_only(self) -> Self {
        Self {
            supports_vision: false,
            max_images_per_call: 0,
            ..self
        }
    }

    /// 验证描述
    pub fn validate(&self) -> AppResult<()> {
        if self.id.is_empty() {
            return Err(AppError::config(20, "提供商 ID 不能为空"));
        }
        if self.supports_vision && self.max_images_per_call == 0 {
            return Err(AppError::config(
                21,
                format!("提供商 '{}' 支持视觉但图片上限为 0", self.id),
            ));
        }
        Ok(())
    }
}

/// 提供商能力表
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: BTreeMap<String, ProviderCapability>,
}

impl CapabilityTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置提供商
    pub fn builtin() -> Self {
        use StructuredOutputMechanism as M;

        let mut table = Self::new();
        let builtins = [
            ProviderCapability::new("openai", M::StrictSchema, ApiFormat::OpenAiChat, 10),
            ProviderCapability::new("azure_openai", M::StrictSchema, ApiFormat::AzureOpenAi, 10),
            ProviderCapability::new("anthropic", M::ToolBased, ApiFormat::AnthropicMessages, 20),
            ProviderCapability::new("google", M::NativeParam, ApiFormat::GeminiGenerate, 16),
            ProviderCapability::new("ollama", M::NativeParam, ApiFormat::OllamaChat, 5),
            ProviderCapability::new("localai", M::Grammar, ApiFormat::OpenAiChat, 5),
            ProviderCapability::new("groq", M::None, ApiFormat::OpenAiChat, 5),
            ProviderCapability::new("openwebui", M::None, ApiFormat::OpenAiChat, 5),
        ];
        for capability in builtins {
            table.entries.insert(capability.id.clone(), capability);
        }
        table
    }

    /// 注册提供商，ID 重复视为配置错误
    pub fn register(&mut self, capability: ProviderCapability) -> AppResult<()> {
        capability.validate()?;
        if self.entries.contains_key(&capability.id) {
            return Err(AppError::config(
                22,
                format!("提供商 ID '{}' 已存在", capability.id),
            ));
        }
        self.entries.insert(capability.id.clone(), capability);
        Ok(())
    }

    /// 覆盖已有描述（用于配置文件中的覆盖项）
    pub fn upsert(&mut self, capability: ProviderCapability) -> AppResult<()> {
        capability.validate()?;
        self.entries.insert(capability.id.clone(), capability);
        Ok(())
    }

    /// 查询提供商，未知 ID 是配置错误
    pub fn get(&self, provider_id: &str) -> AppResult<&ProviderCapability> {
        self.entries
            .get(provider_id)
            .ok_or_else(|| AppError::config(23, format!("未知的提供商 ID '{}'", provider_id)))
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.entries.contains_key(provider_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
