/// 核心配置定义

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::PathBuf;

use crate::ai::capability::{ApiFormat, ProviderCapability, StructuredOutputMechanism};
use crate::ai::dispatch::RetryPolicy;
use crate::error::{AppError, AppResult};

/// 自定义提供商未声明图片上限时使用
pub const DEFAULT_CUSTOM_MAX_IMAGES: usize = 5;

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::new(raw))
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

/// 单个提供商的连接配置
///
/// 密钥显式随配置传递，不从环境变量读取
#[derive(Deserialize)]
pub struct ProviderConfig {
    /// 提供商 ID，对应能力表中的条目
    pub id: String,

    /// API 基础地址
    pub api_base_url: String,

    /// API 密钥（本地服务可为空）
    #[serde(default = "empty_secret", deserialize_with = "deserialize_secret")]
    pub api_key: SecretString,

    /// 模型名称
    pub model: String,

    /// 以下字段覆盖内置能力；自定义提供商必须给出 mechanism
    #[serde(default)]
    pub mechanism: Option<StructuredOutputMechanism>,
    #[serde(default)]
    pub api_format: Option<ApiFormat>,
    #[serde(default)]
    pub supports_vision: Option<bool>,
    #[serde(default)]
    pub max_images_per_call: Option<usize>,
}

impl ProviderConfig {
    pub fn new(
        id: impl Into<String>,
        api_base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            api_base_url: api_base_url.into(),
            api_key: SecretString::new(api_key.into()),
            model: model.into(),
            mechanism: None,
            api_format: None,
            supports_vision: None,
            max_images_per_call: None,
        }
    }

    /// 覆盖结构化输出机制（builder 模式）
    pub fn with_mechanism(mut self, mechanism: StructuredOutputMechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }

    /// 覆盖线协议（builder 模式）
    pub fn with_api_format(mut self, api_format: ApiFormat) -> Self {
        self.api_format = Some(api_format);
        self
    }

    /// 覆盖图片上限（builder 模式）
    pub fn with_max_images(mut self, max_images_per_call: usize) -> Self {
        self.max_images_per_call = Some(max_images_per_call);
        self
    }

    pub fn has_overrides(&self) -> bool {
        self.mechanism.is_some()
            || self.api_format.is_some()
            || self.supports_vision.is_some()
            || self.max_images_per_call.is_some()
    }

    /// 合并内置能力与本配置的覆盖项
    pub fn resolve_capability(
        &self,
        builtin: Option<&ProviderCapability>,
    ) -> AppResult<ProviderCapability> {
        let mut capability = match builtin {
            Some(base) => base.clone(),
            None => {
                let mechanism = self.mechanism.ok_or_else(|| {
                    AppError::config(
                        70,
                        format!("自定义提供商 '{}' 必须声明 mechanism", self.id),
                    )
                })?;
                ProviderCapability::new(
                    self.id.clone(),
                    mechanism,
                    self.api_format.unwrap_or_default(),
                    DEFAULT_CUSTOM_MAX_IMAGES,
                )
            }
        };

        if let Some(mechanism) = self.mechanism {
            capability.mechanism = mechanism;
        }
        if let Some(api_format) = self.api_format {
            capability.api_format = api_format;
        }
        if let Some(max_images) = self.max_images_per_call {
            capability.max_images_per_call = max_images;
        }
        if let Some(supports_vision) = self.supports_vision {
            capability.supports_vision = supports_vision;
            if !supports_vision {
                capability.max_images_per_call = 0;
            }
        }

        capability.validate()?;
        Ok(capability)
    }
}

impl Clone for ProviderConfig {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            api_base_url: self.api_base_url.clone(),
            api_key: SecretString::new(self.api_key.expose_secret().clone()),
            model: self.model.clone(),
            mechanism: self.mechanism,
            api_format: self.api_format,
            supports_vision: self.supports_vision,
            max_images_per_call: self.max_images_per_call,
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("mechanism", &self.mechanism)
            .field("api_format", &self.api_format)
            .field("supports_vision", &self.supports_vision)
            .field("max_images_per_call", &self.max_images_per_call)
            .finish()
    }
}

/// 核心设置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// 重试策略
    pub retry: RetryPolicy,

    /// 并发上限（帧采集与批量分析）
    pub worker_limit: usize,

    /// 单次 HTTP 请求超时（秒）
    pub request_timeout_secs: u64,

    /// 默认截止时间（秒），None 表示不限制
    pub default_deadline_secs: Option<u64>,

    /// 请求未指定时的 max_tokens
    pub max_tokens: u32,

    /// 请求未指定时的 temperature
    pub temperature: f64,

    /// 调用日志目录，None 表示不记录
    pub call_log_dir: Option<PathBuf>,

    /// 调用日志保留天数
    pub call_log_retention_days: u32,

    /// 提供商配置
    pub providers: Vec<ProviderConfig>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            worker_limit: 4,
            request_timeout_secs: 120,
            default_deadline_secs: None,
            max_tokens: 4096,
            temperature: 0.7,
            call_log_dir: None,
            call_log_retention_days: 7,
            providers: Vec::new(),
        }
    }
}

impl CoreSettings {
    /// 按 ID 查找提供商配置
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// 验证设置
    pub fn validate(&self) -> AppResult<()> {
        if self.retry.max_attempts < 1 {
            return Err(AppError::config(80, "重试次数至少为 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(AppError::config(81, "抖动系数必须在 0-1 之间"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(AppError::config(82, "初始重试间隔不能大于最大间隔"));
        }
        if self.worker_limit < 1 {
            return Err(AppError::config(83, "并发上限至少为 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppError::config(84, "请求超时必须大于 0"));
        }
        if self.max_tokens == 0 {
            return Err(AppError::config(85, "max_tokens 必须大于 0"));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(AppError::config(86, "提供商 ID 不能为空"));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(AppError::config(
                    87,
                    format!("提供商 '{}' 重复配置", provider.id),
                ));
            }
            if !(provider.api_base_url.starts_with("http://")
                || provider.api_base_url.starts_with("https://"))
            {
                return Err(AppError::config(
                    88,
                    format!("提供商 '{}' 的地址必须以 http:// 或 https:// 开头", provider.id),
                ));
            }
            if provider.model.trim().is_empty() {
                return Err(AppError::config(
                    89,
                    format!("提供商 '{}' 未配置模型", provider.id),
                ));
            }
        }
        Ok(())
    }
}
