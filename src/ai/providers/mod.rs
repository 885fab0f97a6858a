/// 各厂商线协议
///
/// 每种协议负责三件事：构建请求体、给出端点与认证头、从原始响应中提取文本或结构化参数。
/// 结构化输出机制在进入这里之前已经被翻译成 `StructuredDirective`。

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::ai::capability::ApiFormat;
use crate::error::{AppError, AppResult};

pub use anthropic::AnthropicFormat;
pub use gemini::GeminiFormat;
pub use ollama::OllamaFormat;
pub use openai::OpenAIFormat;

/// 已编码的图片
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub media_type: String,
    pub data: String,
}

impl EncodedImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

/// 结构化输出指令（机制翻译后的结果）
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredDirective {
    /// 纯文本（包括尽力而为模式，指令已写进 prompt）
    Text,
    /// 严格 Schema
    StrictSchema(Value),
    /// 强制调用的伪工具，参数 Schema
    Tool(Value),
    /// 原生结构化格式字段
    Native(Value),
    /// GBNF 语法
    Grammar(String),
}

impl StructuredDirective {
    pub fn label(&self) -> &'static str {
        match self {
            StructuredDirective::Text => "text",
            StructuredDirective::StrictSchema(_) => "strict_schema",
            StructuredDirective::Tool(_) => "tool",
            StructuredDirective::Native(_) => "native",
            StructuredDirective::Grammar(_) => "grammar",
        }
    }
}

/// 采样参数
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    /// 未识别的参数，透传给支持透传的协议
    pub extra: Map<String, Value>,
}

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// 请求体中由翻译器负责的字段，不允许通过 model_params 覆盖
const RESERVED_KEYS: &[&str] = &[
    "messages",
    "stream",
    "response_format",
    "tools",
    "tool_choice",
    "functions",
    "function_call",
    "grammar",
    "format",
    "options",
];

impl SamplingParams {
    /// 从请求的 model_params 中解析，`model` 键由调用方单独处理
    pub fn from_params(params: &BTreeMap<String, Value>) -> AppResult<Self> {
        let mut sampling = Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            top_p: None,
            extra: Map::new(),
        };

        for (key, value) in params {
            match key.as_str() {
                "model" => {}
                "max_tokens" => {
                    sampling.max_tokens = value
                        .as_u64()
                        .filter(|v| *v > 0 && *v <= u32::MAX as u64)
                        .ok_or_else(|| AppError::config(40, "max_tokens 必须是正整数"))?
                        as u32;
                }
                "temperature" => {
                    sampling.temperature = Some(
                        value
                            .as_f64()
                            .ok_or_else(|| AppError::config(41, "temperature 必须是数字"))?,
                    );
                }
                "top_p" => {
                    sampling.top_p = Some(
                        value
                            .as_f64()
                            .ok_or_else(|| AppError::config(42, "top_p 必须是数字"))?,
                    );
                }
                reserved if RESERVED_KEYS.contains(&reserved) => {
                    return Err(AppError::config(
                        44,
                        format!("参数 '{}' 由结构化输出翻译负责，不能在 model_params 中指定", reserved),
                    ));
                }
                _ => {
                    sampling.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(sampling)
    }
}

/// 构建请求体所需的全部信息
#[derive(Debug, Clone)]
pub struct RequestParts<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub images: &'a [EncodedImage],
    pub directive: &'a StructuredDirective,
    pub sampling: &'a SamplingParams,
}

/// 从响应中提取的内容
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// 原始文本形式（工具调用时是参数的 JSON 文本）
    pub text: String,
    /// 提供商已经给出的结构化对象（工具调用参数）
    pub structured: Option<Value>,
}

impl Extracted {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured: None,
        }
    }
}

/// 线协议
pub trait WireFormat: Send + Sync {
    /// 协议名，用于日志
    fn name(&self) -> &'static str;

    /// 完整的请求 URL
    fn endpoint(&self, base_url: &str, model: &str) -> String;

    /// 认证头
    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)>;

    /// 构建请求体；协议无法表达的指令是配置错误
    fn build_body(&self, parts: &RequestParts<'_>) -> AppResult<Value>;

    /// 从原始响应提取内容
    fn extract(&self, raw: &str) -> AppResult<Extracted>;
}

static OPENAI: OpenAIFormat = OpenAIFormat { azure: false };
static AZURE_OPENAI: OpenAIFormat = OpenAIFormat { azure: true };
static ANTHROPIC: AnthropicFormat = AnthropicFormat;
static GEMINI: GeminiFormat = GeminiFormat;
static OLLAMA: OllamaFormat = OllamaFormat;

/// 按协议类型取实现
pub fn wire_format(format: ApiFormat) -> &'static dyn WireFormat {
    match format {
        ApiFormat::OpenAiChat => &OPENAI,
        ApiFormat::AzureOpenAi => &AZURE_OPENAI,
        ApiFormat::AnthropicMessages => &ANTHROPIC,
        ApiFormat::GeminiGenerate => &GEMINI,
        ApiFormat::OllamaChat => &OLLAMA,
    }
}

/// 协议不支持某指令时的统一错误
pub(crate) fn unsupported_directive(format: &str, directive: &StructuredDirective) -> AppError {
    AppError::config(
        43,
        format!("{} 协议不支持 {} 结构化输出", format, directive.label()),
    )
}

/// 统一的 base url 拼接
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// 解析响应 JSON，失败视为响应格式错误
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, format: &str) -> AppResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::response(1, format!("解析 {} 响应失败: {}", format, e)))
}
