/// 视觉分析核心
///
/// 提供商能力描述、多摄像头帧选择、结构化输出翻译、调用重试与响应校验

pub mod acquisition;
pub mod call_log;
pub mod capability;
pub mod dispatch;
pub mod frame_selection;
pub mod grammar;
pub mod parser;
pub mod prompt;
pub mod providers;
pub mod request;
pub mod schema;
pub mod service;
pub mod translator;

// 重新导出常用类型
pub use acquisition::{gather_frames, FrameSource, GatherOutcome, StaticFrameSource};
pub use call_log::{CallLogEntry, CallLogger};
pub use capability::{ApiFormat, CapabilityTable, ProviderCapability, StructuredOutputMechanism};
pub use dispatch::{
    AttemptOutcome, CallAttempt, CallState, Dispatcher, HttpRequest, HttpResponse, HttpTransport,
    RetryPolicy, Transport,
};
pub use frame_selection::{
    select, CoverageShortfall, FrameQuota, ImageData, ImageRef, SelectionOutcome,
};
pub use parser::{parse, AnalysisResult, KeyFrameRule, ResultMetadata};
pub use request::AnalysisRequest;
pub use schema::JsonSchema;
pub use service::{AnalysisOptions, AnalysisService, TitleRule};
pub use translator::{translate, ProviderPayload};
