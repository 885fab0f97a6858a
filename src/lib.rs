// 模块声明
mod error;
pub mod ai;
pub mod settings;

// 导出错误类型供其他模块使用
pub use error::{AnalysisError, AppError, AppResult, ErrorKind};

pub use ai::{
    AnalysisOptions, AnalysisRequest, AnalysisResult, AnalysisService, CapabilityTable,
    FrameQuota, ImageData, ImageRef, JsonSchema, KeyFrameRule, ProviderCapability,
    StructuredOutputMechanism,
};
pub use settings::{CoreSettings, ProviderConfig, SettingsManager};

/// 初始化日志，重复调用不会报错
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init();
}
