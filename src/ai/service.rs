/// 分析服务
///
/// 串起完整流程：校验请求 → 帧选择 → 逐个提供商翻译、调用、解析 → 返回结果。
/// 能力表在构建时确定，之后只读，多个并发分析共享同一份。

use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::ai::acquisition::{gather_frames, FrameSource};
use crate::ai::call_log::{CallLogEntry, CallLogger};
use crate::ai::capability::{CapabilityTable, ProviderCapability};
use crate::ai::dispatch::{Dispatcher, HttpTransport, Transport};
use crate::ai::frame_selection::{select, CoverageShortfall, FrameQuota, ImageRef};
use crate::ai::parser::{parse, AnalysisResult};
use crate::ai::request::AnalysisRequest;
use crate::ai::translator::translate;
use crate::error::{AnalysisError, AppError, AppResult, ErrorKind};
use crate::settings::{CoreSettings, ProviderConfig};

/// 标题规则，由调用方提供
pub type TitleRule = Arc<dyn Fn(&AnalysisResult) -> Option<String> + Send + Sync>;

/// 单次分析的选项
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// 每个摄像头的最低配额
    pub quotas: Vec<FrameQuota>,
    /// 帧总预算；None 表示不做帧选择，直接使用请求中的全部图片
    pub total_budget: Option<usize>,
    /// 截止时间；None 时使用设置中的默认值
    pub deadline: Option<Duration>,
}

impl AnalysisOptions {
    pub fn with_selection(quotas: Vec<FrameQuota>, total_budget: usize) -> Self {
        Self {
            quotas,
            total_budget: Some(total_budget),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// 已解析的提供商：能力 + 连接配置
struct ResolvedProvider<'a> {
    capability: &'a ProviderCapability,
    config: &'a ProviderConfig,
}

/// 分析服务
pub struct AnalysisService {
    capabilities: Arc<CapabilityTable>,
    settings: Arc<CoreSettings>,
    dispatcher: Dispatcher,
    call_logger: Option<CallLogger>,
    title_rule: Option<TitleRule>,
}

impl AnalysisService {
    /// 使用内置能力表和 reqwest 传输层
    pub fn new(settings: CoreSettings) -> AppResult<Self> {
        let transport = HttpTransport::new(Duration::from_secs(settings.request_timeout_secs))?;
        Self::with_transport(settings, CapabilityTable::builtin(), Arc::new(transport))
    }

    /// 自定义能力表和传输层
    pub fn with_transport(
        settings: CoreSettings,
        mut capabilities: CapabilityTable,
        transport: Arc<dyn Transport>,
    ) -> AppResult<Self> {
        settings.validate()?;

        // 配置中的覆盖项在这里合并进能力表，之后只读
        for provider in &settings.providers {
            let builtin = capabilities.get(&provider.id).ok();
            if builtin.is_none() || provider.has_overrides() {
                let capability = provider.resolve_capability(builtin)?;
                capabilities.upsert(capability)?;
            }
        }

        let call_logger = settings.call_log_dir.clone().map(CallLogger::new);
        let dispatcher = Dispatcher::new(transport, settings.retry.clone());

        info!(
            "[Service] 初始化完成: {} 个提供商能力, {} 个已配置提供商",
            capabilities.len(),
            settings.providers.len()
        );

        Ok(Self {
            capabilities: Arc::new(capabilities),
            settings: Arc::new(settings),
            dispatcher,
            call_logger,
            title_rule: None,
        })
    }

    /// 设置标题规则（builder 模式）
    pub fn with_title_rule(mut self, rule: TitleRule) -> Self {
        self.title_rule = Some(rule);
        self
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    pub fn call_logger(&self) -> Option<&CallLogger> {
        self.call_logger.as_ref()
    }

    fn resolve(&self, provider_id: &str) -> AppResult<ResolvedProvider<'_>> {
        let capability = self.capabilities.get(provider_id)?;
        let config = self.settings.provider(provider_id).ok_or_else(|| {
            AppError::config(
                91,
                format!("提供商 '{}' 没有连接配置", provider_id),
            )
        })?;
        Ok(ResolvedProvider { capability, config })
    }

    fn deadline_for(&self, options: &AnalysisOptions) -> Option<Instant> {
        options
            .deadline
            .or_else(|| self.settings.default_deadline_secs.map(Duration::from_secs))
            .map(|d| Instant::now() + d)
    }

    /// 分析一个请求
    pub async fn analyze(
        &self,
        request: AnalysisRequest,
        options: AnalysisOptions,
    ) -> Result<AnalysisResult, AnalysisError> {
        let deadline = self.deadline_for(&options);
        self.analyze_until(request, &options, deadline, Vec::new())
            .await
    }

    /// 先并发采集各摄像头的帧，再分析
    pub async fn analyze_cameras(
        &self,
        mut request: AnalysisRequest,
        sources: Vec<Arc<dyn FrameSource>>,
        options: AnalysisOptions,
    ) -> Result<AnalysisResult, AnalysisError> {
        let deadline = self.deadline_for(&options);
        let gathered = gather_frames(sources, self.settings.worker_limit, deadline).await;
        let notes = gathered.notes();
        request.images.extend(gathered.candidates);
        self.analyze_until(request, &options, deadline, notes).await
    }

    /// 并发分析多个独立请求，结果顺序与输入一致
    pub async fn analyze_batch(
        self: &Arc<Self>,
        jobs: Vec<(AnalysisRequest, AnalysisOptions)>,
    ) -> Vec<Result<AnalysisResult, AnalysisError>> {
        let semaphore = Arc::new(Semaphore::new(self.settings.worker_limit.max(1)));
        let mut tasks = JoinSet::new();
        let total = jobs.len();

        for (index, (request, options)) in jobs.into_iter().enumerate() {
            let service = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => service.analyze(request, options).await,
                    Err(e) => Err(AnalysisError::from(AppError::Unknown(e.to_string()))),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<AnalysisResult, AnalysisError>>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("[Service] 批量分析任务异常退出: {}", e),
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(AnalysisError::from(AppError::Unknown(
                        "分析任务异常退出".to_string(),
                    )))
                })
            })
            .collect()
    }

    /// 发送一个纯文本请求验证连接
    pub async fn test_connection(&self, provider_id: &str) -> Result<String, AnalysisError> {
        let request = AnalysisRequest::new(provider_id, "Hello").with_param("max_tokens", 16);
        self.analyze(request, AnalysisOptions::default()).await?;
        Ok("连接成功".to_string())
    }

    /// 选帧，返回按时间排序的帧和配额缺口
    fn prepare_frames(
        images: Vec<ImageRef>,
        options: &AnalysisOptions,
    ) -> AppResult<(Vec<ImageRef>, Vec<CoverageShortfall>)> {
        match options.total_budget {
            Some(budget) => {
                let outcome = select(images, &options.quotas, budget)?;
                Ok((outcome.frames, outcome.shortfalls))
            }
            None if !options.quotas.is_empty() => Err(AppError::config(
                90,
                "指定了摄像头配额但没有给出总预算",
            )),
            None => {
                let mut frames = images;
                frames.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
                Ok((frames, Vec::new()))
            }
        }
    }

    /// 未指定的采样参数取设置中的默认值
    fn apply_defaults(&self, request: &mut AnalysisRequest) {
        request
            .model_params
            .entry("max_tokens".to_string())
            .or_insert_with(|| Value::from(self.settings.max_tokens));
        request
            .model_params
            .entry("temperature".to_string())
            .or_insert_with(|| Value::from(self.settings.temperature));
    }

    async fn analyze_until(
        &self,
        mut request: AnalysisRequest,
        options: &AnalysisOptions,
        deadline: Option<Instant>,
        mut notes: Vec<String>,
    ) -> Result<AnalysisResult, AnalysisError> {
        request.validate()?;

        // 整条链在任何网络调用之前解析完毕
        let chain = request
            .provider_chain()
            .into_iter()
            .map(|id| self.resolve(id))
            .collect::<AppResult<Vec<_>>>()
            .map_err(|e| AnalysisError::new(&e, Some(&request.provider_id), 0))?;

        let images = std::mem::take(&mut request.images);
        let (frames, shortfalls) = Self::prepare_frames(images, options)?;
        request.images = frames;
        self.apply_defaults(&mut request);

        let mut last_failure: Option<(AppError, String, u32)> = None;
        for (position, provider) in chain.iter().enumerate() {
            let provider_id = provider.capability.id.as_str();
            if position > 0 {
                info!("[Service] 切换到备用提供商 {}", provider_id);
            }

            match self.call_provider(&request, provider, deadline).await {
                Ok((mut result, payload_notes)) => {
                    notes.extend(payload_notes);
                    result.metadata.notes = notes;
                    result.metadata.shortfalls = shortfalls;
                    if let Some(rule) = &self.title_rule {
                        result.title = rule(&result);
                    }
                    return Ok(result);
                }
                Err((error, attempts)) => {
                    let kind = error.kind();
                    warn!(
                        "[Service] 提供商 {} 失败 ({} 次尝试): {}",
                        provider_id, attempts, error
                    );
                    let stop = matches!(
                        kind,
                        ErrorKind::DeadlineExceeded | ErrorKind::ConfigurationError
                    );
                    last_failure = Some((error, provider_id.to_string(), attempts));
                    if stop {
                        break;
                    }
                }
            }
        }

        let (error, provider_id, attempts) = last_failure.unwrap_or_else(|| {
            (
                AppError::config(92, "没有可用的提供商"),
                request.provider_id.clone(),
                0,
            )
        });
        Err(AnalysisError::new(&error, Some(&provider_id), attempts))
    }

    /// 在单个提供商上完成 翻译 → 调用 → 解析
    async fn call_provider(
        &self,
        request: &AnalysisRequest,
        provider: &ResolvedProvider<'_>,
        deadline: Option<Instant>,
    ) -> Result<(AnalysisResult, Vec<String>), (AppError, u32)> {
        let capability = provider.capability;
        let payload = translate(request, capability, &provider.config.model).map_err(|e| (e, 0))?;

        let schema = request.schema.as_ref();
        let frames = &payload.frames;
        let rule = request.key_frame_rule;
        let outcome = self
            .dispatcher
            .dispatch(&payload, capability, provider.config, deadline, |body| {
                parse(body, capability, schema, frames, rule)
            })
            .await;

        let log_entry = self.call_logger.as_ref().map(|_| {
            CallLogEntry::new(
                &capability.id,
                &payload.model,
                &request.prompt,
                payload.frames.len(),
                &payload.body,
            )
        });

        match outcome {
            Ok(success) => {
                let attempts = success.attempts.len() as u32;
                if let Some(entry) = log_entry {
                    self.write_log(entry.succeeded(success.value.raw_text.clone(), success.attempts))
                        .await;
                }
                let mut result = success.value;
                result.metadata.model = payload.model.clone();
                result.metadata.attempts = attempts;
                result.metadata.best_effort = payload.is_best_effort();
                Ok((result, payload.notes))
            }
            Err(failure) => {
                let attempts = failure.attempt_count();
                if let Some(entry) = log_entry {
                    self.write_log(entry.failed(&failure.error, failure.attempts))
                        .await;
                }
                Err((failure.error, attempts))
            }
        }
    }

    async fn write_log(&self, entry: CallLogEntry) {
        if let Some(logger) = &self.call_logger {
            if let Err(e) = logger.log_call(&entry).await {
                warn!("[Service] 写入调用日志失败: {}", e);
            }
        }
    }

    /// 清理过期调用日志
    pub async fn cleanup_call_logs(&self) -> AppResult<usize> {
        match &self.call_logger {
            Some(logger) => {
                logger
                    .cleanup_old_logs(self.settings.call_log_retention_days)
                    .await
            }
            None => Ok(0),
        }
    }
}
