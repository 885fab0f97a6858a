/// 调用与重试控制
///
/// 单次调用的状态机：Pending → InFlight → {Succeeded, Retryable, Fatal}。
/// 可重试的失败（超时、网络、5xx、限流、Schema 近似错误）在这里消化，
/// 只有最终结果越过模块边界。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::ai::capability::ProviderCapability;
use crate::ai::providers::wire_format;
use crate::ai::translator::ProviderPayload;
use crate::error::{AppError, AppResult, ErrorKind};
use crate::settings::ProviderConfig;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
const DEFAULT_MAX_DELAY_MS: u64 = 30000;
const DEFAULT_JITTER_FACTOR: f64 = 0.3;

/// 重试策略：指数退避 + 抖动
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0.0 - 1.0，延迟按 ±(factor * delay) 随机化
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// 只尝试一次
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
        }
    }

    /// 第 `retry` 次重试前的等待时间（从 1 开始）
    ///
    /// delay = initial_delay * 2^(retry-1)，封顶 max_delay，再叠加抖动
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_delay_ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << (retry - 1).min(16));
        let capped_delay_ms = base_delay_ms.min(self.max_delay_ms);

        let final_delay_ms = if self.jitter_factor > 0.0 && capped_delay_ms > 0 {
            let jitter_range = (capped_delay_ms as f64 * self.jitter_factor.min(1.0)) as u64;
            let jitter = rand::thread_rng().gen_range(0..=jitter_range * 2);
            capped_delay_ms
                .saturating_sub(jitter_range)
                .saturating_add(jitter)
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }

    /// 提供商给了 Retry-After 就照办，否则按退避策略
    pub fn backoff_for(&self, retry: u32, err: &AppError) -> Duration {
        err.retry_after()
            .unwrap_or_else(|| self.delay_for_retry(retry))
    }
}

/// 单次调用的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    Pending,
    InFlight,
    Succeeded,
    Retryable,
    Fatal,
}

/// 单次尝试的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    SchemaInvalid,
    HttpError { status: u16 },
    RateLimited,
    Timeout,
    NetworkError,
    AuthError,
    MalformedResponse,
    DeadlineExceeded,
    Other(ErrorKind),
}

impl AttemptOutcome {
    pub fn from_error(err: &AppError) -> Self {
        match err {
            AppError::Http(status, _) => AttemptOutcome::HttpError { status: *status },
            _ => match err.kind() {
                ErrorKind::SchemaInvalid => AttemptOutcome::SchemaInvalid,
                ErrorKind::RateLimited => AttemptOutcome::RateLimited,
                ErrorKind::Timeout => AttemptOutcome::Timeout,
                ErrorKind::NetworkError => AttemptOutcome::NetworkError,
                ErrorKind::AuthError => AttemptOutcome::AuthError,
                ErrorKind::MalformedResponse => AttemptOutcome::MalformedResponse,
                ErrorKind::DeadlineExceeded => AttemptOutcome::DeadlineExceeded,
                other => AttemptOutcome::Other(other),
            },
        }
    }
}

/// 一次尝试的记录，只用于重试记账和诊断，不持久化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub provider_id: String,
    /// 从 1 开始
    pub attempt: u32,
    pub start_time: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: AttemptOutcome,
    pub state: CallState,
}

/// 发往提供商的 HTTP 请求
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// 提供商的 HTTP 响应
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 网络传输层
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发送一次请求；连接失败、超时返回 Err，非 2xx 仍然是 Ok
    async fn post(&self, request: HttpRequest) -> AppResult<HttpResponse>;
}

/// 基于 reqwest 的传输层
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::network(1, format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }
}

/// 解析 Retry-After（秒）或 retry-after-ms 头
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
    {
        return Some(Duration::from_millis(ms.max(0.0) as u64));
    }
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| Duration::from_millis((secs.max(0.0) * 1000.0) as u64))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: HttpRequest) -> AppResult<HttpResponse> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// 成功的调用
#[derive(Debug)]
pub struct DispatchSuccess<T> {
    pub value: T,
    pub attempts: Vec<CallAttempt>,
}

/// 最终失败的调用
#[derive(Debug)]
pub struct DispatchFailure {
    pub error: AppError,
    pub attempts: Vec<CallAttempt>,
}

impl DispatchFailure {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// 调用控制器
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 构建 HTTP 请求，密钥只在这里取出
    pub fn build_request(payload: &ProviderPayload, provider: &ProviderConfig) -> HttpRequest {
        let format = wire_format(payload.api_format);
        HttpRequest {
            url: format.endpoint(&provider.api_base_url, &payload.model),
            headers: format.auth_headers(provider.api_key.expose_secret()),
            body: payload.body.clone(),
        }
    }

    /// 执行调用，失败按策略重试
    ///
    /// `handle` 处理 2xx 响应体（解析 + 校验）；它返回的 SchemaInvalid 与传输失败共用重试次数。
    pub async fn dispatch<T, F>(
        &self,
        payload: &ProviderPayload,
        capability: &ProviderCapability,
        provider: &ProviderConfig,
        deadline: Option<Instant>,
        mut handle: F,
    ) -> Result<DispatchSuccess<T>, DispatchFailure>
    where
        F: FnMut(&str) -> AppResult<T>,
    {
        let request = Self::build_request(payload, provider);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts: Vec<CallAttempt> = Vec::new();
        let mut state = CallState::Pending;

        for attempt in 1..=max_attempts {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let error = AppError::deadline(format!(
                        "提供商 {} 在第 {} 次尝试前已超过截止时间",
                        capability.id, attempt
                    ));
                    return Err(DispatchFailure { error, attempts });
                }
            }

            debug!(
                "[Dispatch] {} 状态 {:?} → InFlight (第 {}/{} 次)",
                capability.id, state, attempt, max_attempts
            );
            let start_time = Utc::now();
            let started = Instant::now();

            let result = self.send_once(request.clone(), deadline).await;
            let result = result.and_then(|response| {
                if response.is_success() {
                    handle(&response.body)
                } else {
                    Err(AppError::from_status(
                        response.status,
                        &response.body,
                        response.retry_after,
                    ))
                }
            });

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(value) => {
                    attempts.push(CallAttempt {
                        provider_id: capability.id.clone(),
                        attempt,
                        start_time,
                        elapsed_ms,
                        outcome: AttemptOutcome::Success,
                        state: CallState::Succeeded,
                    });
                    info!(
                        "[Dispatch] {} 调用成功 (第 {} 次, {} ms)",
                        capability.id, attempt, elapsed_ms
                    );
                    return Ok(DispatchSuccess { value, attempts });
                }
                Err(error) => {
                    state = if error.is_retryable() {
                        CallState::Retryable
                    } else {
                        CallState::Fatal
                    };
                    attempts.push(CallAttempt {
                        provider_id: capability.id.clone(),
                        attempt,
                        start_time,
                        elapsed_ms,
                        outcome: AttemptOutcome::from_error(&error),
                        state,
                    });

                    if state == CallState::Fatal {
                        warn!("[Dispatch] {} 不可重试的失败: {}", capability.id, error);
                        return Err(DispatchFailure { error, attempts });
                    }
                    if attempt == max_attempts {
                        warn!(
                            "[Dispatch] {} 重试 {} 次后仍失败: {}",
                            capability.id, attempt, error
                        );
                        return Err(DispatchFailure { error, attempts });
                    }

                    let delay = self.policy.backoff_for(attempt, &error);
                    if let Some(deadline) = deadline {
                        if Instant::now() + delay >= deadline {
                            let error = AppError::deadline(format!(
                                "等待重试会超过截止时间，最后一次失败: {}",
                                error
                            ));
                            return Err(DispatchFailure { error, attempts });
                        }
                    }
                    warn!(
                        "[Dispatch] {} 第 {} 次失败 ({})，{} ms 后重试",
                        capability.id,
                        attempt,
                        error,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // max_attempts >= 1，循环内一定已经返回
        Err(DispatchFailure {
            error: AppError::Unknown("重试循环异常结束".to_string()),
            attempts,
        })
    }

    async fn send_once(
        &self,
        request: HttpRequest,
        deadline: Option<Instant>,
    ) -> AppResult<HttpResponse> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.transport.post(request))
                .await
                .map_err(|_| AppError::deadline("调用在截止时间前未完成"))?,
            None => self.transport.post(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::capability::CapabilityTable;
    use crate::ai::request::AnalysisRequest;
    use crate::ai::translator::translate;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 按脚本依次返回响应的传输层
    struct ScriptedTransport {
        script: Mutex<VecDeque<AppResult<HttpResponse>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<AppResult<HttpResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post(&self, request: HttpRequest) -> AppResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::status(500, "script exhausted")))
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
        }
    }

    fn setup() -> (ProviderPayload, ProviderCapability, ProviderConfig) {
        let capability = CapabilityTable::builtin().get("openai").unwrap().clone();
        let payload = translate(&AnalysisRequest::new("openai", "hello"), &capability, "gpt-4o-mini")
            .unwrap();
        let provider = ProviderConfig::new("openai", "https://api.openai.com", "sk-test", "gpt-4o-mini");
        (payload, capability, provider)
    }

    fn echo(body: &str) -> AppResult<String> {
        Ok(body.to_string())
    }

    #[test]
    fn test_delay_for_retry() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            jitter_factor: 0.0,
        };
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for_retry(1).as_millis();
            assert!((700..=1300).contains(&delay), "{}", delay);
        }
    }

    #[test]
    fn test_backoff_honors_retry_after() {
        let policy = fast_policy(3);
        let err = AppError::rate_limited(Some(Duration::from_secs(7)), "slow down");
        assert_eq!(policy.backoff_for(1, &err), Duration::from_secs(7));
        let err = AppError::rate_limited(None, "slow down");
        assert_eq!(policy.backoff_for(1, &err), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_retries_5xx_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::status(503, "busy")),
            Ok(HttpResponse::status(502, "bad gateway")),
            Ok(HttpResponse::ok("done")),
        ]);
        let dispatcher = Dispatcher::new(transport.clone(), fast_policy(3));
        let (payload, capability, provider) = setup();

        let success = dispatcher
            .dispatch(&payload, &capability, &provider, None, echo)
            .await
            .unwrap();

        assert_eq!(success.value, "done");
        assert_eq!(success.attempts.len(), 3);
        assert_eq!(success.attempts[0].outcome, AttemptOutcome::HttpError { status: 503 });
        assert_eq!(success.attempts[0].state, CallState::Retryable);
        assert_eq!(success.attempts[2].state, CallState::Succeeded);
        assert_eq!(transport.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::status(503, "busy")),
            Ok(HttpResponse::status(503, "busy")),
            Ok(HttpResponse::ok("too late")),
        ]);
        let dispatcher = Dispatcher::new(transport, fast_policy(2));
        let (payload, capability, provider) = setup();

        let failure = dispatcher
            .dispatch(&payload, &capability, &provider, None, echo)
            .await
            .unwrap_err();

        assert_eq!(failure.attempt_count(), 2);
        assert_eq!(failure.error.kind(), ErrorKind::HttpError);
        assert_eq!(failure.attempts[1].state, CallState::Retryable);
    }

    #[tokio::test]
    async fn test_auth_error_is_fatal() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::status(401, "invalid key")),
            Ok(HttpResponse::ok("never reached")),
        ]);
        let dispatcher = Dispatcher::new(transport.clone(), fast_policy(3));
        let (payload, capability, provider) = setup();

        let failure = dispatcher
            .dispatch(&payload, &capability, &provider, None, echo)
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind(), ErrorKind::AuthError);
        assert_eq!(failure.attempt_count(), 1);
        assert_eq!(failure.attempts[0].state, CallState::Fatal);
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::status(400, "bad request"))]);
        let dispatcher = Dispatcher::new(transport, fast_policy(3));
        let (payload, capability, provider) = setup();

        let failure = dispatcher
            .dispatch(&payload, &capability, &provider, None, echo)
            .await
            .unwrap_err();
        assert_eq!(failure.attempts[0].outcome, AttemptOutcome::HttpError { status: 400 });
        assert_eq!(failure.attempt_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_and_rate_limit_are_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(AppError::timeout("请求超时")),
            Ok(HttpResponse {
                status: 429,
                retry_after: Some(Duration::from_millis(1)),
                body: "slow down".into(),
            }),
            Ok(HttpResponse::ok("done")),
        ]);
        let dispatcher = Dispatcher::new(transport, fast_policy(3));
        let (payload, capability, provider) = setup();

        let success = dispatcher
            .dispatch(&payload, &capability, &provider, None, echo)
            .await
            .unwrap();
        assert_eq!(success.attempts[0].outcome, AttemptOutcome::Timeout);
        assert_eq!(success.attempts[1].outcome, AttemptOutcome::RateLimited);
        assert_eq!(success.attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_handler_schema_invalid_consumes_budget() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::ok("bad")),
            Ok(HttpResponse::ok("good")),
        ]);
        let dispatcher = Dispatcher::new(transport, fast_policy(3));
        let (payload, capability, provider) = setup();

        let success = dispatcher
            .dispatch(&payload, &capability, &provider, None, |body| {
                if body == "good" {
                    Ok(body.len())
                } else {
                    Err(AppError::schema_invalid(1, "near miss"))
                }
            })
            .await
            .unwrap();
        assert_eq!(success.value, 4);
        assert_eq!(success.attempts[0].outcome, AttemptOutcome::SchemaInvalid);
    }

    #[tokio::test]
    async fn test_deadline_blocks_backoff() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::status(503, "busy"))]);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
        };
        let dispatcher = Dispatcher::new(transport, policy);
        let (payload, capability, provider) = setup();
        let deadline = Instant::now() + Duration::from_secs(1);

        let failure = dispatcher
            .dispatch(&payload, &capability, &provider, Some(deadline), echo)
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::DeadlineExceeded);
        assert!(failure.error.to_string().contains("503"));
        assert_eq!(failure.attempt_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_sends_nothing() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::ok("x"))]);
        let dispatcher = Dispatcher::new(transport.clone(), fast_policy(3));
        let (payload, capability, provider) = setup();

        let failure = dispatcher
            .dispatch(&payload, &capability, &provider, Some(Instant::now()), echo)
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::DeadlineExceeded);
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_build_request_headers() {
        let (payload, _, provider) = setup();
        let request = Dispatcher::build_request(&payload, &provider);
        assert_eq!(request.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            request.headers,
            vec![("Authorization".to_string(), "Bearer sk-test".to_string())]
        );
    }
}
