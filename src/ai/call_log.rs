/// 调用日志
///
/// 每次提供商调用写一个 JSON 文件，包含请求体（图片数据截断）、结果和尝试记录。
/// 写日志失败只记警告，不影响分析结果。

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::ai::dispatch::CallAttempt;
use crate::error::{AppError, AppResult};

/// 日志里保留的 base64 前缀长度
const KEEP_CHARS: usize = 100;

/// 调用结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLogResponse {
    pub success: bool,
    pub error: Option<String>,
    pub raw_text: Option<String>,
}

/// 单条调用日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub provider_id: String,
    pub model: String,
    pub prompt: String,
    pub image_count: usize,
    /// 已截断图片数据的请求体
    pub request_payload: Value,
    pub response: CallLogResponse,
    pub attempts: Vec<CallAttempt>,
}

impl CallLogEntry {
    pub fn new(
        provider_id: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
        image_count: usize,
        request_payload: &Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            provider_id: provider_id.into(),
            model: model.into(),
            prompt: prompt.into(),
            image_count,
            request_payload: sanitize_payload(request_payload),
            response: CallLogResponse {
                success: false,
                error: None,
                raw_text: None,
            },
            attempts: Vec::new(),
        }
    }

    pub fn succeeded(mut self, raw_text: impl Into<String>, attempts: Vec<CallAttempt>) -> Self {
        self.response = CallLogResponse {
            success: true,
            error: None,
            raw_text: Some(raw_text.into()),
        };
        self.attempts = attempts;
        self
    }

    pub fn failed(mut self, error: &AppError, attempts: Vec<CallAttempt>) -> Self {
        self.response = CallLogResponse {
            success: false,
            error: Some(error.to_string()),
            raw_text: None,
        };
        self.attempts = attempts;
        self
    }

    fn file_name(&self) -> String {
        let simple = self.id.simple().to_string();
        format!(
            "llm_call_{}_{}.json",
            self.timestamp.format("%Y%m%d_%H%M%S_%3f"),
            &simple[..8]
        )
    }
}

fn truncate_base64(data: &str) -> String {
    let head: String = data.chars().take(KEEP_CHARS).collect();
    format!(
        "{}... (truncated, original length: {} chars)",
        head,
        data.chars().count()
    )
}

fn sanitize_string(key: Option<&str>, text: &str) -> Value {
    if let Some(pos) = text.find("base64,") {
        if text.starts_with("data:") {
            let (prefix, data) = text.split_at(pos + "base64,".len());
            return Value::String(format!("{}{}", prefix, truncate_base64(data)));
        }
    }
    let is_image_field = matches!(key, Some("data") | Some("images"));
    if is_image_field && text.chars().count() > KEEP_CHARS {
        return Value::String(truncate_base64(text));
    }
    Value::String(text.to_string())
}

fn sanitize_value(key: Option<&str>, value: &Value) -> Value {
    match value {
        Value::String(text) => sanitize_string(key, text),
        Value::Array(items) => Value::Array(items.iter().map(|v| sanitize_value(key, v)).collect()),
        Value::Object(map) => {
            let sanitized: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sanitize_value(Some(k.as_str()), v)))
                .collect();
            Value::Object(sanitized)
        }
        other => other.clone(),
    }
}

/// 截断请求体中的图片数据：data URL、Anthropic/Gemini 的 `data` 字段、Ollama 的 `images` 数组
pub fn sanitize_payload(payload: &Value) -> Value {
    sanitize_value(None, payload)
}

/// 调用日志写入器
pub struct CallLogger {
    logs_dir: PathBuf,
}

impl CallLogger {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// 写入一条日志，返回文件路径
    pub async fn log_call(&self, entry: &CallLogEntry) -> AppResult<PathBuf> {
        tokio::fs::create_dir_all(&self.logs_dir).await?;

        let path = self.logs_dir.join(entry.file_name());
        let content = serde_json::to_string_pretty(entry)?;
        tokio::fs::write(&path, content).await?;

        debug!("[CallLog] 调用日志已写入: {}", path.display());
        Ok(path)
    }

    /// 删除超过保留天数的日志，返回删除数量
    pub async fn cleanup_old_logs(&self, days_to_keep: u32) -> AppResult<usize> {
        if !tokio::fs::try_exists(&self.logs_dir).await.unwrap_or(false) {
            return Ok(0);
        }

        let retention = Duration::from_secs(u64::from(days_to_keep) * 24 * 60 * 60);
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.logs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if modified < cutoff {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("[CallLog] 清理了 {} 个过期日志", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn long_data() -> String {
        "A".repeat(500)
    }

    #[test]
    fn test_sanitize_data_url() {
        let payload = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "describe"},
                {"type": "image_url", "image_url": {"url": format!("data:image/jpeg;base64,{}", long_data())}}
            ]}]
        });

        let sanitized = sanitize_payload(&payload);
        let url = sanitized["messages"][0]["content"][1]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with(&format!("data:image/jpeg;base64,{}...", "A".repeat(100))));
        assert!(url.ends_with("(truncated, original length: 500 chars)"));
        assert_eq!(sanitized["messages"][0]["content"][0]["text"], "describe");
        assert_eq!(sanitized["model"], "gpt-4o");
    }

    #[test]
    fn test_sanitize_other_dialects() {
        let payload = json!({
            "messages": [{"role": "user", "content": "p", "images": [long_data()]}],
            "contents": [{"parts": [{"inline_data": {"mime_type": "image/jpeg", "data": long_data()}}]}],
        });

        let sanitized = sanitize_payload(&payload);
        let ollama = sanitized["messages"][0]["images"][0].as_str().unwrap();
        assert!(ollama.contains("original length: 500"));
        let gemini = sanitized["contents"][0]["parts"][0]["inline_data"]["data"].as_str().unwrap();
        assert!(gemini.contains("original length: 500"));
        assert_eq!(sanitized["messages"][0]["content"], "p");
    }

    #[tokio::test]
    async fn test_log_call_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CallLogger::new(dir.path().join("logs"));

        let entry = CallLogEntry::new("openai", "gpt-4o", "describe", 1, &json!({"images": [long_data()]}))
            .succeeded("{\"a\":1}", Vec::new());
        let path = logger.log_call(&entry).await.unwrap();

        let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(file_name.starts_with("llm_call_"));
        assert!(file_name.ends_with(".json"));

        let written: CallLogEntry =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, entry);
        assert!(written.response.success);
        assert!(!written.request_payload.to_string().contains(&long_data()));
    }

    #[tokio::test]
    async fn test_cleanup_old_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CallLogger::new(dir.path());

        let old = dir.path().join("llm_call_old.json");
        let fresh = dir.path().join("llm_call_fresh.json");
        let other = dir.path().join("notes.txt");
        for path in [&old, &fresh, &other] {
            std::fs::write(path, "{}").unwrap();
        }
        let ten_days_ago = SystemTime::now() - Duration::from_secs(10 * 24 * 60 * 60);
        for path in [&old, &other] {
            std::fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(ten_days_ago)
                .unwrap();
        }

        let removed = logger.cleanup_old_logs(7).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn test_cleanup_missing_dir() {
        let logger = CallLogger::new("/nonexistent/llmvision/logs");
        assert_eq!(logger.cleanup_old_logs(7).await.unwrap(), 0);
    }
}
