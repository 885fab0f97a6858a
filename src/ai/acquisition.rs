/// 帧采集
///
/// 多个摄像头并发采集候选帧，同时运行的采集数受 worker 上限约束。
/// 截止时间到达时停止等待，已经完成的摄像头结果仍然可以参与帧选择。

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::ai::frame_selection::ImageRef;
use crate::error::AppResult;

/// 单个摄像头的帧来源
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// 摄像头 ID
    fn camera_id(&self) -> &str;

    /// 采集候选帧
    async fn fetch_frames(&self) -> AppResult<Vec<ImageRef>>;
}

/// 内存中已有帧的来源
pub struct StaticFrameSource {
    camera_id: String,
    frames: Vec<ImageRef>,
}

impl StaticFrameSource {
    pub fn new(camera_id: impl Into<String>, frames: Vec<ImageRef>) -> Self {
        Self {
            camera_id: camera_id.into(),
            frames,
        }
    }
}

#[async_trait]
impl FrameSource for StaticFrameSource {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    async fn fetch_frames(&self) -> AppResult<Vec<ImageRef>> {
        Ok(self.frames.clone())
    }
}

/// 采集失败的摄像头
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub camera_id: String,
    pub message: String,
}

/// 采集结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatherOutcome {
    /// 按摄像头、时间排序的候选帧，与完成顺序无关
    pub candidates: Vec<ImageRef>,
    pub failures: Vec<SourceFailure>,
    /// 截止时间到达时仍未完成的摄像头
    pub timed_out: Vec<String>,
}

impl GatherOutcome {
    /// 给结果附带的提示
    pub fn notes(&self) -> Vec<String> {
        let mut notes: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("摄像头 {} 采集失败: {}", f.camera_id, f.message))
            .collect();
        notes.extend(
            self.timed_out
                .iter()
                .map(|id| format!("摄像头 {} 在截止时间前未完成采集", id)),
        );
        notes
    }
}

/// 并发采集所有来源
pub async fn gather_frames(
    sources: Vec<Arc<dyn FrameSource>>,
    worker_limit: usize,
    deadline: Option<Instant>,
) -> GatherOutcome {
    let semaphore = Arc::new(Semaphore::new(worker_limit.max(1)));
    let mut pending: BTreeSet<String> = BTreeSet::new();
    let mut tasks = JoinSet::new();

    for source in sources {
        let camera_id = source.camera_id().to_string();
        pending.insert(camera_id.clone());
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => source.fetch_frames().await,
                Err(_) => Ok(Vec::new()),
            };
            (camera_id, result)
        });
    }

    let mut outcome = GatherOutcome::default();
    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        "[Acquisition] 截止时间已到，{} 个摄像头未完成采集",
                        pending.len()
                    );
                    tasks.abort_all();
                    break;
                }
            },
            None => tasks.join_next().await,
        };

        let Some(joined) = next else {
            break;
        };
        match joined {
            Ok((camera_id, Ok(frames))) => {
                debug!("[Acquisition] 摄像头 {} 采集到 {} 帧", camera_id, frames.len());
                pending.remove(&camera_id);
                outcome.candidates.extend(frames);
            }
            Ok((camera_id, Err(e))) => {
                warn!("[Acquisition] 摄像头 {} 采集失败: {}", camera_id, e);
                pending.remove(&camera_id);
                outcome.failures.push(SourceFailure {
                    camera_id,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                // 任务 panic 时拿不到摄像头 ID，留在 pending 中按未完成处理
                warn!("[Acquisition] 采集任务异常退出: {}", e);
            }
        }
    }

    outcome.timed_out = pending.into_iter().collect();
    outcome.failures.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
    outcome.candidates.sort_by(|a, b| {
        a.source_camera_id
            .cmp(&b.source_camera_id)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    outcome
}
