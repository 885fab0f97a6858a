/// 多摄像头帧选择引擎
///
/// 在总预算内从多个摄像头的候选帧中选出一个有序子集，保证每个摄像头的最低配额。
/// 纯同步计算，不需要任何锁；相同输入永远得到相同输出。

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::error::{AppError, AppResult};

/// 帧数据（字节、已编码的 base64 或磁盘句柄）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ImageData {
    Bytes(Vec<u8>),
    Base64(String),
    Path(PathBuf),
}

impl ImageData {
    /// 转换为 base64 字符串，磁盘句柄在这里才读取
    pub fn to_base64(&self) -> AppResult<String> {
        match self {
            ImageData::Bytes(bytes) => Ok(BASE64.encode(bytes)),
            ImageData::Base64(encoded) => Ok(encoded.clone()),
            ImageData::Path(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    AppError::io(10, format!("读取帧文件失败 {}: {}", path.display(), e))
                })?;
                Ok(BASE64.encode(bytes))
            }
        }
    }
}

/// 候选帧引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    /// 来源摄像头 ID
    pub source_camera_id: String,

    /// 采集时间 (UTC)
    pub timestamp: DateTime<Utc>,

    /// 帧数据
    pub data: ImageData,

    /// 质量分，越高越好
    pub quality_score: f64,

    /// MIME 类型
    #[serde(default = "default_media_type")]
    pub media_type: String,
}

fn default_media_type() -> String {
    "image/jpeg".to_string()
}

impl ImageRef {
    pub fn new(
        source_camera_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: ImageData,
        quality_score: f64,
    ) -> Self {
        Self {
            source_camera_id: source_camera_id.into(),
            timestamp,
            data,
            quality_score,
            media_type: default_media_type(),
        }
    }

    /// 设置 MIME 类型（builder 模式）
    pub fn with_media_type(self, media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            ..self
        }
    }

    /// NaN 质量分按最低处理
    pub(crate) fn rank_score(&self) -> f64 {
        if self.quality_score.is_nan() {
            f64::NEG_INFINITY
        } else {
            self.quality_score
        }
    }
}

/// 单个摄像头的最低帧数配额
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameQuota {
    pub camera_id: String,
    pub minimum_count: usize,
}

impl FrameQuota {
    pub fn new(camera_id: impl Into<String>, minimum_count: usize) -> Self {
        Self {
            camera_id: camera_id.into(),
            minimum_count,
        }
    }

    /// 为每个摄像头生成相同的最低配额
    pub fn uniform<I, S>(camera_ids: I, minimum_count: usize) -> Vec<FrameQuota>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        camera_ids
            .into_iter()
            .map(|id| FrameQuota::new(id, minimum_count))
            .collect()
    }
}

/// 覆盖不足记录（非致命）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageShortfall {
    pub camera_id: String,
    pub required: usize,
    pub available: usize,
}

/// 选择结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionOutcome {
    /// 按时间升序排列的选中帧
    pub frames: Vec<ImageRef>,

    /// 配额未满足的摄像头
    pub shortfalls: Vec<CoverageShortfall>,

    /// 每个摄像头最终贡献的帧数
    pub per_camera: BTreeMap<String, usize>,
}

/// 验证配额集合
pub fn validate_quotas(quotas: &[FrameQuota], total_budget: usize) -> AppResult<()> {
    let mut seen = HashSet::new();
    for quota in quotas {
        if !seen.insert(quota.camera_id.as_str()) {
            return Err(AppError::config(
                2,
                format!("摄像头 '{}' 的配额重复声明", quota.camera_id),
            ));
        }
    }

    let required: usize = quotas.iter().map(|q| q.minimum_count).sum();
    if required > total_budget {
        return Err(AppError::config(
            1,
            format!("配额总和 {} 超过总预算 {}", required, total_budget),
        ));
    }
    Ok(())
}

/// 质量分降序，同分时更新的帧优先，最后按原始位置保证全序
fn by_rank(candidates: &[ImageRef]) -> impl Fn(&usize, &usize) -> Ordering + '_ {
    move |a: &usize, b: &usize| {
        let (fa, fb) = (&candidates[*a], &candidates[*b]);
        fb.rank_score()
            .total_cmp(&fa.rank_score())
            .then_with(|| fb.timestamp.cmp(&fa.timestamp))
            .then_with(|| a.cmp(b))
    }
}

/// 选择帧
///
/// 1. 按摄像头分组
/// 2. 先为每个有配额的摄像头取前 `minimum_count` 帧
/// 3. 剩余预算从全体候选中按质量补齐
/// 4. 输出按时间升序
pub fn select(
    candidates: Vec<ImageRef>,
    quotas: &[FrameQuota],
    total_budget: usize,
) -> AppResult<SelectionOutcome> {
    validate_quotas(quotas, total_budget)?;

    if total_budget == 0 || candidates.is_empty() {
        let shortfalls = quotas
            .iter()
            .filter(|q| q.minimum_count > 0)
            .map(|q| CoverageShortfall {
                camera_id: q.camera_id.clone(),
                required: q.minimum_count,
                available: 0,
            })
            .collect();
        return Ok(SelectionOutcome {
            shortfalls,
            ..Default::default()
        });
    }

    let mut by_camera: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, frame) in candidates.iter().enumerate() {
        by_camera
            .entry(frame.source_camera_id.as_str())
            .or_default()
            .push(index);
    }

    let mut chosen: Vec<usize> = Vec::with_capacity(total_budget.min(candidates.len()));
    let mut taken = vec![false; candidates.len()];
    let mut shortfalls = Vec::new();

    for quota in quotas.iter().filter(|q| q.minimum_count > 0) {
        let mut pool = by_camera
            .get(quota.camera_id.as_str())
            .cloned()
            .unwrap_or_default();
        pool.sort_by(by_rank(&candidates));

        if pool.len() < quota.minimum_count {
            warn!(
                "[FrameSelection] 摄像头 {} 仅有 {} 帧，低于配额 {}",
                quota.camera_id,
                pool.len(),
                quota.minimum_count
            );
            shortfalls.push(CoverageShortfall {
                camera_id: quota.camera_id.clone(),
                required: quota.minimum_count,
                available: pool.len(),
            });
        }

        for index in pool.into_iter().take(quota.minimum_count) {
            taken[index] = true;
            chosen.push(index);
        }
    }

    let remaining = total_budget.saturating_sub(chosen.len());
    if remaining > 0 {
        let mut rest: Vec<usize> = (0..candidates.len()).filter(|i| !taken[*i]).collect();
        rest.sort_by(by_rank(&candidates));
        chosen.extend(rest.into_iter().take(remaining));
    }

    chosen.sort_by(|&a, &b| {
        let (fa, fb) = (&candidates[a], &candidates[b]);
        fa.timestamp
            .cmp(&fb.timestamp)
            .then_with(|| fa.source_camera_id.cmp(&fb.source_camera_id))
            .then_with(|| a.cmp(&b))
    });

    let mut slots: Vec<Option<ImageRef>> = candidates.into_iter().map(Some).collect();
    let frames: Vec<ImageRef> = chosen
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect();

    let mut per_camera = BTreeMap::new();
    for frame in &frames {
        *per_camera.entry(frame.source_camera_id.clone()).or_insert(0) += 1;
    }

    debug!(
        "[FrameSelection] 选中 {} 帧 (预算 {}), 分布 {:?}",
        frames.len(),
        total_budget,
        per_camera
    );

    Ok(SelectionOutcome {
        frames,
        shortfalls,
        per_camera,
    })
}
