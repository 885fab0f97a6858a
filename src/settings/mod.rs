/// 设置管理模块
///
/// 从 YAML 或 JSON 文件加载核心设置，校验后以只读快照的形式对外提供

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Arc, RwLock};

pub mod config;
pub use config::{CoreSettings, ProviderConfig};

/// 设置管理器
pub struct SettingsManager {
    settings: RwLock<Arc<CoreSettings>>,
}

impl SettingsManager {
    /// 使用默认设置
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(Arc::new(CoreSettings::default())),
        }
    }

    /// 使用给定设置，先校验
    pub fn with_settings(settings: CoreSettings) -> Result<Self> {
        settings.validate().context("设置校验失败")?;
        Ok(Self {
            settings: RwLock::new(Arc::new(settings)),
        })
    }

    /// 从文件加载，按扩展名区分 YAML / JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let settings = if is_json {
            Self::parse_json(&text)
        } else {
            Self::parse_yaml(&text)
        }
        .with_context(|| format!("解析配置文件失败: {}", path.display()))?;

        log::info!(
            "[Settings] 已加载 {} ({} 个提供商)",
            path.display(),
            settings.providers.len()
        );
        Self::with_settings(settings)
    }

    pub fn parse_yaml(text: &str) -> Result<CoreSettings> {
        serde_yaml::from_str(text).context("YAML 格式错误")
    }

    pub fn parse_json(text: &str) -> Result<CoreSettings> {
        serde_json::from_str(text).context("JSON 格式错误")
    }

    /// 获取当前设置的快照
    pub fn get(&self) -> Arc<CoreSettings> {
        match self.settings.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// 更新设置，校验失败时保持原设置
    pub fn update(&self, new_settings: CoreSettings) -> Result<()> {
        new_settings.validate().context("设置校验失败")?;
        let mut guard = match self.settings.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(new_settings);
        Ok(())
    }
}

impl Default for SettingsManager {
    fn default() -> Self {
        Self::new()
    }
}
