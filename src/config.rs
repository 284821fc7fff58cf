//! 应用配置模块
//!
//! 配置目录下的 `config.json` 按节存放配置，每个模块读取自己的节，
//! 文件或字段缺失时使用默认值。

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "fleetsync";

/// 应用配置目录
pub fn config_dir() -> PathBuf {
    let base = if cfg!(target_os = "windows") {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    } else if cfg!(target_os = "macos") {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
    } else {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    };
    base.map(|p| p.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".fleetsync"))
}

/// 默认的主机清单路径
pub fn default_registry_path() -> PathBuf {
    config_dir().join("hosts.yml")
}

/// 读取 `config.json` 中的一节，文件或该节不存在时返回 `None`
pub(crate) fn read_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> anyhow::Result<Option<T>> {
    let config_file = config_dir.join("config.json");
    if !config_file.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&config_file)
        .with_context(|| format!("读取配置文件失败: {}", config_file.display()))?;
    let config: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("解析配置文件失败: {}", config_file.display()))?;
    match config.get(key) {
        Some(section) => serde_json::from_value(section.clone())
            .map(Some)
            .with_context(|| format!("配置节 \"{}\" 格式错误", key)),
        None => Ok(None),
    }
}

/// SSH 会话配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// 建立连接（TCP + 握手 + 认证）的超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 连接建立后单次阻塞操作的超时（秒），0 表示不限时
    #[serde(default)]
    pub io_timeout_secs: u64,
    /// 连接失败后的额外重试次数
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// 重试间隔基数（毫秒），第 n 次重试前等待 base * 2^n
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_connect_retries() -> u32 {
    2
}

fn default_retry_base_delay() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: 0,
            connect_retries: default_connect_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

impl SessionConfig {
    /// 从配置文件加载会话配置
    pub fn load(config_dir: &Path) -> anyhow::Result<Self> {
        Ok(read_section(config_dir, "session")?.unwrap_or_default())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// ssh2 的超时参数，毫秒
    pub fn io_timeout_ms(&self) -> u32 {
        self.io_timeout_secs
            .saturating_mul(1000)
            .min(u32::MAX as u64) as u32
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}
