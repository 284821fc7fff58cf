//! 日志模块
//!
//! 诊断日志写到 stderr，标准输出只留给主机结果；可选再写一份按天轮转的文件日志。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 是否同时写入日志文件
    #[serde(default)]
    pub file: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
            file: false,
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置，读取失败时使用默认值
    pub fn load(config_dir: &Path) -> Self {
        crate::config::read_section(config_dir, "log")
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// `-v` 提升到 debug，`-vv` 及以上提升到 trace
    pub fn effective_level(&self, verbose: u8) -> &str {
        match verbose {
            0 => match self.level.to_lowercase().as_str() {
                "error" => "error",
                "info" => "info",
                "debug" => "debug",
                "trace" => "trace",
                _ => "warn",
            },
            1 => "debug",
            _ => "trace",
        }
    }
}

/// 日志文件目录
pub fn log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}

/// 初始化日志系统
///
/// 返回的 guard 必须持有到进程结束，否则文件日志可能丢失尾部内容。
pub fn init_logging(config: &LogConfig, verbose: u8, config_dir: &Path) -> Option<WorkerGuard> {
    if !config.enabled && verbose == 0 {
        return None;
    }

    // RUST_LOG 优先
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.effective_level(verbose)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let mut guard = None;
    let file_layer = if config.file {
        let dir = log_dir(config_dir);
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(&dir, "fleetsync.log");
                let (writer, worker_guard) = tracing_appender::non_blocking(appender);
                guard = Some(worker_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(false),
                )
            }
            Err(e) => {
                eprintln!("无法创建日志目录 {}: {}", dir.display(), e);
                None
            }
        }
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_and_section() {
        let dir = TempDir::new().unwrap();
        assert_eq!(LogConfig::load(dir.path()), LogConfig::default());

        fs::write(
            dir.path().join("config.json"),
            r#"{"log": {"level": "INFO", "file": true}}"#,
        )
        .unwrap();
        let config = LogConfig::load(dir.path());
        assert!(config.enabled);
        assert!(config.file);
        assert_eq!(config.effective_level(0), "info");
    }

    #[test]
    fn test_malformed_config_falls_back() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.json"), "[1, 2").unwrap();
        assert_eq!(LogConfig::load(dir.path()), LogConfig::default());
    }

    #[test]
    fn test_verbosity_raises_level() {
        let config = LogConfig::default();
        assert_eq!(config.effective_level(0), "warn");
        assert_eq!(config.effective_level(1), "debug");
        assert_eq!(config.effective_level(3), "trace");
    }
}
