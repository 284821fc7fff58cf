//! 主机任务错误分类

use std::io;
use thiserror::Error;

/// 单个主机任务中可能出现的错误
#[derive(Debug, Error)]
pub enum TaskError {
    /// 会话建立失败，不会执行任何命令或传输
    #[error("{host} ssh connect error: {reason}")]
    Connection { host: String, reason: String },

    /// 远程命令的错误输出非空
    #[error("remote command failed on {host}: {stderr}")]
    RemoteCommand { host: String, stderr: String },

    /// 单个文件复制失败，对该主机任务始终是致命的
    #[error("transfer {path} failed: {source}")]
    Transfer {
        path: String,
        #[source]
        source: io::Error,
    },

    /// 需要目录的位置已经是普通文件
    #[error("{path} is file")]
    PathConflict { path: String },

    /// 本地文件系统访问失败
    #[error("local {path}: {source}")]
    LocalIo {
        path: String,
        #[source]
        source: io::Error,
    },

    /// 远程路径查询失败（不包括“不存在”）
    #[error("remote {path}: {source}")]
    RemoteIo {
        path: String,
        #[source]
        source: io::Error,
    },

    /// 传输源不存在
    #[error("{path} is not exist")]
    SourceMissing { path: String },
}

impl TaskError {
    /// 是否可以在 `--skip-err` 下继续处理其他主机
    ///
    /// 只有命令执行阶段的错误（连接、远程命令）受 `skip_err` 影响，
    /// 传输相关的错误始终会触发取消标志。
    pub fn is_recoverable(&self, skip_err: bool) -> bool {
        skip_err
            && matches!(
                self,
                TaskError::RemoteCommand { .. } | TaskError::Connection { .. }
            )
    }

    pub(crate) fn local(path: impl Into<String>, source: io::Error) -> Self {
        TaskError::LocalIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn remote(path: impl Into<String>, source: io::Error) -> Self {
        TaskError::RemoteIo {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_err_only_covers_command_phase() {
        let cmd = TaskError::RemoteCommand {
            host: "web1".into(),
            stderr: "boom".into(),
        };
        let conn = TaskError::Connection {
            host: "web1".into(),
            reason: "refused".into(),
        };
        let transfer = TaskError::Transfer {
            path: "/tmp/a".into(),
            source: io::Error::new(io::ErrorKind::Other, "eof"),
        };

        assert!(cmd.is_recoverable(true));
        assert!(conn.is_recoverable(true));
        assert!(!transfer.is_recoverable(true));
        assert!(!cmd.is_recoverable(false));
        assert!(!TaskError::PathConflict { path: "/b".into() }.is_recoverable(true));
    }
}
