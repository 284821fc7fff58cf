//! 远程会话
//!
//! 一个 [`RemoteSession`] 对应一台主机上的一条已认证连接，提供命令执行和
//! 文件传输通道。会话只属于创建它的主机任务，由该任务负责关闭。

#[cfg(test)]
pub(crate) mod mock;
pub mod ssh;

use crate::error::TaskError;
use crate::registry::HostTarget;
use crate::storage::Storage;
use std::io;

pub use ssh::{Credentials, SshConnector};

/// 命令结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// 只有标准输出
    Success,
    /// 两个流都为空，同样视为成功
    NoOutput,
    /// 标准输出和错误输出都有内容
    Partial,
    /// 只有错误输出
    Failure,
}

/// 一次远程命令的输出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// 退出码只用于日志，成败以错误输出是否为空判断
    pub exit_status: Option<i32>,
}

impl CommandOutput {
    pub fn from_bytes(stdout: &[u8], stderr: &[u8], exit_status: Option<i32>) -> Self {
        Self {
            stdout: split_lines(stdout),
            stderr: split_lines(stderr),
            exit_status,
        }
    }

    pub fn status(&self) -> CommandStatus {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, true) => CommandStatus::Success,
            (true, true) => CommandStatus::NoOutput,
            (false, false) => CommandStatus::Partial,
            (true, false) => CommandStatus::Failure,
        }
    }

    /// 错误输出非空即为失败
    pub fn has_error(&self) -> bool {
        !self.stderr.is_empty()
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

/// 一台主机上的会话
pub trait RemoteSession: Send {
    /// 执行命令并读完两个输出流
    fn execute(&mut self, command: &str) -> io::Result<CommandOutput>;

    /// 打开文件传输通道，供同步引擎作为远程一端使用
    fn open_transfer_channel(&mut self) -> io::Result<Box<dyn Storage>>;

    /// 关闭会话，可以重复调用
    fn close(&mut self);
}

/// 会话工厂，所有主机任务共享一个实例
pub trait Connector: Send + Sync {
    fn connect(&self, host: &HostTarget) -> Result<Box<dyn RemoteSession>, TaskError>;
}
