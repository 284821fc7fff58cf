//! 测试用的会话实现：命令输出由脚本给定，远程文件系统是一个本地目录

use super::{CommandOutput, Connector, RemoteSession};
use crate::error::TaskError;
use crate::registry::HostTarget;
use crate::storage::{LocalStorage, Storage};
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 连接、执行、关闭事件的记录，以及同时执行命令的会话数峰值
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl EventLog {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[derive(Default)]
pub struct MockConnector {
    stdout: String,
    stderr: String,
    failing_hosts: HashSet<String>,
    error_hosts: HashSet<String>,
    remote_root: Option<PathBuf>,
    delay: Duration,
    pub events: EventLog,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, stdout: &str, stderr: &str) -> Self {
        self.stdout = stdout.to_string();
        self.stderr = stderr.to_string();
        self
    }

    /// 这些主机连接失败
    pub fn failing(mut self, hosts: &[&str]) -> Self {
        self.failing_hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    /// 这些主机上的命令只产生错误输出
    pub fn erroring(mut self, hosts: &[&str]) -> Self {
        self.error_hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_remote_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.remote_root = Some(root.into());
        self
    }

    /// 每次命令执行前等待
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Connector for MockConnector {
    fn connect(&self, host: &HostTarget) -> Result<Box<dyn RemoteSession>, TaskError> {
        self.events.record(format!("connect {}", host.name));
        if self.failing_hosts.contains(&host.name) {
            return Err(TaskError::Connection {
                host: host.address.clone(),
                reason: "connection refused".to_string(),
            });
        }
        let output = if self.error_hosts.contains(&host.name) {
            CommandOutput::from_bytes(b"", b"command failed\n", Some(1))
        } else {
            CommandOutput::from_bytes(self.stdout.as_bytes(), self.stderr.as_bytes(), Some(0))
        };
        Ok(Box::new(MockSession {
            host: host.name.clone(),
            output,
            remote_root: self.remote_root.clone(),
            delay: self.delay,
            closed: false,
            events: self.events.clone(),
        }))
    }
}

pub struct MockSession {
    host: String,
    output: CommandOutput,
    remote_root: Option<PathBuf>,
    delay: Duration,
    closed: bool,
    events: EventLog,
}

impl RemoteSession for MockSession {
    fn execute(&mut self, command: &str) -> io::Result<CommandOutput> {
        self.events.record(format!("exec {} {}", self.host, command));
        let active = self.events.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.peak.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.events.active.fetch_sub(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }

    fn open_transfer_channel(&mut self) -> io::Result<Box<dyn Storage>> {
        match &self.remote_root {
            Some(root) => Ok(Box::new(LocalStorage::rooted(root))),
            None => Err(io::Error::new(io::ErrorKind::Unsupported, "no sftp")),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.events.record(format!("close {}", self.host));
        }
    }
}
