//! 多主机任务调度
//!
//! 每台主机一个任务，各自占用一个系统线程（ssh2 是阻塞 API），
//! 结果通过 oneshot 通道交回。并行模式下主机数不受线程池大小限制。
//! 串行模式下等上一个任务结束再启动下一个；并行模式下全部启动后统一等待。
//! 启动每个新任务之前检查取消标志，已经在运行的任务不会被打断。

use crate::core::cancel::CancellationToken;
use crate::core::engine::{Direction, SyncEngine, TransferRequest};
use crate::core::output::{OutputAggregator, OutputLine, OutputMode, OutputSink};
use crate::error::TaskError;
use crate::registry::HostTarget;
use crate::session::{CommandOutput, CommandStatus, Connector, RemoteSession};
use crate::storage::LocalStorage;
use std::io;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// 要在每台主机上执行的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Command { command: String, skip_err: bool },
    Put { src: String, dst: String },
    Get { src: String, dst: String },
}

impl Operation {
    fn skip_err(&self) -> bool {
        matches!(self, Operation::Command { skip_err: true, .. })
    }

    /// 下载总是串行
    fn allows_parallel(&self) -> bool {
        !matches!(self, Operation::Get { .. })
    }
}

/// 主机任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTaskState {
    Pending,
    Connecting,
    Connected,
    Executing,
    Completed,
    Failed,
    /// 终态，输出已写出
    Flushed,
}

impl HostTaskState {
    pub fn can_transition(self, next: HostTaskState) -> bool {
        use HostTaskState::*;
        matches!(
            (self, next),
            (Pending, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Completed, Flushed)
                | (Failed, Flushed)
        )
    }
}

struct StateTracker {
    host: String,
    state: HostTaskState,
}

impl StateTracker {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            state: HostTaskState::Pending,
        }
    }

    fn advance(&mut self, next: HostTaskState) {
        debug_assert!(
            self.state.can_transition(next),
            "{:?} -> {:?}",
            self.state,
            next
        );
        debug!("{}: {:?} -> {:?}", self.host, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

/// 单台主机的执行结果
#[derive(Debug, Clone)]
pub struct HostTaskResult {
    pub host: HostTarget,
    pub outcome: Outcome,
    /// 失败是否可忽略（`--skip-err` 下的命令错误）
    pub recoverable: bool,
    pub output: Vec<OutputLine>,
}

impl HostTaskResult {
    fn is_fatal(&self) -> bool {
        self.outcome == Outcome::Failed && !self.recoverable
    }
}

/// 一次运行的汇总
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub results: Vec<HostTaskResult>,
    /// 因取消而未启动的主机
    pub skipped: Vec<HostTarget>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == Outcome::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// 进程退出码：中断 -10，有不可恢复错误 10，否则 0
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            -10
        } else if self.results.iter().any(HostTaskResult::is_fatal) {
            10
        } else {
            0
        }
    }
}

pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    sink: OutputSink,
    cancel: CancellationToken,
    parallel: bool,
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn Connector>, sink: OutputSink, cancel: CancellationToken) -> Self {
        Self {
            connector,
            sink,
            cancel,
            parallel: false,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// 在所有主机上执行操作，等待全部已启动的任务结束
    pub async fn run(&self, hosts: Vec<HostTarget>, operation: Operation) -> RunSummary {
        let parallel = self.parallel && operation.allows_parallel();
        let mode = if parallel {
            OutputMode::Parallel
        } else {
            OutputMode::Serial
        };
        info!(
            "开始执行: {} 台主机, {}",
            hosts.len(),
            if parallel { "并行" } else { "串行" }
        );

        let operation = Arc::new(operation);
        let mut summary = RunSummary::default();
        let mut running: Vec<(HostTarget, io::Result<TaskHandle>)> = Vec::new();

        let mut pending = hosts.into_iter();
        while let Some(host) = pending.next() {
            if self.cancel.is_cancelled() {
                summary.skipped.push(host);
                summary.skipped.extend(pending.by_ref());
                break;
            }

            let task = HostTask {
                host: host.clone(),
                operation: Arc::clone(&operation),
                connector: Arc::clone(&self.connector),
                cancel: self.cancel.clone(),
                output: OutputAggregator::new(mode, self.sink.clone()),
            };
            let handle = task.spawn();

            if parallel {
                running.push((host, handle));
            } else {
                summary.results.push(self.join(host, handle).await);
            }
        }
        for (host, handle) in running {
            summary.results.push(self.join(host, handle).await);
        }

        summary.interrupted = self.cancel.is_interrupted();
        if !summary.skipped.is_empty() {
            warn!("已取消，跳过 {} 台主机", summary.skipped.len());
        }
        info!(
            "{} ok, {} failed, {} skipped",
            summary.succeeded(),
            summary.failed(),
            summary.skipped.len()
        );
        summary
    }

    async fn join(&self, host: HostTarget, handle: io::Result<TaskHandle>) -> HostTaskResult {
        let receiver = match handle {
            Ok(receiver) => receiver,
            Err(e) => {
                error!("无法为 {} 启动线程: {}", host.name, e);
                return self.abandoned(host);
            }
        };
        match receiver.await {
            Ok(result) => result,
            Err(_) => {
                error!("{} 的任务异常退出", host.name);
                self.abandoned(host)
            }
        }
    }

    fn abandoned(&self, host: HostTarget) -> HostTaskResult {
        self.cancel.cancel();
        HostTaskResult {
            host,
            outcome: Outcome::Failed,
            recoverable: false,
            output: Vec::new(),
        }
    }
}

/// 单台主机任务的上下文，整体移动到任务线程
struct HostTask {
    host: HostTarget,
    operation: Arc<Operation>,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    output: OutputAggregator,
}

type TaskHandle = oneshot::Receiver<HostTaskResult>;

impl HostTask {
    /// 在独立线程上运行，线程异常退出时接收端收到 `RecvError`
    fn spawn(self) -> io::Result<TaskHandle> {
        let (sender, receiver) = oneshot::channel();
        thread::Builder::new()
            .name(format!("host-{}", self.host.name))
            .spawn(move || {
                let _ = sender.send(self.run());
            })?;
        Ok(receiver)
    }

    fn run(mut self) -> HostTaskResult {
        let mut state = StateTracker::new(&self.host.name);
        self.output.push("");
        self.output.push(format!("----{}", self.host.name));

        state.advance(HostTaskState::Connecting);
        let result = match self.connector.connect(&self.host) {
            Ok(session) => {
                state.advance(HostTaskState::Connected);
                // 任何退出路径都会关闭会话
                let mut session = scopeguard::guard(session, |mut s| s.close());
                state.advance(HostTaskState::Executing);
                self.execute(&mut **session)
            }
            Err(e) => Err(e),
        };

        let (outcome, recoverable) = match result {
            Ok(()) => {
                state.advance(HostTaskState::Completed);
                (Outcome::Success, true)
            }
            Err(e) => {
                state.advance(HostTaskState::Failed);
                self.record_error(&e);
                let recoverable = e.is_recoverable(self.operation.skip_err());
                if recoverable {
                    warn!("{}: {}", self.host.name, e);
                } else {
                    error!("{}: {}", self.host.name, e);
                    if self.cancel.cancel() {
                        info!("{} 出现不可恢复错误，不再启动新的主机任务", self.host.name);
                    }
                }
                (Outcome::Failed, recoverable)
            }
        };

        let output = self.output.finish();
        state.advance(HostTaskState::Flushed);
        HostTaskResult {
            host: self.host,
            outcome,
            recoverable,
            output,
        }
    }

    fn execute(&mut self, session: &mut dyn RemoteSession) -> Result<(), TaskError> {
        let operation = Arc::clone(&self.operation);
        match &*operation {
            Operation::Command { command, .. } => self.run_command(session, command),
            Operation::Put { src, dst } => {
                self.sync(session, &TransferRequest::new(src, dst, Direction::Upload))
            }
            Operation::Get { src, dst } => {
                self.sync(session, &TransferRequest::new(src, dst, Direction::Download))
            }
        }
    }

    fn run_command(&mut self, session: &mut dyn RemoteSession, command: &str) -> Result<(), TaskError> {
        // 通道本身出错时按只有错误输出处理
        let result = session.execute(command).unwrap_or_else(|e| CommandOutput {
            stdout: Vec::new(),
            stderr: vec![e.to_string()],
            exit_status: None,
        });

        match result.status() {
            CommandStatus::Success | CommandStatus::Partial => {
                self.output.push("    ----result:");
                for line in &result.stdout {
                    self.output.push(format!("        {}", line));
                }
            }
            CommandStatus::Failure => self.output.push_error("    ----error:"),
            CommandStatus::NoOutput => {}
        }
        for line in &result.stderr {
            self.output.push_error(format!("        {}", line));
        }

        if result.has_error() {
            return Err(TaskError::RemoteCommand {
                host: self.host.name.clone(),
                stderr: result.stderr.join("\n"),
            });
        }
        Ok(())
    }

    fn sync(&mut self, session: &mut dyn RemoteSession, request: &TransferRequest) -> Result<(), TaskError> {
        let remote = session
            .open_transfer_channel()
            .map_err(|e| TaskError::Connection {
                host: self.host.address.clone(),
                reason: format!("sftp: {}", e),
            })?;
        let local = LocalStorage::new();
        let report = SyncEngine::new(&local, remote.as_ref(), &mut self.output).run(request)?;
        debug!("{}: {:?}", self.host.name, report);
        Ok(())
    }

    /// 错误先写进本主机的输出，再向上报告
    fn record_error(&mut self, err: &TaskError) {
        let line = match err {
            // 错误输出已经逐行写入
            TaskError::RemoteCommand { .. } => return,
            TaskError::Connection { .. } => format!("    ----{}", err),
            TaskError::Transfer { path, source } => {
                let verb = match &*self.operation {
                    Operation::Get { .. } => "Downloading",
                    _ => "Uploading",
                };
                self.output
                    .push_error(format!("        ----{} {} Failed", verb, path));
                format!("        ----{}", source)
            }
            TaskError::SourceMissing { .. } => format!("        {}", err),
            _ => format!("        ----{}", err),
        };
        self.output.push_error(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output::testing::memory_sink;
    use crate::session::mock::MockConnector;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn hosts(names: &[&str]) -> Vec<HostTarget> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| HostTarget {
                name: name.to_string(),
                address: format!("10.0.0.{}", i + 1),
                port: 22,
            })
            .collect()
    }

    fn command(skip_err: bool) -> Operation {
        Operation::Command {
            command: "echo ok".to_string(),
            skip_err,
        }
    }

    #[test]
    fn test_state_transitions() {
        use HostTaskState::*;
        assert!(Pending.can_transition(Connecting));
        assert!(Connecting.can_transition(Failed));
        assert!(Failed.can_transition(Flushed));
        assert!(!Pending.can_transition(Executing));
        assert!(!Connecting.can_transition(Executing));
        assert!(!Flushed.can_transition(Pending));
    }

    #[tokio::test]
    async fn test_parallel_blocks_do_not_interleave() {
        let connector = MockConnector::new()
            .with_output("ok\n", "")
            .with_delay(Duration::from_millis(30));
        let events = connector.events.clone();
        let (sink, buffer) = memory_sink();
        let orchestrator = Orchestrator::new(Arc::new(connector), sink, CancellationToken::new())
            .parallel(true);

        let summary = orchestrator
            .run(hosts(&["web1", "web2", "web3"]), command(false))
            .await;

        assert_eq!(summary.succeeded(), 3);
        assert_eq!(summary.exit_code(), 0);
        let transcript = buffer.contents();
        for name in ["web1", "web2", "web3"] {
            let block = format!("\n----{}\n    ----result:\n        ok\n", name);
            assert!(transcript.contains(&block), "{}", transcript);
        }
        assert_eq!(events.count("close"), 3);
    }

    #[tokio::test]
    async fn test_parallel_runs_every_host_at_once() {
        // 超过 tokio 默认阻塞线程池上限（512）
        let names: Vec<String> = (0..600).map(|i| format!("node{}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let connector = MockConnector::new()
            .with_output("ok\n", "")
            .with_delay(Duration::from_millis(500));
        let events = connector.events.clone();
        let (sink, _buffer) = memory_sink();
        let orchestrator = Orchestrator::new(Arc::new(connector), sink, CancellationToken::new())
            .parallel(true);

        let summary = orchestrator.run(hosts(&names), command(false)).await;

        assert_eq!(summary.succeeded(), 600);
        assert_eq!(events.peak_concurrency(), 600);
    }

    #[tokio::test]
    async fn test_sequential_error_skips_later_hosts() {
        let connector = MockConnector::new().with_output("ok\n", "").erroring(&["h2"]);
        let events = connector.events.clone();
        let (sink, buffer) = memory_sink();
        let cancel = CancellationToken::new();
        let orchestrator = Orchestrator::new(Arc::new(connector), sink, cancel.clone());

        let summary = orchestrator.run(hosts(&["h1", "h2", "h3"]), command(false)).await;

        assert!(cancel.is_cancelled());
        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].name, "h3");
        assert_eq!(summary.exit_code(), 10);
        assert_eq!(events.count("connect h3"), 0);
        assert_eq!(events.count("close"), 2);

        let transcript = buffer.contents();
        assert!(transcript.contains("\n----h2\n    ----error:\n        command failed\n"));
        assert!(!transcript.contains("----h3"));
    }

    #[tokio::test]
    async fn test_skip_err_runs_every_host() {
        let connector = MockConnector::new().with_output("ok\n", "").erroring(&["h2"]);
        let (sink, _buffer) = memory_sink();
        let cancel = CancellationToken::new();
        let orchestrator = Orchestrator::new(Arc::new(connector), sink, cancel.clone());

        let summary = orchestrator.run(hosts(&["h1", "h2", "h3"]), command(true)).await;

        assert!(!cancel.is_cancelled());
        assert_eq!(summary.results.len(), 3);
        assert_eq!(summary.failed(), 1);
        assert!(summary.results[1].recoverable);
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_tasks_finish_after_cancel() {
        let connector = MockConnector::new()
            .with_output("ok\n", "")
            .failing(&["h1"])
            .with_delay(Duration::from_millis(50));
        let events = connector.events.clone();
        let (sink, buffer) = memory_sink();
        let cancel = CancellationToken::new();
        let orchestrator =
            Orchestrator::new(Arc::new(connector), sink, cancel.clone()).parallel(true);

        let summary = orchestrator.run(hosts(&["h1", "h2", "h3"]), command(false)).await;

        assert!(cancel.is_cancelled());
        assert_eq!(summary.results.len() + summary.skipped.len(), 3);
        assert_eq!(summary.exit_code(), 10);
        // 已启动的任务都完整写出
        let transcript = buffer.contents();
        for result in &summary.results {
            assert!(transcript.contains(&format!("----{}\n", result.host.name)));
        }
        assert!(transcript.contains("    ----10.0.0.1 ssh connect error: connection refused"));
        assert_eq!(events.count("exec h1"), 0);
        assert_eq!(events.count("close"), events.count("connect") - 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let connector = MockConnector::new();
        let events = connector.events.clone();
        let (sink, buffer) = memory_sink();
        let cancel = CancellationToken::new();
        cancel.interrupt();
        let orchestrator = Orchestrator::new(Arc::new(connector), sink, cancel);

        let summary = orchestrator.run(hosts(&["h1", "h2"]), command(false)).await;

        assert!(summary.results.is_empty());
        assert_eq!(summary.skipped.len(), 2);
        assert_eq!(summary.exit_code(), -10);
        assert!(events.events().is_empty());
        assert_eq!(buffer.contents(), "");
    }

    #[tokio::test]
    async fn test_put_through_session() {
        let local = TempDir::new().unwrap();
        fs::create_dir(local.path().join("conf")).unwrap();
        fs::write(local.path().join("conf/app.toml"), b"port = 80").unwrap();
        let remote = TempDir::new().unwrap();

        let connector = MockConnector::new().with_remote_root(remote.path());
        let (sink, buffer) = memory_sink();
        let orchestrator = Orchestrator::new(Arc::new(connector), sink, CancellationToken::new());
        let src = format!("{}/conf", local.path().to_str().unwrap());
        let op = Operation::Put {
            src: src.clone(),
            dst: "/etc/app".to_string(),
        };

        let summary = orchestrator.run(hosts(&["web1", "web2"]), op).await;

        assert_eq!(summary.succeeded(), 2);
        assert_eq!(
            fs::read(remote.path().join("etc/app/app.toml")).unwrap(),
            b"port = 80"
        );
        let transcript = buffer.contents();
        assert!(transcript.contains(&format!("    ----Uploading {} TO /etc/app\n", src)));
        assert!(transcript.contains("        ----Create Remote Dir: /etc/app\n"));
    }

    #[tokio::test]
    async fn test_transfer_conflict_is_fatal_even_with_skip() {
        let local = TempDir::new().unwrap();
        fs::create_dir(local.path().join("conf")).unwrap();
        fs::write(local.path().join("conf/app.toml"), b"x").unwrap();
        let remote = TempDir::new().unwrap();
        fs::write(remote.path().join("app"), b"not a dir").unwrap();

        let connector = MockConnector::new().with_remote_root(remote.path());
        let events = connector.events.clone();
        let (sink, buffer) = memory_sink();
        let cancel = CancellationToken::new();
        let orchestrator = Orchestrator::new(Arc::new(connector), sink, cancel.clone());
        let op = Operation::Put {
            src: format!("{}/conf", local.path().to_str().unwrap()),
            dst: "/app".to_string(),
        };

        let summary = orchestrator.run(hosts(&["web1", "web2"]), op).await;

        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.exit_code(), 10);
        assert!(buffer.contents().contains("        ----/app is file\n"));
        assert_eq!(events.count("connect"), 1);
        assert_eq!(events.count("close"), 1);
    }

    #[tokio::test]
    async fn test_get_missing_source_reports_path() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let connector = MockConnector::new().with_remote_root(remote.path());
        let events = connector.events.clone();
        let (sink, buffer) = memory_sink();
        let orchestrator =
            Orchestrator::new(Arc::new(connector), sink, CancellationToken::new()).parallel(true);
        let op = Operation::Get {
            src: "/var/log/none".to_string(),
            dst: local.path().to_str().unwrap().to_string(),
        };

        let summary = orchestrator.run(hosts(&["db1"]), op).await;

        assert_eq!(summary.failed(), 1);
        assert!(buffer.contents().contains("        /var/log/none is not exist\n"));
        assert_eq!(events.count("close db1"), 1);
    }
}
