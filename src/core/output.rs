//! 主机任务输出
//!
//! 每个主机任务拥有自己的 [`OutputAggregator`]。并行模式下所有输出先
//! 缓存，任务结束后在 [`OutputSink`] 的锁内一次性写出，保证不同主机的
//! 行不会交错；串行模式下同一时间只有一个任务，逐行直接写出。

use owo_colors::OwoColorize;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Normal,
    /// 失败信息，终端下以红色显示
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    pub style: LineStyle,
}

/// 进程内共享的输出设备，锁是主机任务之间唯一的串行化点
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    color: bool,
}

impl OutputSink {
    /// 标准输出，是终端时启用颜色
    pub fn stdout() -> Self {
        let color = io::stdout().is_terminal();
        Self::from_writer(io::stdout(), color)
    }

    pub fn from_writer(writer: impl Write + Send + 'static, color: bool) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            color,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        // 写出过程中 panic 不影响后续输出
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn render(&self, line: &OutputLine) -> String {
        match line.style {
            LineStyle::Error if self.color => line.text.red().to_string(),
            _ => line.text.clone(),
        }
    }

    /// 在一次加锁内写出一组行
    pub fn write_block(&self, lines: &[OutputLine]) -> io::Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut writer = self.lock();
        for line in lines {
            writeln!(writer, "{}", self.render(line))?;
        }
        writer.flush()
    }

    /// 写出一行普通文本（不属于任何主机任务，例如退出提示）
    pub fn write_line(&self, text: &str, style: LineStyle) -> io::Result<()> {
        self.write_block(&[OutputLine {
            text: text.to_string(),
            style,
        }])
    }
}

/// 输出模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// 逐行立即写出
    Serial,
    /// 缓存到任务结束再整体写出
    Parallel,
}

/// 单个主机任务的输出缓存
pub struct OutputAggregator {
    mode: OutputMode,
    sink: OutputSink,
    lines: Vec<OutputLine>,
    /// 已写到 sink 的行数
    written: usize,
}

impl OutputAggregator {
    pub fn new(mode: OutputMode, sink: OutputSink) -> Self {
        Self {
            mode,
            sink,
            lines: Vec::new(),
            written: 0,
        }
    }

    pub fn push(&mut self, text: impl Into<String>) {
        self.push_styled(text.into(), LineStyle::Normal);
    }

    pub fn push_error(&mut self, text: impl Into<String>) {
        self.push_styled(text.into(), LineStyle::Error);
    }

    fn push_styled(&mut self, text: String, style: LineStyle) {
        self.lines.push(OutputLine { text, style });
        if self.mode == OutputMode::Serial {
            self.flush();
        }
    }

    pub fn lines(&self) -> &[OutputLine] {
        &self.lines
    }

    /// 写出尚未写出的行，可重复调用
    pub fn flush(&mut self) {
        let pending = &self.lines[self.written..];
        if let Err(e) = self.sink.write_block(pending) {
            warn!("写出主机输出失败: {}", e);
        }
        self.written = self.lines.len();
    }

    /// 写出剩余内容并交出全部行
    pub fn finish(mut self) -> Vec<OutputLine> {
        self.flush();
        self.lines
    }
}
