use super::{CommandOutput, Connector, RemoteSession};
use crate::config::SessionConfig;
use crate::error::TaskError;
use crate::registry::HostTarget;
use crate::storage::{SftpStorage, Storage};
use ssh2::{Channel, Session};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 登录凭据，所有主机共用
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    /// 密码，同时作为私钥的口令
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
}

/// 基于 ssh2 的会话工厂
pub struct SshConnector {
    credentials: Credentials,
    config: SessionConfig,
}

impl SshConnector {
    pub fn new(credentials: Credentials, config: SessionConfig) -> Self {
        Self {
            credentials,
            config,
        }
    }

    /// 建立一次连接：TCP、握手、认证
    fn open(&self, host: &HostTarget) -> Result<Session, String> {
        let addr = (host.address.as_str(), host.port)
            .to_socket_addrs()
            .map_err(|e| e.to_string())?
            .next()
            .ok_or_else(|| format!("cannot resolve {}", host.address))?;

        let connect_timeout = self.config.connect_timeout();
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| e.to_string())?;
        let mut session = Session::new().map_err(|e| e.to_string())?;
        session.set_tcp_stream(tcp);
        session.set_timeout(connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| format!("handshake failed: {}", e))?;

        self.authenticate(&session)?;
        // 0 表示不限时
        session.set_timeout(self.config.io_timeout_ms());
        Ok(session)
    }

    /// 依次尝试私钥、密码、ssh-agent
    fn authenticate(&self, session: &Session) -> Result<(), String> {
        let user = &self.credentials.user;
        let password = self.credentials.password.as_deref();
        let mut errors = Vec::new();

        if let Some(key) = self.credentials.private_key.as_deref() {
            if key.exists() {
                if let Err(e) = session.userauth_pubkey_file(user, None, key, password) {
                    errors.push(format!("pubkey: {}", e));
                }
            } else {
                errors.push(format!("key not found: {}", key.display()));
            }
        }
        if !session.authenticated() {
            if let Some(password) = password {
                if let Err(e) = session.userauth_password(user, password) {
                    errors.push(format!("password: {}", e));
                }
            }
        }
        if !session.authenticated() {
            if let Err(e) = session.userauth_agent(user) {
                errors.push(format!("agent: {}", e));
            }
        }

        if session.authenticated() {
            Ok(())
        } else {
            debug!("SSH 认证失败: {}", errors.join("; "));
            Err(format!("authentication failed: {}", errors.join("; ")))
        }
    }
}

impl Connector for SshConnector {
    fn connect(&self, host: &HostTarget) -> Result<Box<dyn RemoteSession>, TaskError> {
        let mut attempt = 0;
        loop {
            match self.open(host) {
                Ok(session) => {
                    info!("已连接 {} ({}:{})", host.name, host.address, host.port);
                    return Ok(Box::new(SshSession::new(session, &host.name)));
                }
                Err(reason) if attempt < self.config.connect_retries => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        "连接 {} 失败: {}，{:?} 后重试 ({}/{})",
                        host.name,
                        reason,
                        delay,
                        attempt + 1,
                        self.config.connect_retries
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(reason) => {
                    return Err(TaskError::Connection {
                        host: host.address.clone(),
                        reason,
                    })
                }
            }
        }
    }
}

/// 一条已认证的 SSH 连接
pub struct SshSession {
    session: Session,
    host: String,
    closed: bool,
}

impl SshSession {
    fn new(session: Session, host: &str) -> Self {
        Self {
            session,
            host: host.to_string(),
            closed: false,
        }
    }
}

impl RemoteSession for SshSession {
    fn execute(&mut self, command: &str) -> io::Result<CommandOutput> {
        debug!("{} 执行: {}", self.host, command);
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let timeout_ms = self.session.timeout();
        self.session.set_blocking(false);
        let drained = drain_channel(&mut channel, timeout_ms);
        self.session.set_blocking(true);
        let (stdout, stderr) = drained?;
        channel.wait_close()?;

        let exit_status = channel.exit_status().ok();
        debug!("{} 退出码: {:?}", self.host, exit_status);
        Ok(CommandOutput::from_bytes(&stdout, &stderr, exit_status))
    }

    fn open_transfer_channel(&mut self) -> io::Result<Box<dyn Storage>> {
        let sftp = self.session.sftp()?;
        Ok(Box::new(SftpStorage::new(sftp, &self.host)))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.session.disconnect(None, "bye", None) {
            debug!("断开 {} 失败: {}", self.host, e);
        }
    }
}

/// 空闲时两次读取之间的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 命令通道的两路输出
trait OutputStreams {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn eof(&self) -> bool;
}

impl OutputStreams for Channel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stderr().read(buf)
    }

    fn eof(&self) -> bool {
        Channel::eof(self)
    }
}

/// 非阻塞模式下交替读取 stdout 和 stderr
///
/// 任一路输出写满通道窗口时对端会停住，两路必须同时读。
/// `timeout_ms` 为 0 表示不限时，否则超过这段时间没有任何输出即报超时。
fn drain_channel(streams: &mut impl OutputStreams, timeout_ms: u32) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let idle_limit = (timeout_ms > 0).then(|| Duration::from_millis(u64::from(timeout_ms)));
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = vec![0u8; 32 * 1024];
    let mut last_read = Instant::now();

    loop {
        let mut progressed = read_available(streams.read_stdout(&mut buf), &buf, &mut stdout)?;
        progressed |= read_available(streams.read_stderr(&mut buf), &buf, &mut stderr)?;

        if progressed {
            last_read = Instant::now();
            continue;
        }
        if streams.eof() {
            return Ok((stdout, stderr));
        }
        if idle_limit.is_some_and(|limit| last_read.elapsed() >= limit) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "command output timed out"));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// 收下一次读取的结果，返回是否读到了内容
fn read_available(read: io::Result<usize>, buf: &[u8], out: &mut Vec<u8>) -> io::Result<bool> {
    match read {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// 对端先写 stderr，stderr 被读空之前 stdout 一直不可读
    struct StalledStreams {
        stdout: VecDeque<Vec<u8>>,
        stderr: VecDeque<Vec<u8>>,
        closed: bool,
    }

    fn pop_into(chunks: &mut VecDeque<Vec<u8>>, buf: &mut [u8]) -> io::Result<usize> {
        match chunks.pop_front() {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    impl OutputStreams for StalledStreams {
        fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.stderr.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            if self.stdout.is_empty() && self.closed {
                return Ok(0);
            }
            pop_into(&mut self.stdout, buf)
        }

        fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.stderr.is_empty() && self.closed {
                return Ok(0);
            }
            pop_into(&mut self.stderr, buf)
        }

        fn eof(&self) -> bool {
            self.closed && self.stdout.is_empty() && self.stderr.is_empty()
        }
    }

    #[test]
    fn test_drain_reads_stderr_while_stdout_blocked() {
        let mut streams = StalledStreams {
            stdout: VecDeque::from(vec![b"ok\n".to_vec()]),
            stderr: VecDeque::from(vec![b"warn 1\n".to_vec(), b"warn 2\n".to_vec()]),
            closed: true,
        };

        let (stdout, stderr) = drain_channel(&mut streams, 1_000).unwrap();
        assert_eq!(stdout, b"ok\n");
        assert_eq!(stderr, b"warn 1\nwarn 2\n");
    }

    #[test]
    fn test_drain_times_out_without_output() {
        let mut streams = StalledStreams {
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            closed: false,
        };

        let err = drain_channel(&mut streams, 30).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
