use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fleetsync_lib::config::{self, SessionConfig};
use fleetsync_lib::core::LineStyle;
use fleetsync_lib::logging::{init_logging, LogConfig};
use fleetsync_lib::session::{Credentials, SshConnector};
use fleetsync_lib::{CancellationToken, Operation, Orchestrator, OutputSink, Registry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// 在一组 SSH 主机上执行命令，或同步文件/目录
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 主机清单（YAML），默认为配置目录下的 hosts.yml
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// 远程用户名
    #[arg(short = 'u', long = "user", default_value = "root", global = true)]
    user: String,

    /// 密码（同时作为私钥口令）
    #[arg(short = 'p', long = "password", env = "FLEETSYNC_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// 本地私钥，默认 ~/.ssh/id_rsa
    #[arg(long = "pkey", global = true)]
    pkey: Option<PathBuf>,

    /// 连接超时（秒），覆盖配置文件
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// 连接失败后的重试次数，覆盖配置文件
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// 日志详细程度（-v debug，-vv trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 在远程主机上执行命令，多条命令用 ';' 分隔
    Cmd {
        command: String,
        /// 某台主机出错时继续处理其他主机
        #[arg(long)]
        skip_err: bool,
        /// 并行执行（隐含 --skip-err）
        #[arg(long)]
        parallel: bool,
        #[command(subcommand)]
        target: Target,
    },
    /// 本地 -> 远程
    Put {
        src: String,
        dst: String,
        /// 并行执行
        #[arg(long)]
        parallel: bool,
        #[command(subcommand)]
        target: Target,
    },
    /// 远程 -> 本地（总是串行）
    Get {
        src: String,
        dst: String,
        #[command(subcommand)]
        target: Target,
    },
}

#[derive(Subcommand)]
enum Target {
    /// 目标主机：主机名、分组名、名称片段，或 all
    Target(TargetArgs),
}

#[derive(Args)]
struct TargetArgs {
    #[arg(required = true)]
    targets: Vec<String>,
}

impl Commands {
    fn into_parts(self) -> (Operation, bool, Vec<String>) {
        match self {
            Commands::Cmd {
                command,
                skip_err,
                parallel,
                target: Target::Target(t),
            } => (
                Operation::Command {
                    command,
                    skip_err: skip_err || parallel,
                },
                parallel,
                t.targets,
            ),
            Commands::Put {
                src,
                dst,
                parallel,
                target: Target::Target(t),
            } => (Operation::Put { src, dst }, parallel, t.targets),
            Commands::Get {
                src,
                dst,
                target: Target::Target(t),
            } => (Operation::Get { src, dst }, false, t.targets),
        }
    }
}

fn default_private_key() -> Option<PathBuf> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()
        .map(|home| PathBuf::from(home).join(".ssh").join("id_rsa"))
}

async fn run(cli: Cli, config_dir: &Path) -> anyhow::Result<i32> {
    let mut session_config = SessionConfig::load(config_dir)?;
    if let Some(timeout) = cli.timeout {
        session_config.connect_timeout_secs = timeout;
    }
    if let Some(retries) = cli.retries {
        session_config.connect_retries = retries;
    }

    let registry_path = cli.config.unwrap_or_else(config::default_registry_path);
    let registry = Registry::load(&registry_path)?;
    let (operation, parallel, targets) = cli.command.into_parts();
    let hosts = registry
        .resolve(&targets)
        .context("解析目标主机失败")?;

    let credentials = Credentials {
        user: cli.user,
        password: cli.password,
        private_key: cli.pkey.or_else(default_private_key),
    };
    let connector = Arc::new(SshConnector::new(credentials, session_config));
    let sink = OutputSink::stdout();
    let cancel = CancellationToken::new();

    let interrupt = cancel.clone();
    let interrupt_sink = sink.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt.interrupt() {
                warn!("收到中断信号，等待已启动的主机任务结束（再次 Ctrl-C 立即退出）");
                continue;
            }
            warn!("再次收到中断信号，立即退出");
            let _ = interrupt_sink.write_line("\n----bye----", LineStyle::Error);
            std::process::exit(-10);
        }
    });

    let summary = Orchestrator::new(connector, sink.clone(), cancel)
        .parallel(parallel)
        .run(hosts, operation)
        .await;

    if summary.interrupted {
        let _ = sink.write_line("\n----bye----", LineStyle::Error);
    }
    Ok(summary.exit_code())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_dir = config::config_dir();
    let log_config = LogConfig::load(&config_dir);
    let guard = init_logging(&log_config, cli.verbose, &config_dir);

    let code = match run(cli, &config_dir).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{:#}", e);
            10
        }
    };

    // exit 不会执行析构，先让文件日志写完
    drop(guard);
    std::process::exit(code);
}
