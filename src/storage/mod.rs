pub mod local;
pub mod sftp;

use std::io::{self, Read, Write};

pub use local::LocalStorage;
pub use sftp::SftpStorage;

/// 路径所在的一端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Local => write!(f, "Local"),
            Side::Remote => write!(f, "Remote"),
        }
    }
}

/// 路径分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    File,
    Directory,
    Absent,
}

/// 文件元数据
///
/// 时间戳均为整秒（小数部分在读取时截断），两端比较时不会因为
/// 文件系统精度不同而误判。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub mode: u32,
}

/// 一次 stat 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStat {
    pub kind: PathType,
    pub meta: FileMeta,
}

/// 目录列表中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: PathType,
    pub meta: FileMeta,
}

/// 传输的一端（本地文件系统或远程 SFTP 通道）
///
/// 所有调用都是阻塞的，由主机任务所在的线程直接执行。
pub trait Storage: Send {
    /// 获取路径状态，路径不存在时返回 `None`
    ///
    /// 既不是普通文件也不是目录的条目（fifo、socket 等）同样返回 `None`。
    fn lookup(&self, path: &str) -> io::Result<Option<PathStat>>;

    /// 列出目录下的文件和子目录（不含 `.` 和 `..`）
    fn list_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    /// 创建单级目录，已存在时返回 `AlreadyExists` 或后端自己的错误
    fn create_dir(&self, path: &str) -> io::Result<()>;

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + '_>>;

    /// 创建或截断文件
    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + '_>>;

    fn set_times(&self, path: &str, atime: i64, mtime: i64) -> io::Result<()>;

    fn set_mode(&self, path: &str, mode: u32) -> io::Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 拼接路径（统一使用 /）
pub fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// 上级目录，没有上级时返回 `None`
pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(trimmed[..idx].to_string()),
        None => None,
    }
}

/// 路径最后一段
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// 目录参数统一以 / 结尾
pub fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// 规范化路径分隔符（统一使用 /）
pub fn normalize_path(path: &str) -> String {
    if cfg!(windows) {
        path.replace('\\', "/")
    } else {
        path.to_string()
    }
}
