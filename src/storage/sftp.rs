use super::{DirEntry, FileMeta, PathStat, PathType, Storage};
use ssh2::{ErrorCode, FileStat, Sftp};
use std::io::{self, Read, Write};
use std::path::Path;

// libssh2 SFTP 状态码
const FX_NO_SUCH_FILE: i32 = 2;
const FX_NO_SUCH_PATH: i32 = 10;
const FX_FILE_ALREADY_EXISTS: i32 = 11;

/// 远程主机上的 SFTP 通道
pub struct SftpStorage {
    sftp: Sftp,
    name: String,
}

impl SftpStorage {
    pub fn new(sftp: Sftp, host: &str) -> Self {
        Self {
            sftp,
            name: format!("sftp:{}", host),
        }
    }
}

/// 把 ssh2 错误转换为 io 错误，SFTP 的“不存在”统一映射为 `NotFound`
fn to_io(err: ssh2::Error) -> io::Error {
    match err.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE) | ErrorCode::SFTP(FX_NO_SUCH_PATH) => {
            io::Error::new(io::ErrorKind::NotFound, err)
        }
        ErrorCode::SFTP(FX_FILE_ALREADY_EXISTS) => {
            io::Error::new(io::ErrorKind::AlreadyExists, err)
        }
        _ => io::Error::from(err),
    }
}

fn kind_of(stat: &FileStat) -> Option<PathType> {
    if stat.is_dir() {
        Some(PathType::Directory)
    } else if stat.is_file() {
        Some(PathType::File)
    } else {
        None
    }
}

fn meta_of(stat: &FileStat) -> FileMeta {
    FileMeta {
        size: if stat.is_dir() { 0 } else { stat.size.unwrap_or(0) },
        mtime: stat.mtime.unwrap_or(0) as i64,
        atime: stat.atime.unwrap_or(0) as i64,
        mode: stat.perm.unwrap_or(0o644) & 0o7777,
    }
}

fn attrs_only(atime: Option<u64>, mtime: Option<u64>, perm: Option<u32>) -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm,
        atime,
        mtime,
    }
}

impl Storage for SftpStorage {
    fn lookup(&self, path: &str) -> io::Result<Option<PathStat>> {
        match self.sftp.stat(Path::new(path)).map_err(to_io) {
            Ok(stat) => Ok(kind_of(&stat).map(|kind| PathStat {
                kind,
                meta: meta_of(&stat),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for (entry_path, stat) in self.sftp.readdir(Path::new(path)).map_err(to_io)? {
            let Some(name) = entry_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
            else {
                continue;
            };
            let (kind, meta) = match kind_of(&stat) {
                Some(kind) => (kind, meta_of(&stat)),
                // readdir 返回的是链接本身的属性，需要再 stat 一次
                None => match self.lookup(&super::join_path(path, &name))? {
                    Some(target) => (target.kind, target.meta),
                    None => {
                        tracing::debug!("跳过特殊文件: {}/{}", path, name);
                        continue;
                    }
                },
            };
            entries.push(DirEntry { name, kind, meta });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn create_dir(&self, path: &str) -> io::Result<()> {
        self.sftp.mkdir(Path::new(path), 0o755).map_err(to_io)
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + '_>> {
        let file = self.sftp.open(Path::new(path)).map_err(to_io)?;
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + '_>> {
        let file = self.sftp.create(Path::new(path)).map_err(to_io)?;
        Ok(Box::new(file))
    }

    fn set_times(&self, path: &str, atime: i64, mtime: i64) -> io::Result<()> {
        let stat = attrs_only(Some(atime.max(0) as u64), Some(mtime.max(0) as u64), None);
        self.sftp.setstat(Path::new(path), stat).map_err(to_io)
    }

    fn set_mode(&self, path: &str, mode: u32) -> io::Result<()> {
        let stat = attrs_only(None, None, Some(mode & 0o7777));
        self.sftp.setstat(Path::new(path), stat).map_err(to_io)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
