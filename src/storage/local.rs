use super::{DirEntry, FileMeta, PathStat, PathType, Storage};
use filetime::FileTime;
use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

/// 本地文件系统
///
/// 默认直接使用传入的路径；`rooted` 创建的实例会把所有路径解析到
/// 指定根目录之下（测试里用它模拟远程主机）。
pub struct LocalStorage {
    base_path: Option<PathBuf>,
    name: String,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self {
            base_path: None,
            name: "local".to_string(),
        }
    }

    pub fn rooted(path: impl Into<PathBuf>) -> Self {
        let base_path = path.into();
        let name = format!("local:{}", base_path.display());
        Self {
            base_path: Some(base_path),
            name,
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        match &self.base_path {
            None => PathBuf::from(path),
            Some(base) => {
                let path = path.trim_start_matches('/').trim_start_matches('\\');
                if path.is_empty() {
                    base.clone()
                } else {
                    base.join(path)
                }
            }
        }
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// 从本地元数据提取整秒时间戳和权限位
pub(crate) fn meta_from(metadata: &fs::Metadata) -> FileMeta {
    FileMeta {
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        mtime: FileTime::from_last_modification_time(metadata).unix_seconds(),
        atime: FileTime::from_last_access_time(metadata).unix_seconds(),
        mode: mode_of(metadata),
    }
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn is_missing(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

impl Storage for LocalStorage {
    fn lookup(&self, path: &str) -> io::Result<Option<PathStat>> {
        match fs::metadata(self.resolve_path(path)) {
            Ok(metadata) => {
                let kind = if metadata.is_dir() {
                    PathType::Directory
                } else if metadata.is_file() {
                    PathType::File
                } else {
                    return Ok(None);
                };
                Ok(Some(PathStat {
                    kind,
                    meta: meta_from(&metadata),
                }))
            }
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve_path(path))? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!("跳过非 UTF-8 文件名: {:?}", entry.path());
                continue;
            };
            // 跟随符号链接，与 lookup 保持一致
            let metadata = match fs::metadata(entry.path()) {
                Ok(m) => m,
                Err(e) if is_missing(&e) => continue,
                Err(e) => return Err(e),
            };
            let kind = if metadata.is_dir() {
                PathType::Directory
            } else if metadata.is_file() {
                PathType::File
            } else {
                continue;
            };
            entries.push(DirEntry {
                name,
                kind,
                meta: meta_from(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn create_dir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.resolve_path(path))
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + '_>> {
        let file = fs::File::open(self.resolve_path(path))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + '_>> {
        let file = fs::File::create(self.resolve_path(path))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn set_times(&self, path: &str, atime: i64, mtime: i64) -> io::Result<()> {
        filetime::set_file_times(
            self.resolve_path(path),
            FileTime::from_unix_time(atime, 0),
            FileTime::from_unix_time(mtime, 0),
        )
    }

    #[cfg(unix)]
    fn set_mode(&self, path: &str, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(self.resolve_path(path), fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn set_mode(&self, path: &str, mode: u32) -> io::Result<()> {
        let full_path = self.resolve_path(path);
        let mut permissions = fs::metadata(&full_path)?.permissions();
        permissions.set_readonly(mode & 0o222 == 0);
        fs::set_permissions(full_path, permissions)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
