use crate::storage::local::meta_from;
use crate::storage::{FileMeta, PathType};
use std::io;
use std::path::{Component, Path};
use tracing::warn;
use walkdir::WalkDir;

/// 文件扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 是否跳过以 . 开头的文件和目录
    pub skip_hidden: bool,
    /// 是否跟随符号链接
    pub follow_links: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            skip_hidden: true,
            follow_links: true,
        }
    }
}

/// 扫描得到的一个本地条目
#[derive(Debug, Clone)]
pub struct LocalEntry {
    /// 本地完整路径（以 / 分隔）
    pub path: String,
    /// 相对扫描根目录的路径（以 / 分隔）
    pub relative: String,
    pub kind: PathType,
    pub meta: FileMeta,
}

/// 是否是隐藏条目
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// 本地目录树扫描器
#[derive(Debug, Clone, Default)]
pub struct FileScanner {
    config: ScanConfig,
}

impl FileScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ScanConfig) -> Self {
        Self { config }
    }

    /// 按配置判断某个目录项是否应被跳过
    pub fn skips(&self, name: &str) -> bool {
        self.config.skip_hidden && is_hidden(name)
    }

    /// 单次遍历本地目录树
    ///
    /// 目录总是先于其内容产出，隐藏目录整体跳过（不会进入）。
    /// 根目录本身不产出，也不参与隐藏判断。
    pub fn walk_local<'a>(
        &self,
        root: &'a str,
    ) -> impl Iterator<Item = io::Result<LocalEntry>> + 'a {
        let skip_hidden = self.config.skip_hidden;
        WalkDir::new(root)
            .min_depth(1)
            .follow_links(self.config.follow_links)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                !(skip_hidden
                    && entry.depth() > 0
                    && entry.file_name().to_str().map_or(false, is_hidden))
            })
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => return Some(Err(io::Error::from(e))),
                };
                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => return Some(Err(io::Error::from(e))),
                };
                let kind = if metadata.is_dir() {
                    PathType::Directory
                } else if metadata.is_file() {
                    PathType::File
                } else {
                    return None;
                };
                let Some(relative) = relative_path(root, entry.path()) else {
                    warn!("跳过无法处理的路径: {:?}", entry.path());
                    return None;
                };
                let path = crate::storage::join_path(root, &relative);
                Some(Ok(LocalEntry {
                    path,
                    relative,
                    kind,
                    meta: meta_from(&metadata),
                }))
            })
    }
}

/// 相对路径，统一以 / 分隔；非 UTF-8 返回 `None`
fn relative_path(root: &str, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
