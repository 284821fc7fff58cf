use crate::core::comparator::compare_files;
use crate::core::oracle::PathOracle;
use crate::core::output::OutputAggregator;
use crate::core::scanner::FileScanner;
use crate::error::TaskError;
use crate::storage::{
    base_name, join_path, normalize_path, parent_path, with_trailing_slash, FileMeta, PathType,
    Side, Storage,
};
use std::io::{self, Write};
use tracing::{debug, info};

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 本地 -> 远程
    Upload,
    /// 远程 -> 本地
    Download,
}

impl Direction {
    pub fn source_side(self) -> Side {
        match self {
            Direction::Upload => Side::Local,
            Direction::Download => Side::Remote,
        }
    }

    pub fn dest_side(self) -> Side {
        match self {
            Direction::Upload => Side::Remote,
            Direction::Download => Side::Local,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Direction::Upload => "Uploading",
            Direction::Download => "Downloading",
        }
    }
}

/// 一次同步操作的根
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source_path: String,
    pub dest_path: String,
    pub direction: Direction,
}

impl TransferRequest {
    /// 本地一端的路径会统一为 / 分隔
    pub fn new(source_path: &str, dest_path: &str, direction: Direction) -> Self {
        let (source_path, dest_path) = match direction {
            Direction::Upload => (normalize_path(source_path), dest_path.to_string()),
            Direction::Download => (source_path.to_string(), normalize_path(dest_path)),
        };
        Self {
            source_path,
            dest_path,
            direction,
        }
    }
}

/// 同步报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files_transferred: u32,
    pub files_skipped: u32,
    pub dirs_created: u32,
    pub bytes_transferred: u64,
}

/// 写完文件后需要恢复属性的目录
///
/// 本次新建的目录恢复源目录的权限和时间；原有的只读目录只恢复原来的权限。
struct DirRestore {
    path: String,
    side: Side,
    mode: u32,
    times: Option<(i64, i64)>,
}

/// 目录树中的一项，源和目标路径都已确定
struct TreeEntry {
    source: String,
    dest: String,
    kind: PathType,
    meta: FileMeta,
}

/// 属主没有写权限
fn owner_read_only(mode: u32) -> bool {
    mode & 0o200 == 0
}

/// 去掉目录路径末尾的 /（根目录保留）
fn trim_dir(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" if path.starts_with('/') => "/",
        trimmed => trimmed,
    }
}

/// 同步引擎
///
/// 只在一个主机任务内使用，持有该任务的两端存储和输出。
pub struct SyncEngine<'a> {
    oracle: PathOracle<'a>,
    output: &'a mut OutputAggregator,
    scanner: FileScanner,
    report: SyncReport,
    restores: Vec<DirRestore>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        local: &'a dyn Storage,
        remote: &'a dyn Storage,
        output: &'a mut OutputAggregator,
    ) -> Self {
        Self {
            oracle: PathOracle::new(local, remote),
            output,
            scanner: FileScanner::new(),
            report: SyncReport::default(),
            restores: Vec::new(),
        }
    }

    pub fn with_scanner(mut self, scanner: FileScanner) -> Self {
        self.scanner = scanner;
        self
    }

    /// 执行同步
    pub fn run(mut self, request: &TransferRequest) -> Result<SyncReport, TaskError> {
        let direction = request.direction;
        self.output.push(format!(
            "    ----{} {} TO {}",
            direction.verb(),
            request.source_path,
            request.dest_path
        ));
        info!(
            "开始同步: {} -> {} ({:?}, 远程 {})",
            request.source_path,
            request.dest_path,
            direction,
            self.oracle.storage(Side::Remote).name()
        );

        let result = match self
            .oracle
            .lookup(&request.source_path, direction.source_side())
        {
            Ok(Some(stat)) if stat.kind == PathType::File => self.sync_file(request, stat.meta),
            Ok(Some(stat)) => self.sync_tree(request, stat.meta),
            Ok(None) => Err(TaskError::SourceMissing {
                path: request.source_path.clone(),
            }),
            Err(e) => Err(e),
        };

        // 出错时同样恢复已经放开写权限的目录
        let restored = self.restore_dir_attrs();
        result?;
        restored?;
        info!(
            "同步完成: 传输 {}, 跳过 {}, 新建目录 {}, {} 字节",
            self.report.files_transferred,
            self.report.files_skipped,
            self.report.dirs_created,
            self.report.bytes_transferred
        );
        Ok(self.report)
    }

    /// 源是单个文件
    fn sync_file(&mut self, request: &TransferRequest, src_meta: FileMeta) -> Result<(), TaskError> {
        let dst_side = request.direction.dest_side();
        let file_name = base_name(&request.source_path);

        let dest = match self.oracle.classify(&request.dest_path, dst_side)? {
            PathType::File => request.dest_path.clone(),
            PathType::Directory => {
                self.ensure_dir(&request.dest_path, dst_side, None)?;
                join_path(&request.dest_path, file_name)
            }
            PathType::Absent => {
                let dest = if request.dest_path.ends_with('/') {
                    join_path(&request.dest_path, file_name)
                } else {
                    request.dest_path.clone()
                };
                if let Some(parent) = parent_path(&dest) {
                    self.ensure_dir(&parent, dst_side, None)?;
                }
                dest
            }
        };

        self.transfer_file(&request.source_path, &dest, &src_meta, request.direction)
    }

    /// 源是目录：先完整列出源目录树并检查冲突，确认无冲突后才开始写入
    fn sync_tree(&mut self, request: &TransferRequest, root_meta: FileMeta) -> Result<(), TaskError> {
        let direction = request.direction;
        let dst_side = direction.dest_side();
        if self.oracle.classify(&request.dest_path, dst_side)? == PathType::File {
            return Err(TaskError::PathConflict {
                path: request.dest_path.clone(),
            });
        }

        let src_root = with_trailing_slash(&request.source_path);
        let dst_root = with_trailing_slash(&request.dest_path);
        match direction {
            Direction::Upload => self.put_tree(&src_root, &dst_root, root_meta),
            Direction::Download => self.get_tree(&src_root, &dst_root, root_meta),
        }
    }

    /// 上传目录树
    fn put_tree(&mut self, src_root: &str, dst_root: &str, root_meta: FileMeta) -> Result<(), TaskError> {
        let entries = self.local_tree(src_root, dst_root, root_meta)?;
        self.apply_tree(&entries, Direction::Upload)
    }

    /// 下载目录树
    fn get_tree(&mut self, src_root: &str, dst_root: &str, root_meta: FileMeta) -> Result<(), TaskError> {
        let entries = self.remote_tree(src_root, dst_root, root_meta)?;
        self.apply_tree(&entries, Direction::Download)
    }

    /// 按顺序写入目标端，目录先于其中的文件
    fn apply_tree(&mut self, entries: &[TreeEntry], direction: Direction) -> Result<(), TaskError> {
        let dst_side = direction.dest_side();
        self.check_conflicts(entries, dst_side)?;
        for entry in entries {
            match entry.kind {
                PathType::Directory => self.ensure_dir(&entry.dest, dst_side, Some(entry.meta))?,
                _ => self.transfer_file(&entry.source, &entry.dest, &entry.meta, direction)?,
            }
        }
        Ok(())
    }

    /// 本地源目录树：只遍历一次，目录先于其中的文件
    fn local_tree(
        &self,
        src_root: &str,
        dst_root: &str,
        root_meta: FileMeta,
    ) -> Result<Vec<TreeEntry>, TaskError> {
        let mut entries = vec![TreeEntry {
            source: src_root.to_string(),
            dest: dst_root.to_string(),
            kind: PathType::Directory,
            meta: root_meta,
        }];
        for entry in self.scanner.walk_local(src_root) {
            let entry = entry.map_err(|e| TaskError::local(src_root, e))?;
            entries.push(TreeEntry {
                dest: join_path(dst_root, &entry.relative),
                source: entry.path,
                kind: entry.kind,
                meta: entry.meta,
            });
        }
        Ok(entries)
    }

    /// 远程源目录树：用显式的待处理目录栈代替递归，顺序与本地遍历一致
    fn remote_tree(
        &self,
        src_root: &str,
        dst_root: &str,
        root_meta: FileMeta,
    ) -> Result<Vec<TreeEntry>, TaskError> {
        let remote = self.oracle.storage(Side::Remote);
        let mut entries = Vec::new();
        let mut pending = vec![(src_root.to_string(), root_meta)];

        while let Some((remote_dir, attrs)) = pending.pop() {
            let relative = &remote_dir[src_root.len()..];
            let local_dir = format!("{}{}", dst_root, relative);

            let listing = remote
                .list_dir(&remote_dir)
                .map_err(|e| TaskError::remote(remote_dir.as_str(), e))?;

            let mut files = Vec::new();
            let mut subdirs = Vec::new();
            for item in listing {
                if self.scanner.skips(&item.name) {
                    continue;
                }
                let source = join_path(&remote_dir, &item.name);
                match item.kind {
                    PathType::Directory => subdirs.push((with_trailing_slash(&source), item.meta)),
                    PathType::File => files.push(TreeEntry {
                        dest: join_path(&local_dir, &item.name),
                        source,
                        kind: PathType::File,
                        meta: item.meta,
                    }),
                    PathType::Absent => {}
                }
            }

            entries.push(TreeEntry {
                source: remote_dir,
                dest: local_dir,
                kind: PathType::Directory,
                meta: attrs,
            });
            entries.extend(files);
            // 逆序入栈，保持按名称顺序处理
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(entries)
    }

    /// 目标端已有同名但类型不同的条目（目录处是文件，或文件处是目录）
    fn check_conflicts(&self, entries: &[TreeEntry], side: Side) -> Result<(), TaskError> {
        for entry in entries {
            let dest = trim_dir(&entry.dest);
            let existing = self.oracle.classify(dest, side)?;
            let conflict = match entry.kind {
                PathType::Directory => existing == PathType::File,
                _ => existing == PathType::Directory,
            };
            if conflict {
                return Err(TaskError::PathConflict {
                    path: dest.to_string(),
                });
            }
        }
        Ok(())
    }

    /// 确保目录存在，缺失的上级目录一并创建
    ///
    /// 路径上任何一级是普通文件都会返回 `PathConflict`，不做任何写入。
    /// 创建时若已被其他操作抢先创建（已存在且是目录），视为成功。
    /// 将要写入的已有目录如果属主不可写，先放开写权限，同步结束后恢复。
    fn ensure_dir(&mut self, path: &str, side: Side, attrs: Option<FileMeta>) -> Result<(), TaskError> {
        let target = trim_dir(path);
        if target.is_empty() {
            return Ok(());
        }

        let mut missing = Vec::new();
        let mut anchor = None;
        let mut cursor = Some(target.to_string());
        while let Some(current) = cursor {
            match self.oracle.lookup(&current, side)? {
                Some(stat) if stat.kind == PathType::Directory => {
                    anchor = Some((current, stat.meta.mode));
                    break;
                }
                Some(_) => return Err(TaskError::PathConflict { path: current }),
                None => {
                    cursor = parent_path(&current);
                    missing.push(current);
                }
            }
        }

        let storage = self.oracle.storage(side);
        if let Some((dir, mode)) = anchor {
            if owner_read_only(mode) {
                match storage.set_mode(&dir, mode | 0o200) {
                    Ok(()) => {
                        debug!("临时放开目录写权限: {}", dir);
                        self.restores.push(DirRestore {
                            path: dir,
                            side,
                            mode,
                            times: None,
                        });
                    }
                    // 放不开时交给随后的写入报告真正的错误
                    Err(e) => debug!("无法修改目录权限 {}: {}", dir, e),
                }
            }
        }

        for dir in missing.iter().rev() {
            self.output
                .push(format!("        ----Create {} Dir: {}", side, dir));
            if let Err(e) = storage.create_dir(dir) {
                if self.oracle.classify(dir, side)? != PathType::Directory {
                    return Err(match side {
                        Side::Local => TaskError::local(dir.as_str(), e),
                        Side::Remote => TaskError::remote(dir.as_str(), e),
                    });
                }
                debug!("目录已被创建: {}", dir);
            }
            self.report.dirs_created += 1;
        }

        if let Some(attrs) = attrs {
            if missing.first().map(String::as_str) == Some(target) {
                self.restores.push(DirRestore {
                    path: target.to_string(),
                    side,
                    mode: attrs.mode,
                    times: Some((attrs.atime, attrs.mtime)),
                });
            }
        }
        Ok(())
    }

    /// 单个文件：按大小和整秒 mtime 判断是否需要传输，传输后恢复时间和权限
    fn transfer_file(
        &mut self,
        source: &str,
        dest: &str,
        src_meta: &FileMeta,
        direction: Direction,
    ) -> Result<(), TaskError> {
        let dst_side = direction.dest_side();
        let dest_meta = match self.oracle.lookup(dest, dst_side)? {
            Some(stat) if stat.kind == PathType::Directory => {
                return Err(TaskError::PathConflict {
                    path: dest.to_string(),
                })
            }
            Some(stat) => Some(stat.meta),
            None => None,
        };

        let relation = compare_files(src_meta, dest_meta.as_ref());
        if !relation.needs_transfer() {
            debug!("文件未变化，跳过: {}", source);
            self.report.files_skipped += 1;
            return Ok(());
        }

        debug!("传输 {} -> {} ({:?})", source, dest, relation);
        let storage = self.oracle.storage(dst_side);
        if let Some(meta) = dest_meta.filter(|m| owner_read_only(m.mode)) {
            // 上次同步带过来的只读权限，覆盖前先放开，写完后设为源文件的权限
            if let Err(e) = storage.set_mode(dest, meta.mode | 0o200) {
                debug!("无法修改文件权限 {}: {}", dest, e);
            }
        }

        let transfer_err = |e: io::Error| TaskError::Transfer {
            path: source.to_string(),
            source: e,
        };
        let bytes = self.copy_file(source, dest, direction).map_err(transfer_err)?;

        storage
            .set_times(dest, src_meta.atime, src_meta.mtime)
            .and_then(|_| storage.set_mode(dest, src_meta.mode))
            .map_err(transfer_err)?;

        self.output.push(format!("{}{}", " ".repeat(12), source));
        self.report.files_transferred += 1;
        self.report.bytes_transferred += bytes;
        Ok(())
    }

    fn copy_file(&self, source: &str, dest: &str, direction: Direction) -> io::Result<u64> {
        let from = self.oracle.storage(direction.source_side());
        let to = self.oracle.storage(direction.dest_side());

        let mut reader = from.open_read(source)?;
        let mut writer = to.open_write(dest)?;
        let bytes = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        Ok(bytes)
    }

    /// 恢复目录的权限和时间，最深（最后记录）的目录先处理
    fn restore_dir_attrs(&mut self) -> Result<(), TaskError> {
        for dir in std::mem::take(&mut self.restores).into_iter().rev() {
            let storage = self.oracle.storage(dir.side);
            storage
                .set_mode(&dir.path, dir.mode)
                .and_then(|_| match dir.times {
                    Some((atime, mtime)) => storage.set_times(&dir.path, atime, mtime),
                    None => Ok(()),
                })
                .map_err(|e| match dir.side {
                    Side::Local => TaskError::local(dir.path.as_str(), e),
                    Side::Remote => TaskError::remote(dir.path.as_str(), e),
                })?;
        }
        Ok(())
    }
}
