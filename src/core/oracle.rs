//! 路径分类
//!
//! 同时持有本地和远程两端的 [`Storage`]，按 [`Side`] 分派。
//! “不存在”是正常的分类结果，不是错误；其他访问失败按所在一端
//! 转换为 `LocalIo` / `RemoteIo`。

use crate::error::TaskError;
use crate::storage::{FileMeta, PathStat, PathType, Side, Storage};

pub struct PathOracle<'a> {
    local: &'a dyn Storage,
    remote: &'a dyn Storage,
}

impl<'a> PathOracle<'a> {
    pub fn new(local: &'a dyn Storage, remote: &'a dyn Storage) -> Self {
        Self { local, remote }
    }

    pub fn storage(&self, side: Side) -> &'a dyn Storage {
        match side {
            Side::Local => self.local,
            Side::Remote => self.remote,
        }
    }

    /// 查询路径状态
    pub fn lookup(&self, path: &str, side: Side) -> Result<Option<PathStat>, TaskError> {
        self.storage(side).lookup(path).map_err(|e| match side {
            Side::Local => TaskError::local(path, e),
            Side::Remote => TaskError::remote(path, e),
        })
    }

    pub fn classify(&self, path: &str, side: Side) -> Result<PathType, TaskError> {
        Ok(self
            .lookup(path, side)?
            .map_or(PathType::Absent, |stat| stat.kind))
    }

    /// 获取文件元数据，路径不存在时返回 `None`
    pub fn stat(&self, path: &str, side: Side) -> Result<Option<FileMeta>, TaskError> {
        Ok(self.lookup(path, side)?.map(|stat| stat.meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_classify_both_sides() {
        let local_dir = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        fs::write(local_dir.path().join("a.txt"), b"abc").unwrap();
        fs::create_dir(remote_dir.path().join("srv")).unwrap();

        let local = LocalStorage::rooted(local_dir.path());
        let remote = LocalStorage::rooted(remote_dir.path());
        let oracle = PathOracle::new(&local, &remote);

        assert_eq!(oracle.classify("/a.txt", Side::Local).unwrap(), PathType::File);
        assert_eq!(oracle.classify("/a.txt", Side::Remote).unwrap(), PathType::Absent);
        assert_eq!(
            oracle.classify("/srv", Side::Remote).unwrap(),
            PathType::Directory
        );
        assert_eq!(oracle.stat("/a.txt", Side::Local).unwrap().unwrap().size, 3);
        assert!(oracle.stat("/nope", Side::Local).unwrap().is_none());
    }
}
