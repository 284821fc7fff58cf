use crate::storage::FileMeta;

/// 文件比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    /// 目标不存在
    Missing,
    /// 大小与整秒修改时间都相同
    Equal,
    /// 大小不同
    SizeDiffers,
    /// 大小相同但修改时间不同
    TimeDiffers,
}

impl FileRelation {
    pub fn needs_transfer(self) -> bool {
        !matches!(self, FileRelation::Equal)
    }
}

/// 比较源文件与目标文件
///
/// 只看大小和整秒 mtime，不做内容校验：目的是跳过未变化的文件，
/// 而不是检测损坏。
pub fn compare_files(source: &FileMeta, dest: Option<&FileMeta>) -> FileRelation {
    let Some(dest) = dest else {
        return FileRelation::Missing;
    };

    if source.size != dest.size {
        tracing::debug!("文件大小不同 (src={}, dst={})", source.size, dest.size);
        return FileRelation::SizeDiffers;
    }

    if source.mtime != dest.mtime {
        tracing::debug!(
            "文件时间不同 (src_time={}, dst_time={})",
            source.mtime,
            dest.mtime
        );
        return FileRelation::TimeDiffers;
    }

    FileRelation::Equal
}

/// 是否需要传输
pub fn needs_transfer(source: &FileMeta, dest: Option<&FileMeta>) -> bool {
    compare_files(source, dest).needs_transfer()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64, mtime: i64) -> FileMeta {
        FileMeta {
            size,
            mtime,
            atime: mtime,
            mode: 0o644,
        }
    }

    #[test]
    fn test_equal_size_and_second_skips() {
        let src = meta(10, 1_700_000_000);
        let dst = meta(10, 1_700_000_000);
        assert!(!needs_transfer(&src, Some(&dst)));
        assert_eq!(compare_files(&src, Some(&dst)), FileRelation::Equal);
    }

    #[test]
    fn test_missing_dest_always_transfers() {
        assert!(needs_transfer(&meta(0, 0), None));
    }

    #[test]
    fn test_one_second_or_one_byte_transfers() {
        let src = meta(10, 1_700_000_000);
        assert!(needs_transfer(&src, Some(&meta(10, 1_700_000_001))));
        assert!(needs_transfer(&src, Some(&meta(10, 1_699_999_999))));
        assert!(needs_transfer(&src, Some(&meta(11, 1_700_000_000))));
    }

    #[test]
    fn test_mode_and_atime_do_not_matter() {
        let src = meta(5, 100);
        let mut dst = meta(5, 100);
        dst.atime = 42;
        dst.mode = 0o600;
        assert!(!needs_transfer(&src, Some(&dst)));
    }
}
