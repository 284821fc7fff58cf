use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 运行期间共享的取消标志
///
/// 只会被设置一次，之后不会复位。已经开始的主机任务不受影响，
/// 只有尚未启动的任务会被跳过。
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Flags>,
}

#[derive(Debug, Default)]
struct Flags {
    cancelled: AtomicBool,
    interrupted: AtomicBool,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置取消标志，只有第一次调用返回 `true`
    pub fn cancel(&self) -> bool {
        self.inner
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// 用户中断（Ctrl-C），同时设置取消标志
    ///
    /// 只有第一次中断返回 `true`；再次中断时调用方应直接退出。
    pub fn interrupt(&self) -> bool {
        let first = self
            .inner
            .interrupted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.cancel();
        first
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_once_and_shared() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());

        assert!(other.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert!(!token.is_interrupted());
    }

    #[test]
    fn test_interrupt_implies_cancel() {
        let token = CancellationToken::new();
        assert!(token.interrupt());
        assert!(token.is_cancelled());
        assert!(token.is_interrupted());
    }

    #[test]
    fn test_second_interrupt_is_reported() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(token.interrupt());
        assert!(!token.clone().interrupt());
        assert!(token.is_interrupted());
    }
}
